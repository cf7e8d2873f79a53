// Map registry and map header layout.
//
// Segment header (offset 0):
// [MAGIC: 8][VERSION: 8][SESSION: 8][MAPS_ROOT: 8]
// MAPS_ROOT - offset of the AVL root map header, 0 when no maps exist.
//
// Map header (raw-allocated, never freed, AVL-indexed by name):
// [AVL_LEFT: 8][AVL_RIGHT: 8][AVL_HEIGHT: 1]
// [ASESSION: 8][STATIC_KEY_SIZE: 8][DTRM_SEED: 8]
// [TARGET_IPP: 2][FREE_END_CLASS: 1]
// [ROOT: 8 x 8][FREE_LIST: 48 x 8]
// [LVL_STATS: 8 x 32][CLASS_COUNT: 48 x 8]
// [NAME_LEN: 2][NAME: NAME_LEN]
//
// STATIC_KEY_SIZE is reserved and always zero.

use crate::acid::{read_u16, read_u64, write_u16, write_u64, Acid};
use crate::error::Result;
use crate::vm;

pub const MAGIC: u64 = 0x6aef_91b6_b454_b73f;
pub const VERSION: u64 = 4;

/// Skip list levels. Level 0 holds the data; levels above thin out by a
/// factor of the target ipp each.
pub(crate) const LEVELS: usize = 8;
/// Allocator size classes.
pub(crate) const CLASSES: usize = 48;

pub(crate) const HDR_MAGIC: u64 = 0;
pub(crate) const HDR_VERSION: u64 = 8;
pub(crate) const HDR_SESSION: u64 = 16;
pub(crate) const HDR_MAPS_ROOT: u64 = 24;
pub(crate) const HDR_SIZE: u64 = 32;

const MAP_AVL_LEFT: u64 = 0;
const MAP_AVL_RIGHT: u64 = 8;
const MAP_AVL_HEIGHT: u64 = 16;
const MAP_ASESSION: u64 = 17;
const MAP_DTRM_SEED: u64 = 33;
const MAP_TARGET_IPP: u64 = 41;
const MAP_FREE_END_CLASS: u64 = 43;
const MAP_ROOT: u64 = 44;
const MAP_FREE_LIST: u64 = 108;
pub(crate) const MAP_LVL_STATS: u64 = 492;
pub(crate) const MAP_CLASS_COUNT: u64 = 748;
const MAP_NAME_LEN: u64 = 1132;
const MAP_NAME: u64 = 1134;

pub(crate) fn header_size(name_len: usize) -> u64 {
	MAP_NAME + name_len as u64
}

pub(crate) fn root(seg: &[u8], map: u64, level: u8) -> u64 {
	read_u64(seg, map + MAP_ROOT + level as u64 * 8)
}

pub(crate) fn set_root(seg: &mut [u8], map: u64, level: u8, part: u64) {
	write_u64(seg, map + MAP_ROOT + level as u64 * 8, part)
}

pub(crate) fn free_list(seg: &[u8], map: u64, class: u8) -> u64 {
	read_u64(seg, map + MAP_FREE_LIST + class as u64 * 8)
}

pub(crate) fn set_free_list(seg: &mut [u8], map: u64, class: u8, head: u64) {
	write_u64(seg, map + MAP_FREE_LIST + class as u64 * 8, head)
}

pub(crate) fn free_end_class(seg: &[u8], map: u64) -> u8 {
	seg[(map + MAP_FREE_END_CLASS) as usize]
}

pub(crate) fn set_free_end_class(seg: &mut [u8], map: u64, class: u8) {
	seg[(map + MAP_FREE_END_CLASS) as usize] = class;
}

pub(crate) fn target_ipp(seg: &[u8], map: u64) -> u16 {
	read_u16(seg, map + MAP_TARGET_IPP)
}

pub(crate) fn set_target_ipp(seg: &mut [u8], map: u64, ipp: u16) {
	write_u16(seg, map + MAP_TARGET_IPP, ipp)
}

pub(crate) fn dtrm_seed(seg: &[u8], map: u64) -> u64 {
	read_u64(seg, map + MAP_DTRM_SEED)
}

pub(crate) fn set_dtrm_seed(seg: &mut [u8], map: u64, seed: u64) {
	write_u64(seg, map + MAP_DTRM_SEED, seed)
}

pub(crate) fn set_asession(seg: &mut [u8], map: u64, session: u64) {
	write_u64(seg, map + MAP_ASESSION, session)
}

pub(crate) fn name(seg: &[u8], map: u64) -> &[u8] {
	let len = read_u16(seg, map + MAP_NAME_LEN) as usize;
	let start = (map + MAP_NAME) as usize;
	&seg[start..start + len]
}

fn avl_left(seg: &[u8], node: u64) -> u64 {
	read_u64(seg, node + MAP_AVL_LEFT)
}

fn avl_right(seg: &[u8], node: u64) -> u64 {
	read_u64(seg, node + MAP_AVL_RIGHT)
}

fn avl_height(seg: &[u8], node: u64) -> i32 {
	if node == 0 {
		0
	} else {
		seg[(node + MAP_AVL_HEIGHT) as usize] as i32
	}
}

fn avl_fix_height(seg: &mut [u8], node: u64) {
	let h = 1 + avl_height(seg, avl_left(seg, node)).max(avl_height(seg, avl_right(seg, node)));
	seg[(node + MAP_AVL_HEIGHT) as usize] = h as u8;
}

fn avl_balance(seg: &[u8], node: u64) -> i32 {
	avl_height(seg, avl_left(seg, node)) - avl_height(seg, avl_right(seg, node))
}

fn avl_rotate_right(seg: &mut [u8], node: u64) -> u64 {
	let pivot = avl_left(seg, node);
	write_u64(seg, node + MAP_AVL_LEFT, avl_right(seg, pivot));
	write_u64(seg, pivot + MAP_AVL_RIGHT, node);
	avl_fix_height(seg, node);
	avl_fix_height(seg, pivot);
	pivot
}

fn avl_rotate_left(seg: &mut [u8], node: u64) -> u64 {
	let pivot = avl_right(seg, node);
	write_u64(seg, node + MAP_AVL_RIGHT, avl_left(seg, pivot));
	write_u64(seg, pivot + MAP_AVL_LEFT, node);
	avl_fix_height(seg, node);
	avl_fix_height(seg, pivot);
	pivot
}

fn avl_rebalance(seg: &mut [u8], node: u64) -> u64 {
	avl_fix_height(seg, node);
	let balance = avl_balance(seg, node);
	if balance > 1 {
		if avl_balance(seg, avl_left(seg, node)) < 0 {
			let rotated = avl_rotate_left(seg, avl_left(seg, node));
			write_u64(seg, node + MAP_AVL_LEFT, rotated);
		}
		avl_rotate_right(seg, node)
	} else if balance < -1 {
		if avl_balance(seg, avl_right(seg, node)) > 0 {
			let rotated = avl_rotate_right(seg, avl_right(seg, node));
			write_u64(seg, node + MAP_AVL_RIGHT, rotated);
		}
		avl_rotate_left(seg, node)
	} else {
		node
	}
}

/// Maps are only ever inserted; the registry has no remove.
fn avl_insert(seg: &mut [u8], root: u64, node: u64) -> u64 {
	if root == 0 {
		seg[(node + MAP_AVL_HEIGHT) as usize] = 1;
		return node;
	}
	let node_name = name(seg, node).to_vec();
	if node_name.as_slice() < name(seg, root) {
		let new_left = avl_insert(seg, avl_left(seg, root), node);
		write_u64(seg, root + MAP_AVL_LEFT, new_left);
	} else {
		let new_right = avl_insert(seg, avl_right(seg, root), node);
		write_u64(seg, root + MAP_AVL_RIGHT, new_right);
	}
	avl_rebalance(seg, root)
}

/// Finds the header offset of a named map.
pub(crate) fn find(seg: &[u8], map_name: &[u8]) -> Option<u64> {
	let mut node = read_u64(seg, HDR_MAPS_ROOT);
	while node != 0 {
		match map_name.cmp(name(seg, node)) {
			std::cmp::Ordering::Equal => return Some(node),
			std::cmp::Ordering::Less => node = avl_left(seg, node),
			std::cmp::Ordering::Greater => node = avl_right(seg, node),
		}
	}
	None
}

/// In-order walk of the registry, used for aggregated status.
pub(crate) fn list(seg: &[u8]) -> Vec<u64> {
	let mut out = Vec::new();
	fn walk(seg: &[u8], node: u64, out: &mut Vec<u64>) {
		if node == 0 {
			return;
		}
		walk(seg, avl_left(seg, node), out);
		out.push(node);
		walk(seg, avl_right(seg, node), out);
	}
	walk(seg, read_u64(seg, HDR_MAPS_ROOT), &mut out);
	out
}

/// Allocates and registers a fresh zeroed map header. The caller initializes
/// tuning fields and root partitions.
pub(crate) fn register(acid: &mut Acid, map_name: &[u8]) -> Result<u64> {
	debug_assert!(find(acid.memory(), map_name).is_none());
	let off = vm::mmap_raw(acid, header_size(map_name.len()))?;
	let seg = acid.memory_mut();
	for i in 0..header_size(map_name.len()) {
		seg[(off + i) as usize] = 0;
	}
	write_u16(seg, off + MAP_NAME_LEN, map_name.len() as u16);
	let start = (off + MAP_NAME) as usize;
	seg[start..start + map_name.len()].copy_from_slice(map_name);
	let root = read_u64(seg, HDR_MAPS_ROOT);
	let new_root = avl_insert(seg, root, off);
	write_u64(seg, HDR_MAPS_ROOT, new_root);
	log::debug!(target: "quark", "Registered map {:?} at {}", String::from_utf8_lossy(map_name), off);
	Ok(off)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::acid::Acid;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("quark-test");
			path.push("map");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn acid(&self) -> Acid {
			Acid::open(&self.0.join("seg")).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	#[test]
	fn register_and_find() {
		let dir = TempDir::new("register_and_find");
		let mut acid = dir.acid();
		// Insertion order stresses the rotations: sorted run, then reversed.
		let names: Vec<String> = (0..32)
			.map(|i| format!("map-{:02}", i))
			.chain((0..32).rev().map(|i| format!("rev-{:02}", i)))
			.collect();
		let mut offs = Vec::new();
		for n in &names {
			offs.push(register(&mut acid, n.as_bytes()).unwrap());
		}
		for (n, off) in names.iter().zip(&offs) {
			assert_eq!(find(acid.memory(), n.as_bytes()), Some(*off));
			assert_eq!(name(acid.memory(), *off), n.as_bytes());
		}
		assert_eq!(find(acid.memory(), b"absent"), None);
		let listed = list(acid.memory());
		assert_eq!(listed.len(), names.len());
		let mut sorted: Vec<&[u8]> = names.iter().map(|n| n.as_bytes()).collect();
		sorted.sort();
		let walked: Vec<&[u8]> = listed.iter().map(|off| name(acid.memory(), *off)).collect();
		assert_eq!(walked, sorted);
	}

	#[test]
	fn survives_reopen() {
		let dir = TempDir::new("survives_reopen");
		{
			let mut acid = dir.acid();
			register(&mut acid, b"alpha").unwrap();
			register(&mut acid, b"beta").unwrap();
			acid.close().unwrap();
		}
		let acid = dir.acid();
		assert!(find(acid.memory(), b"alpha").is_some());
		assert!(find(acid.memory(), b"beta").is_some());
		assert!(find(acid.memory(), b"gamma").is_none());
	}
}
