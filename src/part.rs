// On-segment partition layout.
//
// [ header, sorted index -->, gap, <-- data tail ]
//
// Header:
// [TOTAL_SIZE: 8][N_KEYS: 4][DATA_SIZE: 8]
// TOTAL_SIZE - partition size in bytes, always the power of two it was
// carved as.
// N_KEYS - number of index records.
// DATA_SIZE - bytes used by the data tail.
//
// Index record (sorted ascending by key, grows up from the header):
// [KEYLEN: 2][KEYOFF: 8]
// KEYOFF - segment offset of the key bytes inside this partition's tail.
//
// Tail entry, written back to front:
// level 0:  [KEY][VALUELEN: 8][VALUE]
// level 1+: [KEY][DOWN: 8]
// DOWN - offset of the partition on the level below whose first key equals
// this record's key.

use crate::acid::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, Acid};
use crate::error::Result;
use crate::stats;
use crate::vm;

pub(crate) const PART_HDR: u64 = 20;
pub(crate) const IDX_SIZE: u64 = 10;

pub(crate) fn total_size(seg: &[u8], part: u64) -> u64 {
	read_u64(seg, part)
}

pub(crate) fn set_total_size(seg: &mut [u8], part: u64, v: u64) {
	write_u64(seg, part, v)
}

pub(crate) fn n_keys(seg: &[u8], part: u64) -> u32 {
	read_u32(seg, part + 8)
}

pub(crate) fn set_n_keys(seg: &mut [u8], part: u64, v: u32) {
	write_u32(seg, part + 8, v)
}

pub(crate) fn data_size(seg: &[u8], part: u64) -> u64 {
	read_u64(seg, part + 12)
}

pub(crate) fn set_data_size(seg: &mut [u8], part: u64, v: u64) {
	write_u64(seg, part + 12, v)
}

fn idx_off(part: u64, i: u32) -> u64 {
	part + PART_HDR + i as u64 * IDX_SIZE
}

pub(crate) fn keylen(seg: &[u8], part: u64, i: u32) -> u16 {
	read_u16(seg, idx_off(part, i))
}

pub(crate) fn keyoff(seg: &[u8], part: u64, i: u32) -> u64 {
	read_u64(seg, idx_off(part, i) + 2)
}

pub(crate) fn set_idx(seg: &mut [u8], part: u64, i: u32, klen: u16, koff: u64) {
	write_u16(seg, idx_off(part, i), klen);
	write_u64(seg, idx_off(part, i) + 2, koff);
}

pub(crate) fn key_at<'a>(seg: &'a [u8], part: u64, i: u32) -> &'a [u8] {
	let off = keyoff(seg, part, i) as usize;
	&seg[off..off + keylen(seg, part, i) as usize]
}

/// Offset of the down word of a level 1+ record.
pub(crate) fn down_slot(seg: &[u8], part: u64, i: u32) -> u64 {
	keyoff(seg, part, i) + keylen(seg, part, i) as u64
}

pub(crate) fn down(seg: &[u8], part: u64, i: u32) -> u64 {
	read_u64(seg, down_slot(seg, part, i))
}

/// Offset and length of a level 0 record's value.
pub(crate) fn value_range(seg: &[u8], part: u64, i: u32) -> (u64, u64) {
	let len_off = keyoff(seg, part, i) + keylen(seg, part, i) as u64;
	(len_off + 8, read_u64(seg, len_off))
}

/// First allocated byte of the data tail.
pub(crate) fn write0(seg: &[u8], part: u64) -> u64 {
	part + total_size(seg, part) - data_size(seg, part)
}

pub(crate) fn free_space(seg: &[u8], part: u64) -> u64 {
	total_size(seg, part) - PART_HDR - n_keys(seg, part) as u64 * IDX_SIZE - data_size(seg, part)
}

/// Bytes needed to store a key/value entry at a level, index record included.
pub(crate) fn space_kv(level: u8, key: &[u8], value: &[u8]) -> u64 {
	let mut size = IDX_SIZE + key.len() as u64;
	if level > 0 {
		size += 8;
	} else {
		size += 8 + value.len() as u64;
	}
	size
}

/// Tail bytes of an existing record (key, plus down word or valuelen+value).
pub(crate) fn space_idx_data(seg: &[u8], level: u8, part: u64, i: u32) -> u64 {
	let mut space = keylen(seg, part, i) as u64;
	if level > 0 {
		space += 8;
	} else {
		let (_, vlen) = value_range(seg, part, i);
		space += 8 + vlen;
	}
	space
}

pub(crate) fn space_range(seg: &[u8], level: u8, part: u64, i0: u32, i1: u32) -> u64 {
	let mut space = 0;
	for i in i0..i1 {
		space += IDX_SIZE + space_idx_data(seg, level, part, i);
	}
	space
}

/// Binary search over the packed index. Returns the record position on a
/// match, otherwise the position the key would be inserted at.
pub(crate) fn search(seg: &[u8], part: u64, key: &[u8]) -> (bool, u32) {
	let mut lo = 0u32;
	let mut hi = n_keys(seg, part);
	while lo < hi {
		let mid = lo + (hi - lo) / 2;
		match key_at(seg, part, mid).cmp(key) {
			std::cmp::Ordering::Less => lo = mid + 1,
			std::cmp::Ordering::Greater => hi = mid,
			std::cmp::Ordering::Equal => return (true, mid),
		}
	}
	(false, lo)
}

/// Allocates a new empty partition with room for `req_space` payload bytes.
pub(crate) fn alloc_new(acid: &mut Acid, map: u64, level: u8, req_space: u64) -> Result<u64> {
	let (off, size, class) = vm::alloc(acid, map, PART_HDR + req_space)?;
	let seg = acid.memory_mut();
	set_total_size(seg, off, size);
	set_n_keys(seg, off, 0);
	set_data_size(seg, off, 0);
	stats::on_part_alloc(seg, map, level, size, class);
	Ok(off)
}

/// Frees a no longer referenced partition.
pub(crate) fn free_part(acid: &mut Acid, map: u64, level: u8, part: u64) -> Result<()> {
	let size = total_size(acid.memory(), part);
	let class = vm::free(acid, map, part, size)?;
	stats::on_part_free(acid.memory_mut(), map, level, size, class);
	Ok(())
}

/// Writes entry data to the tail below `write0`. Returns the new tail start
/// and, for level 1+, the offset of the reserved down word.
pub(crate) fn write_entry_data(seg: &mut [u8], level: u8, write0: u64, key: &[u8], value: &[u8]) -> (u64, Option<u64>) {
	let mut d = write0;
	let mut down_r = None;
	if level > 0 {
		// The down partition is not resolved yet; the caller writes the slot.
		d -= 8;
		write_u64(seg, d, 0);
		down_r = Some(d);
	} else {
		d -= value.len() as u64;
		seg[d as usize..(d as usize + value.len())].copy_from_slice(value);
		d -= 8;
		write_u64(seg, d, value.len() as u64);
	}
	d -= key.len() as u64;
	seg[d as usize..(d as usize + key.len())].copy_from_slice(key);
	(d, down_r)
}

/// Inserts an entry at index position `idx_t`, shifting later records right.
/// The caller is responsible for picking the position that keeps the index
/// sorted and for ensuring the partition has room.
///
/// Returns the left and right down slot offsets for level 1+: right is the
/// slot reserved in the new entry, left belongs to the record immediately
/// before the insertion point (`None` when inserting at the front).
pub(crate) fn insert_entry(
	seg: &mut [u8], map: u64, level: u8,
	part: u64, idx_t: u32,
	key: &[u8], value: &[u8],
) -> (Option<u64>, Option<u64>) {
	let w0 = write0(seg, part);
	let (write_d, down_r) = write_entry_data(seg, level, w0, key, value);
	let n = n_keys(seg, part);
	debug_assert!(idx_t <= n);
	if idx_t < n {
		let src = idx_off(part, idx_t) as usize;
		let end = idx_off(part, n) as usize;
		seg.copy_within(src..end, src + IDX_SIZE as usize);
	}
	debug_assert!(idx_off(part, n + 1) <= write_d);
	set_idx(seg, part, idx_t, key.len() as u16, write_d);
	let data_alloc = w0 - write_d;
	set_n_keys(seg, part, n + 1);
	set_data_size(seg, part, data_size(seg, part) + data_alloc);
	stats::on_insert_entry(seg, map, level, data_alloc);
	let down_l = if level > 0 && idx_t > 0 {
		Some(down_slot(seg, part, idx_t - 1))
	} else {
		None
	};
	(down_l, down_r)
}

/// Appends the records `[i0, i1)` of `src` to `dst`, preserving order. Used
/// by hard splits; the entries were already accounted for, so statistics are
/// untouched.
pub(crate) fn insert_entry_range(seg: &mut [u8], level: u8, dst: u64, src: u64, i0: u32, i1: u32) {
	let w0 = write0(seg, dst);
	let mut write_d = w0;
	let mut di = n_keys(seg, dst);
	for si in i0..i1 {
		let dsize = space_idx_data(seg, level, src, si);
		write_d -= dsize;
		let koff = keyoff(seg, src, si) as usize;
		seg.copy_within(koff..koff + dsize as usize, write_d as usize);
		debug_assert!(idx_off(dst, di + 1) <= write_d);
		set_idx(seg, dst, di, keylen(seg, src, si), write_d);
		di += 1;
	}
	set_n_keys(seg, dst, di);
	set_data_size(seg, dst, data_size(seg, dst) + (w0 - write_d));
}

/// Replaces `part` with a larger partition that has at least `req_space`
/// free bytes. The tail is copied verbatim and every key offset is rebased.
/// External references to the partition are the caller's to update.
pub(crate) fn realloc(acid: &mut Acid, map: u64, level: u8, part: u64, req_space: u64) -> Result<u64> {
	let seg = acid.memory();
	let old_total = total_size(seg, part);
	let old_data = data_size(seg, part);
	let old_n = n_keys(seg, part);
	let new_part = alloc_new(acid, map, level, old_total + req_space)?;
	let seg = acid.memory_mut();
	let new_total = total_size(seg, new_part);
	let src = part + old_total - old_data;
	let dst = new_part + new_total - old_data;
	seg.copy_within(src as usize..(src + old_data) as usize, dst as usize);
	let delta = dst as i64 - src as i64;
	for i in 0..old_n {
		let klen = keylen(seg, part, i);
		let koff = (keyoff(seg, part, i) as i64 + delta) as u64;
		set_idx(seg, new_part, i, klen, koff);
	}
	set_n_keys(seg, new_part, old_n);
	set_data_size(seg, new_part, old_data);
	free_part(acid, map, level, part)?;
	debug_assert!(free_space(acid.memory(), new_part) >= req_space);
	Ok(new_part)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::acid::Acid;
	use crate::map;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("quark-test");
			path.push("part");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn acid_with_map(&self) -> (Acid, u64) {
			let mut acid = Acid::open(&self.0.join("seg")).unwrap();
			let map = map::register(&mut acid, b"parttest").unwrap();
			(acid, map)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn insert_sorted(acid: &mut Acid, map: u64, part: u64, key: &[u8], value: &[u8]) {
		let (_, idx_t) = search(acid.memory(), part, key);
		insert_entry(acid.memory_mut(), map, 0, part, idx_t, key, value);
	}

	#[test]
	fn entries_stay_sorted() {
		let dir = TempDir::new("entries_stay_sorted");
		let (mut acid, map) = dir.acid_with_map();
		let part = alloc_new(&mut acid, map, 0, 512).unwrap();
		for key in ["mango", "apple", "pear", "banana", "cherry"].iter() {
			insert_sorted(&mut acid, map, part, key.as_bytes(), b"x");
		}
		let seg = acid.memory();
		assert_eq!(n_keys(seg, part), 5);
		let keys: Vec<&[u8]> = (0..5).map(|i| key_at(seg, part, i)).collect();
		assert_eq!(keys, vec![&b"apple"[..], b"banana", b"cherry", b"mango", b"pear"]);
		for i in 0..5 {
			let (voff, vlen) = value_range(seg, part, i);
			assert_eq!(&seg[voff as usize..(voff + vlen) as usize], b"x");
		}
	}

	#[test]
	fn search_insertion_points() {
		let dir = TempDir::new("search_insertion_points");
		let (mut acid, map) = dir.acid_with_map();
		let part = alloc_new(&mut acid, map, 0, 512).unwrap();
		for key in ["b", "d", "f"].iter() {
			insert_sorted(&mut acid, map, part, key.as_bytes(), b"v");
		}
		let seg = acid.memory();
		assert_eq!(search(seg, part, b"a"), (false, 0));
		assert_eq!(search(seg, part, b"b"), (true, 0));
		assert_eq!(search(seg, part, b"c"), (false, 1));
		assert_eq!(search(seg, part, b"d"), (true, 1));
		assert_eq!(search(seg, part, b"g"), (false, 3));
	}

	#[test]
	fn free_space_accounting() {
		let dir = TempDir::new("free_space_accounting");
		let (mut acid, map) = dir.acid_with_map();
		let part = alloc_new(&mut acid, map, 0, 100).unwrap();
		let total = total_size(acid.memory(), part);
		assert_eq!(free_space(acid.memory(), part), total - PART_HDR);
		insert_sorted(&mut acid, map, part, b"key", b"value");
		// 3 key bytes + 8 valuelen + 5 value bytes in the tail, 10 for the index.
		assert_eq!(data_size(acid.memory(), part), 16);
		assert_eq!(free_space(acid.memory(), part), total - PART_HDR - IDX_SIZE - 16);
	}

	#[test]
	fn down_slots_for_upper_levels() {
		let dir = TempDir::new("down_slots_for_upper_levels");
		let (mut acid, map) = dir.acid_with_map();
		let part = alloc_new(&mut acid, map, 1, 512).unwrap();
		let (down_l, down_r) = insert_entry(acid.memory_mut(), map, 1, part, 0, b"kk", b"");
		assert!(down_l.is_none());
		let down_r = down_r.unwrap();
		write_u64(acid.memory_mut(), down_r, 0x1234);
		assert_eq!(down(acid.memory(), part, 0), 0x1234);
		// A second entry in front returns the left slot of no one; appending
		// after it returns the first entry's slot as left.
		let (down_l, _) = insert_entry(acid.memory_mut(), map, 1, part, 1, b"zz", b"");
		assert_eq!(down_l, Some(down_slot(acid.memory(), part, 0)));
	}

	#[test]
	fn realloc_rebases_offsets() {
		let dir = TempDir::new("realloc_rebases_offsets");
		let (mut acid, map) = dir.acid_with_map();
		let part = alloc_new(&mut acid, map, 0, 64).unwrap();
		insert_sorted(&mut acid, map, part, b"alpha", b"1111");
		insert_sorted(&mut acid, map, part, b"beta", b"2222");
		let req = 4096;
		let new_part = realloc(&mut acid, map, 0, part, req).unwrap();
		let seg = acid.memory();
		assert!(free_space(seg, new_part) >= req);
		assert_eq!(n_keys(seg, new_part), 2);
		assert_eq!(key_at(seg, new_part, 0), b"alpha");
		assert_eq!(key_at(seg, new_part, 1), b"beta");
		let (voff, vlen) = value_range(seg, new_part, 1);
		assert_eq!(&seg[voff as usize..(voff + vlen) as usize], b"2222");
	}

	#[test]
	fn range_copy_preserves_order() {
		let dir = TempDir::new("range_copy_preserves_order");
		let (mut acid, map) = dir.acid_with_map();
		let src = alloc_new(&mut acid, map, 0, 512).unwrap();
		for key in ["a", "b", "c", "d"].iter() {
			insert_sorted(&mut acid, map, src, key.as_bytes(), b"val");
		}
		let dst = alloc_new(&mut acid, map, 0, 512).unwrap();
		insert_entry_range(acid.memory_mut(), 0, dst, src, 1, 3);
		let seg = acid.memory();
		assert_eq!(n_keys(seg, dst), 2);
		assert_eq!(key_at(seg, dst, 0), b"b");
		assert_eq!(key_at(seg, dst, 1), b"c");
		let (voff, vlen) = value_range(seg, dst, 1);
		assert_eq!(&seg[voff as usize..(voff + vlen) as usize], b"val");
	}
}
