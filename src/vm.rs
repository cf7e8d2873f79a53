// Buddy-style allocator over the segment tail.
//
// 48 power-of-two size classes starting at a 256 byte atom. Each map keeps
// its own free list heads in its header; a free block's first 8 bytes hold
// the offset of the next free block of the same class. Blocks are carved by
// halving a larger block; freed blocks are never coalesced, which trades
// fragmentation for simplicity of the persistent state.

use crate::acid::{read_u64, write_u64, Acid};
use crate::error::{Error, Result};
use crate::map::{self, CLASSES};

/// Smallest logical allocation: 2^8 = 256 bytes.
pub(crate) const ATOM_2E: u8 = 8;

/// Byte size of a size class.
pub(crate) fn class_bytes(class: u8) -> u64 {
	1u64 << (class as u32 + ATOM_2E as u32)
}

/// Size class whose blocks fit `bytes`, rounding up.
pub(crate) fn class_for(bytes: u64) -> u8 {
	if bytes <= class_bytes(0) {
		return 0;
	}
	let ceil_log2 = 64 - (bytes - 1).leading_zeros() as u8;
	ceil_log2 - ATOM_2E
}

/// Raw non-freeable allocation taken by extending the segment. Used for
/// structures that live forever, such as map headers.
pub(crate) fn mmap_raw(acid: &mut Acid, bytes: u64) -> Result<u64> {
	let off = acid.len();
	acid.expand(off + (bytes + 7) / 8 * 8)?;
	Ok(off)
}

fn push(seg: &mut [u8], map: u64, class: u8, block: u64) {
	debug_assert!(class < map::free_end_class(seg, map));
	let head = map::free_list(seg, map, class);
	write_u64(seg, block, head);
	map::set_free_list(seg, map, class, block);
}

fn pop(acid: &mut Acid, map: u64, class: u8) -> Result<u64> {
	let mut i = class;
	loop {
		let mut block;
		if i >= map::free_end_class(acid.memory(), map) {
			// Every list at or above `i` has never held a block; carve new
			// segment space instead.
			map::set_free_end_class(acid.memory_mut(), map, i + 1);
			block = acid.len();
			acid.expand(block + class_bytes(i))?;
		} else {
			let head = map::free_list(acid.memory(), map, i);
			if head == 0 {
				i += 1;
				continue;
			}
			let next = read_u64(acid.memory(), head);
			map::set_free_list(acid.memory_mut(), map, i, next);
			block = head;
		}
		// Halve down to the requested class, pushing the lower half of each
		// split; the returned block ends up at the top of the carved range.
		let mut block_len = class_bytes(i);
		let seg = acid.memory_mut();
		while i > class {
			i -= 1;
			push(seg, map, i, block);
			block_len /= 2;
			block += block_len;
		}
		return Ok(block);
	}
}

/// Allocates at least `bytes`. Returns the block offset, the usable size and
/// the size class it was carved from.
pub(crate) fn alloc(acid: &mut Acid, map: u64, bytes: u64) -> Result<(u64, u64, u8)> {
	let class = class_for(bytes);
	if class as usize >= CLASSES {
		return Err(Error::Corruption(format!("allocation of {} bytes beyond the last size class", bytes)));
	}
	let off = pop(acid, map, class)?;
	log::trace!(target: "quark", "Allocated class {} block at {}", class, off);
	Ok((off, class_bytes(class), class))
}

/// Returns a block to its class free list. `bytes` must be the size the
/// block was requested with (or its rounded class size).
pub(crate) fn free(acid: &mut Acid, map: u64, off: u64, bytes: u64) -> Result<u8> {
	let class = class_for(bytes);
	if class as usize >= CLASSES {
		return Err(Error::Corruption(format!("free of {} bytes beyond the last size class", bytes)));
	}
	push(acid.memory_mut(), map, class, off);
	log::trace!(target: "quark", "Freed class {} block at {}", class, off);
	Ok(class)
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
			path.push("vm");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn acid_with_map(&self) -> (Acid, u64) {
			let mut acid = Acid::open(&self.0.join("seg")).unwrap();
			let map = map::register(&mut acid, b"vmtest").unwrap();
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

	#[test]
	fn class_rounding() {
		assert_eq!(class_for(0), 0);
		assert_eq!(class_for(1), 0);
		assert_eq!(class_for(256), 0);
		assert_eq!(class_for(257), 1);
		assert_eq!(class_for(512), 1);
		assert_eq!(class_for(513), 2);
		assert_eq!(class_bytes(0), 256);
		assert_eq!(class_bytes(4), 4096);
	}

	#[test]
	fn alloc_reuse_after_free() {
		let dir = TempDir::new("alloc_reuse_after_free");
		let (mut acid, map) = dir.acid_with_map();
		let (a, size, class) = alloc(&mut acid, map, 100).unwrap();
		assert_eq!(size, 256);
		assert_eq!(class, 0);
		free(&mut acid, map, a, 256).unwrap();
		let (b, _, _) = alloc(&mut acid, map, 200).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn split_produces_disjoint_blocks() {
		let dir = TempDir::new("split_produces_disjoint_blocks");
		let (mut acid, map) = dir.acid_with_map();
		// Force a class 3 carve, then drain the class 0..3 halves it shed.
		let (big, size, _) = alloc(&mut acid, map, 1500).unwrap();
		assert_eq!(size, 2048);
		let mut blocks = vec![(big, size)];
		for _ in 0..8 {
			let (off, size, _) = alloc(&mut acid, map, 1).unwrap();
			blocks.push((off, size));
		}
		for (i, (off, size)) in blocks.iter().enumerate() {
			for (joff, jsize) in blocks.iter().skip(i + 1) {
				assert!(off + size <= *joff || joff + jsize <= *off, "blocks overlap");
			}
		}
	}

	#[test]
	fn free_end_class_is_monotonic() {
		let dir = TempDir::new("free_end_class_is_monotonic");
		let (mut acid, map) = dir.acid_with_map();
		assert_eq!(map::free_end_class(acid.memory(), map), 0);
		alloc(&mut acid, map, 1).unwrap();
		assert_eq!(map::free_end_class(acid.memory(), map), 1);
		alloc(&mut acid, map, 5000).unwrap();
		// class_for(5000) == 5, so the end class jumps past it.
		assert_eq!(map::free_end_class(acid.memory(), map), 6);
		// Nothing is on the lists, so the next alloc carves a class 6 block
		// and splits it all the way down.
		alloc(&mut acid, map, 1).unwrap();
		assert_eq!(map::free_end_class(acid.memory(), map), 7);
		alloc(&mut acid, map, 1).unwrap();
		assert_eq!(map::free_end_class(acid.memory(), map), 7);
	}

	#[test]
	fn oversized_alloc_is_fatal() {
		let dir = TempDir::new("oversized_alloc_is_fatal");
		let (mut acid, map) = dir.acid_with_map();
		match alloc(&mut acid, map, 1u64 << 60) {
			Err(crate::error::Error::Corruption(_)) => (),
			other => panic!("unexpected: {:?}", other),
		}
	}

	#[test]
	fn persisted_free_lists_survive_reopen() {
		let dir = TempDir::new("persisted_free_lists_survive_reopen");
		let freed;
		{
			let (mut acid, map) = dir.acid_with_map();
			let (a, _, _) = alloc(&mut acid, map, 300).unwrap();
			free(&mut acid, map, a, 300).unwrap();
			freed = a;
			acid.close().unwrap();
		}
		let mut acid = Acid::open(&dir.0.join("seg")).unwrap();
		let map = map::find(acid.memory(), b"vmtest").unwrap();
		let (b, _, _) = alloc(&mut acid, map, 300).unwrap();
		assert_eq!(b, freed);
	}
}
