// B-skip-list engine: lookup, insert with per-level splits, get and update.
//
// A map is 8 levels of partitions. Every partition has exactly one incoming
// reference: a root slot of the map header or the down word of a record one
// level up. A level 1+ record's down partition starts with the record's own
// key, which makes exact-match descent a chain of first-child hops.
//
// The "following root" invariant: while a lookup descends through root
// slots the target position may be 0 (all keys of the partition are higher);
// once a down word has been followed, the partition is known to contain a
// key at or below the searched one, so a target position of 0 means the
// structure is corrupt.

use rand::Rng;

use crate::acid::{read_u64, write_u64, Acid};
use crate::display::hex;
use crate::error::{Error, Result};
use crate::map::{self, LEVELS};
use crate::part;
use crate::stats;
use crate::vm;
use crate::{MAX_KEY_LEN, MAX_VALUE_LEN};

/// The one incoming reference of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtRef {
	Root { level: u8 },
	Down { slot: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Target {
	pub part: u64,
	/// Record position. Scan seeding stores the followed down position,
	/// which is -1 while a level was entered through its root slot.
	pub idx: i64,
}

pub(crate) struct Lookup {
	pub found: bool,
	pub refr: ExtRef,
	pub target: [Target; LEVELS],
}

pub(crate) enum LookupMode<'a> {
	/// Binary search for a key.
	Key(&'a [u8]),
	/// Simulated lookup of a key below every stored key.
	First,
	/// Simulated lookup of a key above every stored key.
	Last,
}

pub(crate) struct LookupOp<'a> {
	pub mode: LookupMode<'a>,
	/// Record the insert position per level instead of the followed down
	/// position.
	pub insert_idx: bool,
	/// Level whose external partition reference the lookup captures.
	pub insert_lvl: u8,
	/// Return as soon as the key is found, with a partial result.
	pub found_abort: bool,
}

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
	if key.len() > MAX_KEY_LEN {
		return Err(Error::InvalidInput(format!("key is too large, [{}] > [{}]", key.len(), MAX_KEY_LEN)));
	}
	Ok(())
}

pub(crate) fn check_value(value: &[u8]) -> Result<()> {
	if value.len() > MAX_VALUE_LEN {
		return Err(Error::InvalidInput(format!("value is too large, [{}] > [{}]", value.len(), MAX_VALUE_LEN)));
	}
	Ok(())
}

fn set_ext_ref(seg: &mut [u8], map: u64, refr: ExtRef, part: u64) {
	match refr {
		ExtRef::Root { level } => map::set_root(seg, map, level, part),
		ExtRef::Down { slot } => write_u64(seg, slot, part),
	}
}

/// Top-down search recording the visited partition and position per level.
pub(crate) fn lookup(seg: &[u8], map: u64, op: &LookupOp<'_>) -> Result<Lookup> {
	if let LookupMode::Key(key) = op.mode {
		check_key(key)?;
	}
	let mut out = Lookup {
		found: false,
		refr: ExtRef::Root { level: LEVELS as u8 - 1 },
		target: [Target::default(); LEVELS],
	};
	let mut following_root = true;
	let mut refr = ExtRef::Root { level: LEVELS as u8 - 1 };
	let mut part: u64 = 0;
	let mut i_lvl = LEVELS - 1;
	loop {
		if following_root {
			refr = ExtRef::Root { level: i_lvl as u8 };
			part = map::root(seg, map, i_lvl as u8);
		}
		if part == 0 {
			return Err(Error::Corruption("null partition reference".into()));
		}
		out.target[i_lvl].part = part;
		let n = part::n_keys(seg, part);
		let (found, mut idx_t) = match op.mode {
			LookupMode::Key(key) => part::search(seg, part, key),
			LookupMode::First => (false, 0),
			LookupMode::Last => (false, n),
		};
		if found {
			if op.found_abort {
				out.found = true;
				return Ok(out);
			}
			out.target[i_lvl].idx = idx_t as i64;
			// Fast travel: each down partition starts with this exact key.
			while i_lvl > 0 {
				let slot = part::down_slot(seg, part, idx_t);
				refr = ExtRef::Down { slot };
				part = read_u64(seg, slot);
				idx_t = 0;
				i_lvl -= 1;
				out.target[i_lvl] = Target { part, idx: 0 };
			}
			out.refr = refr;
			out.found = true;
			return Ok(out);
		}
		out.target[i_lvl].idx = if op.insert_idx { idx_t as i64 } else { idx_t as i64 - 1 };
		if i_lvl == op.insert_lvl as usize {
			out.refr = refr;
		}
		if i_lvl == 0 {
			out.target[0].idx = idx_t as i64;
			return Ok(out);
		}
		if idx_t == 0 {
			// All keys here are higher; legal only while on the root spine.
			if !following_root {
				return Err(Error::Corruption("lookup left the root spine at position 0".into()));
			}
		} else {
			let slot = part::down_slot(seg, part, idx_t - 1);
			refr = ExtRef::Down { slot };
			part = read_u64(seg, slot);
			following_root = false;
		}
		i_lvl -= 1;
	}
}

/// Draws the level for a new entry: a run of `1/(ipp+1)` coin tosses.
/// The dice space is at most 16 bit wide, so the bias from `2^64 % d != 0`
/// is below 2^-48 and is ignored.
fn insert_level(seg: &[u8], map: u64, key: &[u8]) -> u8 {
	let d = map::target_ipp(seg, map).max(1) as u64 + 1;
	let seed = map::dtrm_seed(seg, map);
	let mut lvl: u8 = 0;
	while (lvl as usize) < LEVELS - 1 {
		let rnd64 = if seed == 0 {
			rand::thread_rng().gen::<u64>()
		} else {
			xxhash_rust::xxh64::xxh64(key, seed.wrapping_add(lvl as u64))
		};
		if rnd64 % d != 0 {
			break;
		}
		lvl += 1;
	}
	lvl
}

/// Inserts a key/value pair. Returns false when the key already exists.
pub(crate) fn insert(acid: &mut Acid, map: u64, key: &[u8], value: &[u8]) -> Result<bool> {
	check_key(key)?;
	check_value(value)?;
	let insert_lvl = insert_level(acid.memory(), map, key);
	// Read phase: resolve target partition and position per level, and the
	// external reference of the insert level partition.
	let r = lookup(acid.memory(), map, &LookupOp {
		mode: LookupMode::Key(key),
		insert_idx: true,
		insert_lvl,
		found_abort: true,
	})?;
	if r.found {
		log::trace!(target: "quark", "Insert of existing key {}", hex(key));
		return Ok(false);
	}
	log::trace!(target: "quark", "Inserting {} at level {}", hex(key), insert_lvl);
	// Write phase, from the insert level down. Below the insert level every
	// step splits the target partition into a left and a right side; the
	// parent's pending down word ends up pointing at the right side.
	let mut down_l: Option<u64> = None;
	let mut down_r: Option<u64> = None;
	for i_lvl in (0..=insert_lvl).rev() {
		let req_space = part::space_kv(i_lvl, key, value);
		let mut part_off = r.target[i_lvl as usize].part;
		let idx_t = r.target[i_lvl as usize].idx as u32;
		if i_lvl == insert_lvl {
			if part::free_space(acid.memory(), part_off) < req_space {
				let new_part = part::realloc(acid, map, i_lvl, part_off, req_space)?;
				set_ext_ref(acid.memory_mut(), map, r.refr, new_part);
				part_off = new_part;
			}
			let (dl, dr) = part::insert_entry(acid.memory_mut(), map, i_lvl, part_off, idx_t, key, value);
			down_l = dl;
			down_r = dr;
		} else {
			let down_r_slot = match down_r {
				Some(slot) => slot,
				None => return Err(Error::Corruption("split level without a pending down word".into())),
			};
			let n = part::n_keys(acid.memory(), part_off);
			let right_empty = idx_t == n;
			let left_empty = idx_t == 0;
			let part_l;
			let part_r;
			let next_down_r;
			if right_empty {
				// The partition stays as the left side untouched; the new
				// entry opens a fresh right side.
				part_l = part_off;
				let pr = part::alloc_new(acid, map, i_lvl, req_space)?;
				let (_, dr) = part::insert_entry(acid.memory_mut(), map, i_lvl, pr, 0, key, value);
				part_r = pr;
				next_down_r = dr;
			} else {
				let space_l = part::space_range(acid.memory(), i_lvl, part_off, 0, idx_t);
				let pl = part::alloc_new(acid, map, i_lvl, space_l)?;
				match down_l {
					Some(slot) => {
						debug_assert_eq!(read_u64(acid.memory(), slot), part_off);
						write_u64(acid.memory_mut(), slot, pl);
					}
					None => {
						// Root entry partitions have no down word above.
						debug_assert_eq!(map::root(acid.memory(), map, i_lvl), part_off);
						map::set_root(acid.memory_mut(), map, i_lvl, pl);
					}
				}
				if left_empty {
					debug_assert!(down_l.is_none());
					// Adopt the whole partition as the right side, cutting
					// it off the root by inserting at the front.
					let mut pr = part_off;
					if part::free_space(acid.memory(), pr) < req_space {
						pr = part::realloc(acid, map, i_lvl, pr, req_space)?;
					}
					let (_, dr) = part::insert_entry(acid.memory_mut(), map, i_lvl, pr, 0, key, value);
					part_r = pr;
					next_down_r = dr;
				} else {
					let space_r = req_space + part::space_range(acid.memory(), i_lvl, part_off, idx_t, n);
					let pr = part::alloc_new(acid, map, i_lvl, space_r)?;
					part::insert_entry_range(acid.memory_mut(), i_lvl, pl, part_off, 0, idx_t);
					let (_, dr) = part::insert_entry(acid.memory_mut(), map, i_lvl, pr, 0, key, value);
					part::insert_entry_range(acid.memory_mut(), i_lvl, pr, part_off, idx_t, n);
					part::free_part(acid, map, i_lvl, part_off)?;
					part_r = pr;
					next_down_r = dr;
				}
				part_l = pl;
			}
			write_u64(acid.memory_mut(), down_r_slot, part_r);
			if i_lvl > 0 {
				down_r = next_down_r;
				// The next left down word belongs to the last key of the
				// left side; an empty left side is a root entry partition.
				let seg = acid.memory();
				let nl = part::n_keys(seg, part_l);
				down_l = if nl > 0 { Some(part::down_slot(seg, part_l, nl - 1)) } else { None };
			}
		}
	}
	Ok(true)
}

/// Returns the segment offset and length of the stored value.
pub(crate) fn get(seg: &[u8], map: u64, key: &[u8]) -> Result<Option<(u64, u64)>> {
	let r = lookup(seg, map, &LookupOp {
		mode: LookupMode::Key(key),
		insert_idx: false,
		insert_lvl: 0,
		found_abort: false,
	})?;
	if r.found {
		Ok(Some(part::value_range(seg, r.target[0].part, r.target[0].idx as u32)))
	} else {
		Ok(None)
	}
}

/// Replaces the value of an existing key. Same-length values are rewritten
/// in place; otherwise the old tail entry is squeezed out and a new one is
/// written, growing the partition if it has to.
pub(crate) fn update(acid: &mut Acid, map: u64, key: &[u8], new_value: &[u8]) -> Result<bool> {
	check_value(new_value)?;
	let r = lookup(acid.memory(), map, &LookupOp {
		mode: LookupMode::Key(key),
		insert_idx: false,
		insert_lvl: 0,
		found_abort: false,
	})?;
	if !r.found {
		return Ok(false);
	}
	let mut part_off = r.target[0].part;
	let idx_t = r.target[0].idx as u32;
	let (voff, vlen) = part::value_range(acid.memory(), part_off, idx_t);
	if new_value.len() as u64 == vlen {
		let seg = acid.memory_mut();
		seg[voff as usize..(voff + vlen) as usize].copy_from_slice(new_value);
		return Ok(true);
	}
	// Squeeze the old entry out of the tail by sliding everything below it
	// forward, rebasing the key offsets that lay in the moved range.
	{
		let seg = acid.memory_mut();
		let ent_dsize = part::space_idx_data(seg, 0, part_off, idx_t);
		let d_beg = part::write0(seg, part_off);
		let d_end = part::keyoff(seg, part_off, idx_t);
		debug_assert!(d_beg <= d_end);
		if d_beg < d_end {
			seg.copy_within(d_beg as usize..d_end as usize, (d_beg + ent_dsize) as usize);
			for i in 0..part::n_keys(seg, part_off) {
				let koff = part::keyoff(seg, part_off, i);
				if koff < d_end {
					part::set_idx(seg, part_off, i, part::keylen(seg, part_off, i), koff + ent_dsize);
				}
			}
		}
		let data = part::data_size(seg, part_off);
		part::set_data_size(seg, part_off, data - ent_dsize);
	}
	if new_value.len() as u64 > vlen {
		let req_space = part::space_kv(0, key, new_value) - part::IDX_SIZE;
		if part::free_space(acid.memory(), part_off) < req_space {
			let new_part = part::realloc(acid, map, 0, part_off, req_space)?;
			set_ext_ref(acid.memory_mut(), map, r.refr, new_part);
			part_off = new_part;
		}
	}
	let seg = acid.memory_mut();
	debug_assert!(part::space_kv(0, key, new_value) - part::IDX_SIZE <= part::free_space(seg, part_off));
	let w0 = part::write0(seg, part_off);
	let (write_d, _) = part::write_entry_data(seg, 0, w0, key, new_value);
	// The key bytes moved with the entry, so the index record is rewritten.
	part::set_idx(seg, part_off, idx_t, key.len() as u16, write_d);
	let data = part::data_size(seg, part_off);
	part::set_data_size(seg, part_off, data + (w0 - write_d));
	Ok(true)
}

/// Full structural check of one map: ordering, down-key equality, single
/// reachability, header arithmetic and allocator accounting. Statistics
/// that legitimately drift (data_alloc_b after updates) are not compared.
pub(crate) fn validate(seg: &[u8], map: u64) -> Result<()> {
	fn corrupt<T>(msg: String) -> Result<T> {
		Err(Error::Corruption(msg))
	}
	let by_level = stats::partitions(seg, map);
	// Single reachability: every partition appears exactly once across all
	// root slots and down words.
	let mut seen = std::collections::HashSet::new();
	for parts in &by_level {
		for p in parts {
			if !seen.insert(*p) {
				return corrupt(format!("partition {} has multiple incoming references", p));
			}
		}
	}
	let mut intervals = Vec::new();
	for (lvl, parts) in by_level.iter().enumerate() {
		let mut prev_key: Option<&[u8]> = None;
		for p in parts {
			let total = part::total_size(seg, *p);
			let n = part::n_keys(seg, *p);
			let data = part::data_size(seg, *p);
			if !total.is_power_of_two() || total < vm::class_bytes(0) {
				return corrupt(format!("partition {} has bad total_size {}", p, total));
			}
			if part::PART_HDR + n as u64 * part::IDX_SIZE + data > total {
				return corrupt(format!("partition {} overflows its size", p));
			}
			intervals.push((*p, total));
			let w0 = part::write0(seg, *p);
			for i in 0..n {
				let koff = part::keyoff(seg, *p, i);
				let dsize = part::space_idx_data(seg, lvl as u8, *p, i);
				if koff < w0 || koff + dsize > *p + total {
					return corrupt(format!("partition {} record {} points outside the tail", p, i));
				}
				let key = part::key_at(seg, *p, i);
				if let Some(prev) = prev_key {
					if prev >= key {
						return corrupt(format!("level {} keys are not strictly ascending", lvl));
					}
				}
				prev_key = Some(key);
				if lvl > 0 {
					let child = part::down(seg, *p, i);
					if part::n_keys(seg, child) == 0 {
						return corrupt(format!("down partition {} is empty", child));
					}
					if part::key_at(seg, child, 0) != key {
						return corrupt(format!("down partition {} first key differs from its record", child));
					}
				}
			}
		}
	}
	// Free lists: size-correct chains, no duplicates, no overlap with live
	// partitions.
	for class in 0..map::free_end_class(seg, map) {
		let mut head = map::free_list(seg, map, class);
		while head != 0 {
			if !seen.insert(head) {
				return corrupt(format!("free block {} listed twice or shadowing a partition", head));
			}
			intervals.push((head, vm::class_bytes(class)));
			head = read_u64(seg, head);
		}
	}
	intervals.sort();
	for pair in intervals.windows(2) {
		if pair[0].0 + pair[0].1 > pair[1].0 {
			return corrupt(format!("blocks at {} and {} overlap", pair[0].0, pair[1].0));
		}
	}
	// Allocator accounting.
	let (computed, classes) = stats::recompute(seg, map);
	for lvl in 0..LEVELS as u8 {
		let persisted = stats::level(seg, map, lvl);
		let c = &computed[lvl as usize];
		if persisted.ent_count != c.ent_count
			|| persisted.part_count != c.part_count
			|| persisted.total_alloc_b != c.total_alloc_b
		{
			return corrupt(format!("level {} statistics disagree with the structure", lvl));
		}
	}
	for (class, count) in classes.iter().enumerate() {
		if stats::class_count(seg, map, class as u8) != *count {
			return corrupt(format!("class {} histogram disagrees with the structure", class));
		}
	}
	Ok(())
}
