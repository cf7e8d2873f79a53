// Ordered range scans.
//
// A scan seeds a full-height cursor with one lookup, adjusts the level 0
// position onto the first record to emit, then walks level 0 in the chosen
// direction. Exhausted partitions are left through the lowest level whose
// next position is still in range, descending back to level 0 along first
// children (ascending) or last children (descending).
//
// Emitted records are packed into the caller's band:
// [KEYLEN: 2][KEY][VALUELEN: 8][VALUE]
// until the band, the limit or the index runs out. Running out of band is
// the only way a scan reports eof = false.

use crate::acid::{read_u16, read_u64, write_u16, write_u64};
use crate::error::Result;
use crate::map::{self, LEVELS};
use crate::part;
use crate::tree::{self, LookupMode, LookupOp, Target};

/// Scan options. Bounds are exclusive unless the matching `inc_*` is set;
/// `limit` 0 means unlimited.
#[derive(Debug, Clone, Default)]
pub struct ScanOp {
	pub key_start: Option<Vec<u8>>,
	pub key_end: Option<Vec<u8>>,
	pub inc_start: bool,
	pub inc_end: bool,
	pub descending: bool,
	/// Emit empty values instead of stored ones.
	pub ignore_data: bool,
	pub limit: u64,
}

/// Reads records back out of a scan band.
pub struct BandReader<'a> {
	mem: &'a [u8],
}

impl<'a> BandReader<'a> {
	pub fn new(mem: &'a [u8]) -> BandReader<'a> {
		BandReader { mem }
	}
}

impl<'a> Iterator for BandReader<'a> {
	type Item = (&'a [u8], &'a [u8]);

	fn next(&mut self) -> Option<(&'a [u8], &'a [u8])> {
		if self.mem.is_empty() {
			return None;
		}
		let klen = read_u16(self.mem, 0) as usize;
		let key = &self.mem[2..2 + klen];
		let vlen = read_u64(self.mem, 2 + klen as u64) as usize;
		let value = &self.mem[2 + klen + 8..2 + klen + 8 + vlen];
		self.mem = &self.mem[2 + klen + 8 + vlen..];
		Some((key, value))
	}
}

struct Band<'a> {
	buf: &'a mut [u8],
	used: usize,
	count: u64,
	limit: u64,
	ignore_data: bool,
	eof: bool,
}

impl<'a> Band<'a> {
	/// Packs one record; the return value tells the scan whether to carry
	/// on. Running out of band space is the one case that clears eof.
	fn write(&mut self, seg: &[u8], part: u64, i: u32) -> bool {
		if self.limit > 0 && self.count >= self.limit {
			return false;
		}
		let klen = part::keylen(seg, part, i) as usize;
		let koff = part::keyoff(seg, part, i) as usize;
		if self.ignore_data {
			let req = 2 + klen + 8;
			if self.buf.len() - self.used < req {
				self.eof = false;
				return false;
			}
			write_u16(self.buf, self.used as u64, klen as u16);
			self.buf[self.used + 2..self.used + 2 + klen].copy_from_slice(&seg[koff..koff + klen]);
			write_u64(self.buf, (self.used + 2 + klen) as u64, 0);
			self.used += req;
		} else {
			// The tail already holds key‖valuelen‖value contiguously.
			let dsize = part::space_idx_data(seg, 0, part, i) as usize;
			let req = 2 + dsize;
			if self.buf.len() - self.used < req {
				self.eof = false;
				return false;
			}
			write_u16(self.buf, self.used as u64, klen as u16);
			self.buf[self.used + 2..self.used + req].copy_from_slice(&seg[koff..koff + dsize]);
			self.used += req;
		}
		self.count += 1;
		self.limit == 0 || self.count < self.limit
	}
}

/// Seeks to the next level 0 partition, advancing the lowest level whose
/// next position stays in range and descending along first children.
fn seek_fwd(seg: &[u8], target: &mut [Target; LEVELS], mut level: usize) -> bool {
	while level < LEVELS {
		let part = target[level].part;
		let n = part::n_keys(seg, part) as i64;
		if n > 0 {
			let idx_t = target[level].idx + 1;
			if idx_t < n {
				target[level].idx = idx_t;
				let mut part = part;
				let mut idx_t = idx_t;
				while level > 0 {
					level -= 1;
					part = part::down(seg, part, idx_t as u32);
					debug_assert!(part::n_keys(seg, part) > 0);
					idx_t = 0;
					target[level] = Target { part, idx: 0 };
				}
				return true;
			}
		}
		level += 1;
	}
	false
}

/// Backward counterpart of `seek_fwd`. Exhausting a root partition steps to
/// the next lower root whose partition differs from the cursor's and
/// re-enters it from the end.
fn seek_rev(seg: &[u8], map: u64, target: &mut [Target; LEVELS], mut level: usize) -> bool {
	let mut part = target[level].part;
	loop {
		if part::n_keys(seg, part) > 0 {
			let idx_t = target[level].idx - 1;
			if idx_t >= 0 {
				target[level].idx = idx_t;
				let mut p = part;
				let mut i = idx_t;
				while level > 0 {
					level -= 1;
					p = part::down(seg, p, i as u32);
					let n = part::n_keys(seg, p) as i64;
					debug_assert!(n > 0);
					i = n - 1;
					target[level] = Target { part: p, idx: i };
				}
				return true;
			}
		}
		if part == map::root(seg, map, level as u8) {
			// The smallest key this root level can reach is exhausted.
			loop {
				if level == 0 {
					return false;
				}
				level -= 1;
				part = map::root(seg, map, level as u8);
				if part != target[level].part {
					break;
				}
			}
			target[level].part = part;
			target[level].idx = part::n_keys(seg, part) as i64;
		} else {
			level += 1;
			part = target[level].part;
		}
	}
}

/// Streams ordered records into `band`. Returns the record count, the eof
/// flag (false only when the band ran out) and the bytes written.
pub(crate) fn scan(seg: &[u8], map: u64, op: &ScanOp, band: &mut [u8]) -> Result<(u64, bool, usize)> {
	let mut b = Band {
		buf: band,
		used: 0,
		count: 0,
		limit: op.limit,
		ignore_data: op.ignore_data,
		eof: true,
	};
	let (mut r, start_equal) = match &op.key_start {
		Some(key_start) => {
			let r = tree::lookup(seg, map, &LookupOp {
				mode: LookupMode::Key(key_start),
				insert_idx: false,
				insert_lvl: 0,
				found_abort: false,
			})?;
			let found = r.found;
			(r, found)
		}
		None => {
			// An artificial lookup below (ascending) or above (descending)
			// every key; it never matches.
			let r = tree::lookup(seg, map, &LookupOp {
				mode: if op.descending { LookupMode::Last } else { LookupMode::First },
				insert_idx: false,
				insert_lvl: 0,
				found_abort: false,
			})?;
			(r, false)
		}
	};
	// The lookup leaves level 0 on the insert position of the start key;
	// move onto the first record to emit.
	let mut live = true;
	if !start_equal || !op.inc_start {
		if op.descending {
			live = seek_rev(seg, map, &mut r.target, 0);
		} else if start_equal {
			// Step past the matched start key.
			live = seek_fwd(seg, &mut r.target, 0);
		} else {
			let part = r.target[0].part;
			let idx = r.target[0].idx;
			let n = part::n_keys(seg, part) as i64;
			if idx == -1 || idx == n {
				// Level 0 is known invalid, start stepping one level up.
				live = seek_fwd(seg, &mut r.target, 1);
			} else {
				debug_assert!(0 <= idx && idx < n);
			}
		}
	}
	if live {
		'outer: loop {
			let part = r.target[0].part;
			let n = part::n_keys(seg, part) as i64;
			let mut idx = r.target[0].idx;
			debug_assert!(part::n_keys(seg, part) > 0);
			debug_assert!(0 <= idx && idx < n);
			loop {
				let key = part::key_at(seg, part, idx as u32);
				if let Some(key_end) = &op.key_end {
					let cmp = key.cmp(&key_end[..]);
					if cmp == std::cmp::Ordering::Equal {
						if op.inc_end {
							b.write(seg, part, idx as u32);
						}
						break 'outer;
					}
					if (!op.descending && cmp == std::cmp::Ordering::Greater)
						|| (op.descending && cmp == std::cmp::Ordering::Less)
					{
						break 'outer;
					}
				}
				if !b.write(seg, part, idx as u32) {
					break 'outer;
				}
				if op.descending {
					idx -= 1;
					if idx < 0 {
						if !seek_rev(seg, map, &mut r.target, 1) {
							break 'outer;
						}
						break;
					}
				} else {
					idx += 1;
					if idx >= n {
						if !seek_fwd(seg, &mut r.target, 1) {
							break 'outer;
						}
						break;
					}
				}
			}
		}
	}
	Ok((b.count, b.eof, b.used))
}
