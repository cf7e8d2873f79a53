// Persisted per-map statistics.
//
// Per level (32 bytes each):
// [ENT_COUNT: 8][PART_COUNT: 8][TOTAL_ALLOC_B: 8][DATA_ALLOC_B: 8]
// followed by the global partition size class histogram, 48 x u64.
//
// The statistics are advisory; the structure is truthful when they drift
// (updates rewrite tail data without going through the insert accounting).
// `recompute` re-derives them by traversal.

use crate::acid::{read_u64, write_u64};
use crate::map::{self, CLASSES, LEVELS, MAP_CLASS_COUNT, MAP_LVL_STATS};
use crate::part;
use crate::vm;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
	/// Number of entries.
	pub ent_count: u64,
	/// Number of partitions.
	pub part_count: u64,
	/// Total bytes allocated for partitions.
	pub total_alloc_b: u64,
	/// Bytes allocated for tail data (keys, values, down words).
	pub data_alloc_b: u64,
}

fn lvl_off(map: u64, level: u8, field: u64) -> u64 {
	map + MAP_LVL_STATS + level as u64 * 32 + field
}

pub(crate) fn level(seg: &[u8], map: u64, lvl: u8) -> LevelStats {
	LevelStats {
		ent_count: read_u64(seg, lvl_off(map, lvl, 0)),
		part_count: read_u64(seg, lvl_off(map, lvl, 8)),
		total_alloc_b: read_u64(seg, lvl_off(map, lvl, 16)),
		data_alloc_b: read_u64(seg, lvl_off(map, lvl, 24)),
	}
}

pub(crate) fn class_count(seg: &[u8], map: u64, class: u8) -> u64 {
	read_u64(seg, map + MAP_CLASS_COUNT + class as u64 * 8)
}

fn bump(seg: &mut [u8], off: u64, delta: i64) {
	let v = read_u64(seg, off);
	write_u64(seg, off, (v as i64 + delta) as u64);
}

pub(crate) fn on_part_alloc(seg: &mut [u8], map: u64, level: u8, size: u64, class: u8) {
	bump(seg, map + MAP_CLASS_COUNT + class as u64 * 8, 1);
	bump(seg, lvl_off(map, level, 16), size as i64);
	bump(seg, lvl_off(map, level, 8), 1);
}

pub(crate) fn on_part_free(seg: &mut [u8], map: u64, level: u8, size: u64, class: u8) {
	bump(seg, map + MAP_CLASS_COUNT + class as u64 * 8, -1);
	bump(seg, lvl_off(map, level, 16), -(size as i64));
	bump(seg, lvl_off(map, level, 8), -1);
}

pub(crate) fn on_insert_entry(seg: &mut [u8], map: u64, level: u8, data_alloc: u64) {
	bump(seg, lvl_off(map, level, 0), 1);
	bump(seg, lvl_off(map, level, 24), data_alloc as i64);
}

/// Every partition of the map, per level, in key order: the root entry
/// partition first, then the down targets of the level above.
pub(crate) fn partitions(seg: &[u8], map: u64) -> Vec<Vec<u64>> {
	let mut by_level = vec![Vec::new(); LEVELS];
	by_level[LEVELS - 1].push(map::root(seg, map, LEVELS as u8 - 1));
	for lvl in (0..LEVELS - 1).rev() {
		let mut parts = vec![map::root(seg, map, lvl as u8)];
		for upper in &by_level[lvl + 1] {
			for i in 0..part::n_keys(seg, *upper) {
				parts.push(part::down(seg, *upper, i));
			}
		}
		by_level[lvl] = parts;
	}
	by_level
}

/// Recomputes the statistics from the structure itself.
pub(crate) fn recompute(seg: &[u8], map: u64) -> (Vec<LevelStats>, Vec<u64>) {
	let mut levels = vec![LevelStats::default(); LEVELS];
	let mut classes = vec![0u64; CLASSES];
	for (lvl, parts) in partitions(seg, map).iter().enumerate() {
		for p in parts {
			let total = part::total_size(seg, *p);
			levels[lvl].ent_count += part::n_keys(seg, *p) as u64;
			levels[lvl].part_count += 1;
			levels[lvl].total_alloc_b += total;
			levels[lvl].data_alloc_b += part::data_size(seg, *p);
			classes[vm::class_for(total) as usize] += 1;
		}
	}
	(levels, classes)
}

/// Statistics as the status JSON fragment for one map.
pub(crate) fn json(seg: &[u8], map: u64, entry_cap: u128) -> serde_json::Value {
	let mut levels = Vec::new();
	for lvl in 0..LEVELS as u8 {
		let s = level(seg, map, lvl);
		levels.push(serde_json::json!({
			"level": lvl,
			"ent_count": s.ent_count,
			"part_count": s.part_count,
			"total_alloc_b": s.total_alloc_b,
			"data_alloc_b": s.data_alloc_b,
		}));
	}
	let mut class_counts = serde_json::Map::new();
	for class in 0..CLASSES as u8 {
		let count = class_count(seg, map, class);
		if count == 0 {
			continue;
		}
		class_counts.insert(format!("{}b", vm::class_bytes(class)), count.into());
	}
	let entry_cap = if entry_cap <= u64::max_value() as u128 {
		serde_json::Value::from(entry_cap as u64)
	} else {
		serde_json::Value::from(entry_cap.to_string())
	};
	serde_json::json!({
		"entry_cap": entry_cap,
		"levels": levels,
		"part_class_count": class_counts,
	})
}
