/// The "untuned" target items per partition.
pub const DEFAULT_TARGET_IPP: u16 = 20;

/// Per-map open options.
#[derive(Debug, Clone)]
pub struct MapOptions {
	/// Overwrite the persisted target ipp even for an existing map.
	/// When false the ipp is only applied on map creation.
	pub overwrite_target_ipp: bool,
	/// Tuning parameter: target items per partition. 0 uses the default.
	/// Drives level selection probability, partition sizing and the
	/// addressable capacity of the map.
	pub target_ipp: u16,
	/// Deterministic seed. When non-zero the insert level is derived by
	/// hashing the key with this seed instead of drawing real randomness.
	/// Useful for deterministic tests.
	pub dtrm_seed: u64,
}

impl Default for MapOptions {
	fn default() -> MapOptions {
		MapOptions {
			overwrite_target_ipp: false,
			target_ipp: 0,
			dtrm_seed: 0,
		}
	}
}
