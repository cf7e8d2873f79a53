// Multi-part key codec.
//
// Parts are joined with `00 00`; a literal zero byte inside a part is
// escaped as `00 01`. Lexicographic byte order of the encoding equals
// part-wise lexicographic order of the part lists, which lets compound
// keys live in a plain byte-ordered map.

use crate::error::{Error, Result};

/// Encodes a list of key parts into a single scannable key.
pub fn compile_key(parts: &[&[u8]]) -> Vec<u8> {
	let mut out = Vec::new();
	for (i, part) in parts.iter().enumerate() {
		if i > 0 {
			out.extend_from_slice(&[0x00, 0x00]);
		}
		for b in part.iter() {
			if *b == 0x00 {
				out.extend_from_slice(&[0x00, 0x01]);
			} else {
				out.push(*b);
			}
		}
	}
	out
}

/// Decodes a compiled key back into exactly `n_parts` parts.
pub fn decompile_key(raw: &[u8], n_parts: usize) -> Result<Vec<Vec<u8>>> {
	if n_parts == 0 {
		return Err(Error::InvalidInput("invalid n_parts, cannot be zero".into()));
	}
	fn push_part(parts: &mut Vec<Vec<u8>>, cur: &mut Vec<u8>, n_parts: usize) -> Result<()> {
		if parts.len() >= n_parts {
			return Err(Error::InvalidInput("key had more parts than specified".into()));
		}
		parts.push(std::mem::replace(cur, Vec::new()));
		Ok(())
	}
	let mut parts = Vec::with_capacity(n_parts);
	let mut cur = Vec::new();
	let mut in_escape = false;
	for b in raw.iter() {
		if in_escape {
			match *b {
				0x00 => push_part(&mut parts, &mut cur, n_parts)?,
				0x01 => cur.push(0x00),
				_ => return Err(Error::InvalidInput("unknown escape sequence".into())),
			}
			in_escape = false;
		} else if *b == 0x00 {
			in_escape = true;
		} else {
			cur.push(*b);
		}
	}
	if in_escape {
		return Err(Error::InvalidInput("key ended during escape sequence".into()));
	}
	push_part(&mut parts, &mut cur, n_parts)?;
	if parts.len() != n_parts {
		return Err(Error::InvalidInput("key had less parts than specified".into()));
	}
	Ok(parts)
}

#[cfg(test)]
mod test {
	use super::*;
	use rand::{Rng, SeedableRng};

	#[test]
	fn compile_escapes_and_separates() {
		let key = compile_key(&[b"a\x00\x01", b"b\x00\x01"]);
		assert_eq!(key, b"a\x00\x01\x01\x00\x00b\x00\x01\x01");
		let parts = decompile_key(&key, 2).unwrap();
		assert_eq!(parts, vec![b"a\x00\x01".to_vec(), b"b\x00\x01".to_vec()]);
		assert!(decompile_key(&key, 1).is_err());
		assert!(decompile_key(&key, 3).is_err());
	}

	#[test]
	fn round_trip_random_parts() {
		let mut rng = rand::rngs::StdRng::seed_from_u64(7);
		for _ in 0..500 {
			let n = rng.gen_range(1..5);
			let parts: Vec<Vec<u8>> = (0..n)
				.map(|_| {
					let len = rng.gen_range(0..12);
					// Bias toward the interesting bytes.
					(0..len).map(|_| [0x00u8, 0x00, 0x01, 0x02, 0x61, 0xff][rng.gen_range(0..6)]).collect()
				})
				.collect();
			let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
			let raw = compile_key(&refs);
			assert_eq!(decompile_key(&raw, n).unwrap(), parts);
		}
	}

	#[test]
	fn encoded_order_matches_part_order() {
		let mut rng = rand::rngs::StdRng::seed_from_u64(11);
		let mut sample = || -> Vec<Vec<u8>> {
			let n = rng.gen_range(1..4);
			(0..n)
				.map(|_| {
					let len = rng.gen_range(0..6);
					(0..len).map(|_| [0x00u8, 0x01, 0x61, 0x62][rng.gen_range(0..4)]).collect()
				})
				.collect()
		};
		for _ in 0..1000 {
			let a = sample();
			let b = sample();
			let ra: Vec<&[u8]> = a.iter().map(|p| p.as_slice()).collect();
			let rb: Vec<&[u8]> = b.iter().map(|p| p.as_slice()).collect();
			assert_eq!(
				compile_key(&ra).cmp(&compile_key(&rb)),
				a.cmp(&b),
				"ordering diverged for {:?} vs {:?}",
				a,
				b
			);
		}
	}

	#[test]
	fn malformed_escapes_fail() {
		assert!(decompile_key(b"a\x00", 1).is_err());
		assert!(decompile_key(b"a\x00\x02b", 1).is_err());
		assert!(decompile_key(b"", 0).is_err());
		assert_eq!(decompile_key(b"", 1).unwrap(), vec![Vec::<u8>::new()]);
	}
}
