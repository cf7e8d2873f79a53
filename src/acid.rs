// Narrow adapter over the memory-mapped segment files.
//
// A segment is a pair of sibling files: `<base>.data` holds the mapped byte
// range the engine mutates in place, `<base>.journal` holds a small
// self-checksummed commit stamp rewritten on every sync:
//
// [MAGIC: 8][VERSION: 8][LEN: 8][CRC: 4]
//
// CRC - crc32 of the first 24 stamp bytes.
//
// The data file grows in whole pages; the logical segment length may end
// short of the physical file length. On reopen the logical length is
// re-derived from the file length, which can leak at most one page of tail
// slack per reopen.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use fs2::FileExt;
use crate::error::{Error, Result};

const JOURNAL_MAGIC: u64 = 0x6b72_6175_716a_6e6c;
const JOURNAL_VERSION: u64 = 4;
const STAMP_SIZE: usize = 28;

/// Smallest physical segment growth: one page.
pub const PAGE_SIZE: u64 = 4096;

pub(crate) fn read_u16(seg: &[u8], off: u64) -> u16 {
	let off = off as usize;
	u16::from_le_bytes([seg[off], seg[off + 1]])
}

pub(crate) fn write_u16(seg: &mut [u8], off: u64, v: u16) {
	let off = off as usize;
	seg[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u32(seg: &[u8], off: u64) -> u32 {
	let off = off as usize;
	let mut buf = [0u8; 4];
	buf.copy_from_slice(&seg[off..off + 4]);
	u32::from_le_bytes(buf)
}

pub(crate) fn write_u32(seg: &mut [u8], off: u64, v: u32) {
	let off = off as usize;
	seg[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u64(seg: &[u8], off: u64) -> u64 {
	let off = off as usize;
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&seg[off..off + 8]);
	u64::from_le_bytes(buf)
}

pub(crate) fn write_u64(seg: &mut [u8], off: u64, v: u64) {
	let off = off as usize;
	seg[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.read_exact_at(buf, offset)?)
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	Ok(file.write_all_at(buf, offset)?)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	file.seek_read(buf, offset)?;
	Ok(())
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	file.seek_write(buf, offset)?;
	Ok(())
}

fn stamp_bytes(len: u64) -> [u8; STAMP_SIZE] {
	let mut stamp = [0u8; STAMP_SIZE];
	stamp[0..8].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
	stamp[8..16].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
	stamp[16..24].copy_from_slice(&len.to_le_bytes());
	let crc = crc32fast::hash(&stamp[0..24]);
	stamp[24..28].copy_from_slice(&crc.to_le_bytes());
	stamp
}

fn write_stamp(journal: &std::fs::File, len: u64) -> Result<()> {
	write_at(journal, &stamp_bytes(len), 0)?;
	journal.sync_data()?;
	Ok(())
}

fn sibling_path(base: &Path, suffix: &str) -> PathBuf {
	let mut name = base.as_os_str().to_os_string();
	name.push(suffix);
	PathBuf::from(name)
}

/// Owns the mapped segment and its journal stamp. Mutations go straight into
/// the mapping; durability is a sync of the data file followed by a fresh
/// journal stamp.
pub struct Acid {
	data_path: PathBuf,
	file: std::fs::File,
	journal: std::fs::File,
	map: memmap2::MmapMut,
	len: u64,
}

/// Cloned handles for syncing the segment from another thread while the
/// owner keeps mutating the mapping.
pub struct SyncHandle {
	file: std::fs::File,
	journal: std::fs::File,
}

impl SyncHandle {
	/// Makes every write issued before this call durable.
	pub fn sync(&self) -> Result<()> {
		self.file.sync_data()?;
		write_stamp(&self.journal, self.file.metadata()?.len())?;
		Ok(())
	}
}

impl Acid {
	/// Opens (creating as needed) the `<base>.data` / `<base>.journal` pair
	/// and maps the data file. The data file is locked exclusively; a second
	/// opener fails with an IO error.
	pub fn open(base: &Path) -> Result<Acid> {
		let data_path = sibling_path(base, ".data");
		let journal_path = sibling_path(base, ".journal");
		let file = OpenOptions::new().create(true).read(true).write(true).open(&data_path)?;
		file.try_lock_exclusive()?;
		disable_read_ahead(&file)?;
		let mut len = file.metadata()?.len();
		if len == 0 {
			file.set_len(PAGE_SIZE)?;
			len = PAGE_SIZE;
		}
		let journal = OpenOptions::new().create(true).read(true).write(true).open(&journal_path)?;
		if journal.metadata()?.len() >= STAMP_SIZE as u64 {
			let mut stamp = [0u8; STAMP_SIZE];
			read_at(&journal, &mut stamp, 0)?;
			let crc = crc32fast::hash(&stamp[0..24]);
			if read_u32(&stamp, 24) != crc {
				return Err(Error::Corruption("journal stamp checksum mismatch".into()));
			}
			if read_u64(&stamp, 0) != JOURNAL_MAGIC {
				return Err(Error::Corruption("invalid journal magic".into()));
			}
			if read_u64(&stamp, 8) != JOURNAL_VERSION {
				return Err(Error::Corruption("bad journal version".into()));
			}
		}
		let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
		log::debug!(target: "quark", "Opened segment {} ({} bytes)", data_path.display(), len);
		Ok(Acid { data_path, file, journal, map, len })
	}

	/// Logical segment length in bytes.
	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn memory(&self) -> &[u8] {
		&self.map[..self.len as usize]
	}

	pub fn memory_mut(&mut self) -> &mut [u8] {
		&mut self.map[..self.len as usize]
	}

	/// Grows the logical segment to `new_len` bytes, extending and remapping
	/// the data file in whole pages when needed. Shrinking is not supported.
	pub fn expand(&mut self, new_len: u64) -> Result<()> {
		if new_len <= self.len {
			return Ok(());
		}
		let physical = self.map.len() as u64;
		if new_len > physical {
			let target = (new_len + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
			self.file.set_len(target)?;
			self.map = unsafe { memmap2::MmapMut::map_mut(&self.file)? };
			log::trace!(
				target: "quark",
				"{}: Extended segment to {} bytes",
				self.data_path.display(),
				target,
			);
		}
		self.len = new_len;
		Ok(())
	}

	/// Synchronous durable point: flush the mapping, sync the data file,
	/// restamp the journal.
	pub fn fsync(&mut self) -> Result<()> {
		self.map.flush()?;
		self.file.sync_data()?;
		write_stamp(&self.journal, self.file.metadata()?.len())?;
		Ok(())
	}

	/// Begins writing dirty mapped pages back without waiting. Pair with
	/// `SyncHandle::sync` for a full durable point.
	pub fn flush_async(&self) -> Result<()> {
		Ok(self.map.flush_async()?)
	}

	pub fn sync_handle(&self) -> Result<SyncHandle> {
		Ok(SyncHandle {
			file: self.file.try_clone()?,
			journal: self.journal.try_clone()?,
		})
	}

	/// Snapshot and fsync coincide at this adapter's consistency level.
	pub fn snapshot(&mut self) -> Result<()> {
		self.fsync()
	}

	pub fn close(mut self) -> Result<()> {
		self.fsync()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("quark-test");
			path.push("acid");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn base(&self) -> std::path::PathBuf {
			self.0.join("seg")
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
	fn open_expand_reopen() {
		let dir = TempDir::new("open_expand_reopen");
		{
			let mut acid = Acid::open(&dir.base()).unwrap();
			assert_eq!(acid.len(), PAGE_SIZE);
			write_u64(acid.memory_mut(), 0, 0xfeed);
			acid.expand(PAGE_SIZE + 256).unwrap();
			assert_eq!(acid.len(), PAGE_SIZE + 256);
			write_u64(acid.memory_mut(), PAGE_SIZE, 0xbeef);
			acid.close().unwrap();
		}
		let acid = Acid::open(&dir.base()).unwrap();
		// Physical length is page granular, so the tail slack rounds up.
		assert_eq!(acid.len(), 2 * PAGE_SIZE);
		assert_eq!(read_u64(acid.memory(), 0), 0xfeed);
		assert_eq!(read_u64(acid.memory(), PAGE_SIZE), 0xbeef);
	}

	#[test]
	fn second_opener_fails() {
		let dir = TempDir::new("second_opener_fails");
		let _acid = Acid::open(&dir.base()).unwrap();
		assert!(Acid::open(&dir.base()).is_err());
	}

	#[test]
	fn corrupt_journal_detected() {
		let dir = TempDir::new("corrupt_journal_detected");
		{
			let mut acid = Acid::open(&dir.base()).unwrap();
			acid.fsync().unwrap();
			acid.close().unwrap();
		}
		let journal = sibling_path(&dir.base(), ".journal");
		let mut stamp = std::fs::read(&journal).unwrap();
		stamp[16] ^= 0xff;
		std::fs::write(&journal, &stamp).unwrap();
		match Acid::open(&dir.base()) {
			Err(Error::Corruption(_)) => (),
			other => panic!("unexpected result: {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn sync_handle_restamps() {
		let dir = TempDir::new("sync_handle_restamps");
		let mut acid = Acid::open(&dir.base()).unwrap();
		let handle = acid.sync_handle().unwrap();
		write_u64(acid.memory_mut(), 16, 77);
		acid.flush_async().unwrap();
		handle.sync().unwrap();
		let journal = sibling_path(&dir.base(), ".journal");
		assert_eq!(std::fs::metadata(&journal).unwrap().len(), STAMP_SIZE as u64);
	}
}
