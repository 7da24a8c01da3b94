//! Atomic, write-if-different file updates (component C1).
//!
//! The mirror sits on a thin-provisioned, snapshotted volume: every byte
//! actually written grows the snapshot. [`UpdateFile`] compares incoming
//! bytes against the file's current content block-by-block and only
//! materializes a new file — via a temp file in the same directory,
//! `fchmod`ed and renamed into place — once a difference is found. The
//! common prefix is copied from the *old* file rather than re-written from
//! the input, so the number of bytes actually written equals
//! `len(new) - len(common_prefix)`, not `len(new)`.
//!
//! This is a state machine rather than the generator the algorithm was
//! originally expressed as: `phase` tracks whether we're still comparing
//! (`Scanning`) or have committed to writing a new file (`Copying`), and
//! `prefix_len` records how much of the old file can be reused once we
//! start copying.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::TEMPFILE_PREFIX;

const DEFAULT_BLOCK_SIZE: usize = 256 << 10;

enum Phase {
	/// Still comparing old and new content. `old_block` is the most
	/// recently read block from the old file awaiting comparison, or
	/// `None` if the next block hasn't been fetched yet. An empty vec
	/// means the old file has reached EOF.
	Scanning { old_block: Option<Vec<u8>> },
	/// A difference has been found (or there was no old file); all
	/// further bytes go straight to the temp file.
	Copying,
	/// Streams were identical; nothing was written.
	Done,
}

/// A write-only file-like object that atomically overwrites its target only
/// if the new data differs from what's there. See the module docs.
pub struct UpdateFile {
	path: PathBuf,
	block_size: usize,
	old: Option<File>,
	new: Option<NamedTempFile>,
	phase: Phase,
	prefix_len: u64,
	buf: Vec<u8>,
	pub modified: Option<bool>,
	finished: bool,
}

impl UpdateFile {
	pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
		Self::with_options(path, TEMPFILE_PREFIX, "", DEFAULT_BLOCK_SIZE)
	}

	pub fn with_options(
		path: impl Into<PathBuf>,
		prefix: &str,
		suffix: &str,
		block_size: usize,
	) -> io::Result<Self> {
		let path = path.into();
		let old = match File::open(&path) {
			Ok(f) => Some(f),
			Err(e) if e.kind() == io::ErrorKind::NotFound => None,
			Err(e) => return Err(e),
		};
		let dir = path
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));
		let _ = (prefix, suffix, &dir); // built lazily, see start_copying
		Ok(Self {
			path,
			block_size,
			phase: if old.is_some() {
				Phase::Scanning { old_block: None }
			} else {
				Phase::Copying
			},
			old,
			new: None,
			prefix_len: 0,
			buf: Vec::new(),
			modified: None,
			finished: false,
		})
	}

	fn temp_builder(&self) -> tempfile::Builder<'static, 'static> {
		let mut b = tempfile::Builder::new();
		b.prefix(TEMPFILE_PREFIX);
		b
	}

	fn ensure_new_file(&mut self) -> io::Result<()> {
		if self.new.is_none() {
			let dir = self
				.path
				.parent()
				.map(Path::to_path_buf)
				.unwrap_or_else(|| PathBuf::from("."));
			let tmp = self.temp_builder().tempfile_in(&dir)?;
			self.new = Some(tmp);
		}
		Ok(())
	}

	/// Transition from `Scanning` to `Copying`: open the temp file, copy
	/// the matched prefix from the old file, then write `leftover` (bytes
	/// already read from the new stream that didn't match).
	fn start_copying(&mut self, leftover: &[u8]) -> io::Result<()> {
		self.ensure_new_file()?;
		if let Some(old) = self.old.as_mut() {
			old.seek(SeekFrom::Start(0))?;
			let mut remaining = self.prefix_len;
			let mut block = vec![0u8; self.block_size];
			while remaining > 0 {
				let want = remaining.min(self.block_size as u64) as usize;
				let n = old.read(&mut block[..want])?;
				if n == 0 {
					break;
				}
				self.new.as_mut().unwrap().write_all(&block[..n])?;
				remaining -= n as u64;
			}
		}
		self.new.as_mut().unwrap().write_all(leftover)?;
		self.phase = Phase::Copying;
		Ok(())
	}

	fn feed(&mut self, data: &[u8]) -> io::Result<()> {
		self.buf.extend_from_slice(data);
		loop {
			match &mut self.phase {
				Phase::Copying => {
					if self.buf.is_empty() {
						return Ok(());
					}
					self.ensure_new_file()?;
					let buf = std::mem::take(&mut self.buf);
					self.new.as_mut().unwrap().write_all(&buf)?;
					return Ok(());
				}
				Phase::Done => return Ok(()),
				Phase::Scanning { old_block } => {
					if old_block.is_none() {
						let mut block = vec![0u8; self.block_size];
						let old = self.old.as_mut().expect("scanning implies old file");
						let mut total = 0;
						while total < block.len() {
							let n = old.read(&mut block[total..])?;
							if n == 0 {
								break;
							}
							total += n;
						}
						block.truncate(total);
						*old_block = Some(block);
					}
					let desired = {
						let b = old_block.as_ref().unwrap();
						if b.is_empty() {
							self.block_size
						} else {
							b.len()
						}
					};
					if self.buf.len() < desired {
						// Need more bytes before we can decide; wait for
						// the next write() call (or finish()).
						return Ok(());
					}
					let databuf: Vec<u8> = self.buf.drain(..desired).collect();
					let old_is_eof = old_block.as_ref().unwrap().is_empty();
					if old_is_eof {
						if databuf.is_empty() {
							self.modified = Some(false);
							self.phase = Phase::Done;
							return Ok(());
						} else {
							self.start_copying(&databuf)?;
						}
					} else if databuf == *old_block.as_ref().unwrap() {
						self.prefix_len += databuf.len() as u64;
						*old_block = None;
					} else {
						self.start_copying(&databuf)?;
					}
				}
			}
		}
	}

	/// Flush any buffered bytes with no more input coming (signals EOF of
	/// the new stream to the scanning phase) and commit the result.
	/// Consumes `self`; returns whether the file was modified.
	pub fn finish(mut self) -> io::Result<bool> {
		// Drive the state machine to completion with an empty final read.
		loop {
			match &self.phase {
				Phase::Scanning { .. } => {
					// Force the comparison to conclude: treat whatever is
					// left in `buf` as the final (possibly short) chunk.
					let rest = std::mem::take(&mut self.buf);
					self.finish_scanning(rest)?;
				}
				Phase::Copying | Phase::Done => break,
			}
		}
		if matches!(self.phase, Phase::Done) {
			self.finished = true;
			return Ok(false);
		}
		self.ensure_new_file()?;
		let tmp = self.new.take().expect("copying implies a temp file");
		let (file, path) = tmp.keep().map_err(|e| e.error)?;
		file.sync_all()?;
		drop(file);
		let mut perms = fs::metadata(&path)?.permissions();
		use std::os::unix::fs::PermissionsExt;
		perms.set_mode(0o644);
		fs::set_permissions(&path, perms)?;
		fs::rename(&path, &self.path)?;
		self.finished = true;
		self.modified = Some(true);
		Ok(true)
	}

	fn finish_scanning(&mut self, rest: Vec<u8>) -> io::Result<()> {
		let Phase::Scanning { old_block } = &mut self.phase else {
			return Ok(());
		};
		if old_block.is_none() {
			let mut block = vec![0u8; self.block_size];
			let old = self.old.as_mut().expect("scanning implies old file");
			let mut total = 0;
			while total < block.len() {
				let n = old.read(&mut block[total..])?;
				if n == 0 {
					break;
				}
				total += n;
			}
			block.truncate(total);
			*old_block = Some(block);
		}
		let old_is_eof = old_block.as_ref().unwrap().is_empty();
		if old_is_eof && rest.is_empty() {
			self.modified = Some(false);
			self.phase = Phase::Done;
			return Ok(());
		}
		if !old_is_eof && rest == *old_block.as_ref().unwrap() {
			self.prefix_len += rest.len() as u64;
			self.modified = Some(false);
			self.phase = Phase::Done;
			return Ok(());
		}
		self.start_copying(&rest)
	}

	/// Abort the write: discard any temp file, leave the target untouched.
	pub fn abort(mut self) {
		self.finished = true;
		if let Some(tmp) = self.new.take() {
			drop(tmp); // NamedTempFile unlinks itself on drop
		}
	}
}

impl Write for UpdateFile {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.feed(buf)?;
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl Drop for UpdateFile {
	fn drop(&mut self) {
		if !self.finished {
			// Caller dropped us without calling finish()/abort(): behave
			// like abort() so a half-written temp file is never left
			// renamed over the destination.
			if let Some(tmp) = self.new.take() {
				drop(tmp);
			}
		}
	}
}

/// One-shot helper: write `data` to `path` only if it differs from the
/// current content. Returns whether the file was modified.
pub fn update_file(path: impl Into<PathBuf>, data: &[u8]) -> io::Result<bool> {
	let mut fh = UpdateFile::new(path)?;
	fh.write_all(data)?;
	fh.finish()
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::RngCore;
	use std::io::Write as _;

	fn random_bytes(len: usize) -> Vec<u8> {
		let mut v = vec![0u8; len];
		rand::thread_rng().fill_bytes(&mut v);
		v
	}

	fn flip_byte(data: &[u8], index: usize) -> Vec<u8> {
		let mut v = data.to_vec();
		v[index] = v[index].wrapping_add(1);
		v
	}

	#[test]
	fn write_new_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes((2 << 20) + 30);
		assert!(update_file(&path, &data).unwrap());
		assert_eq!(fs::read(&path).unwrap(), data);
	}

	#[test]
	fn no_change_leaves_mtime() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes(1 << 20);
		update_file(&path, &data).unwrap();
		let mtime = fs::metadata(&path).unwrap().modified().unwrap();
		assert!(!update_file(&path, &data).unwrap());
		assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime);
		assert_eq!(fs::read(&path).unwrap(), data);
	}

	#[test]
	fn single_byte_flips_at_various_offsets() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes((2 << 20) + 30);
		for offset in [0usize, 1000, 512 << 10, 520 << 10, 1 << 20] {
			fs::write(&path, &data).unwrap();
			let changed = flip_byte(&data, offset);
			assert!(update_file(&path, &changed).unwrap(), "offset {offset}");
			assert_eq!(fs::read(&path).unwrap(), changed);
		}
	}

	#[test]
	fn extend_and_truncate() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes(1 << 20);

		fs::write(&path, &data).unwrap();
		let mut extended = data.clone();
		extended.extend_from_slice(b"asdfghjkl");
		assert!(update_file(&path, &extended).unwrap());
		assert_eq!(fs::read(&path).unwrap(), extended);

		fs::write(&path, &data).unwrap();
		let truncated = &data[..300_000];
		assert!(update_file(&path, truncated).unwrap());
		assert_eq!(fs::read(&path).unwrap(), truncated);
	}

	#[test]
	fn streaming_writes_in_chunks() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes(1 << 20);
		fs::write(&path, &data).unwrap();
		let mut extended = data.clone();
		extended.extend_from_slice(b"asdfghjkl");

		let mut fh = UpdateFile::new(&path).unwrap();
		for chunk in extended.chunks(384 << 10) {
			fh.write_all(chunk).unwrap();
		}
		assert!(fh.finish().unwrap());
		assert_eq!(fs::read(&path).unwrap(), extended);
	}

	#[test]
	fn streaming_writes_no_change() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes(1 << 20);
		fs::write(&path, &data).unwrap();

		let mut fh = UpdateFile::new(&path).unwrap();
		fh.write_all(&data).unwrap();
		assert!(!fh.finish().unwrap());
		assert_eq!(fs::read(&path).unwrap(), data);
	}

	#[test]
	fn aborted_write_leaves_original_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("file");
		let data = random_bytes(1 << 20);
		fs::write(&path, &data).unwrap();

		let mut fh = UpdateFile::new(&path).unwrap();
		fh.write_all(b"garbage-that-never-gets-committed").unwrap();
		fh.abort();
		assert_eq!(fs::read(&path).unwrap(), data);
		// no stray temp files left in the directory
		let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
		assert_eq!(entries.len(), 1);
	}
}
