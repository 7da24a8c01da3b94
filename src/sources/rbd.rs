//! RBD diff-based reconciler (component C8.4.6.3).
//!
//! Images are backed up as flat, sparse files built by replaying
//! `rbd export-diff` streams. A backup starts as a full export, then every
//! subsequent run exports an incremental diff against the previously
//! recorded snapshot, applies it onto the existing file, and rebases.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::Unit;
use crate::util::xattrs::XAttrs;
use crate::util::{make_dir_path, random_do_work};

const BLOCKSIZE: usize = 256 << 10;
const DIFF_MAGIC: &[u8] = b"rbd diff v1\n";
const PENDING_EXT: &str = ".pending";
const ATTR_SNAPSHOT: &str = "user.rbd.snapshot";
const ATTR_PENDING_SNAPSHOT: &str = "user.rbd.pending-snapshot";
const ATTR_SNAPID: &str = "user.rbd.snapid";

pub fn get_relroot(pool: &str, friendly_name: &str, snapshot: bool) -> String {
	let kind = if snapshot { "snapshots" } else { "images" };
	format!("rbd/{pool}/{kind}/{friendly_name}")
}

pub fn get_units(config: &Config) -> Result<Vec<Unit>> {
	let mut entries: Vec<_> = config.rbd.iter().collect();
	entries.sort_by_key(|(name, _)| (*name).clone());

	let mut units = Vec::new();
	for (friendly_name, info) in entries {
		let mut backup_args = vec![
			"rbd".to_string(),
			"backup".to_string(),
			info.pool.clone(),
			friendly_name.clone(),
		];
		if random_do_work(config.settings.rbd_scrub_probability) {
			backup_args.push("-c".to_string());
		}
		if info.snapshot {
			backup_args.push("-s".to_string());
		}
		units.push(Unit {
			root: get_relroot(&info.pool, friendly_name, info.snapshot),
			backup_args,
		});
	}
	Ok(units)
}

fn rbd_exec(pool: &str, subcommand: &str, args: &[String]) -> Result<()> {
	let mut cmd = vec!["rbd".to_string(), subcommand.to_string()];
	cmd.extend(args.iter().cloned());
	cmd.push("-p".to_string());
	cmd.push(pool.to_string());
	println!("{}", cmd.join(" "));
	let status = Command::new(&cmd[0]).args(&cmd[1..]).status()?;
	if !status.success() {
		return Err(Error::SubprocessFailed {
			program: "rbd".into(),
			code: status.code().unwrap_or(-1),
		});
	}
	Ok(())
}

#[derive(Debug, Deserialize)]
struct RbdImageEntry {
	image: String,
	snapshot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RbdSnapEntry {
	id: u64,
	name: String,
}

fn rbd_query(pool: &str, args: &[&str]) -> Result<Vec<u8>> {
	let mut cmd = vec!["rbd".to_string()];
	cmd.extend(args.iter().map(|s| s.to_string()));
    cmd.push("-p".to_string());
    cmd.push(pool.to_string());
    cmd.push("--format=json".to_string());
	let output = Command::new(&cmd[0]).args(&cmd[1..]).output()?;
	if !output.status.success() {
		return Err(Error::SubprocessFailed {
			program: "rbd".into(),
			code: output.status.code().unwrap_or(-1),
		});
	}
	Ok(output.stdout)
}

fn get_image_for_snapshot(pool: &str, snapshot: &str) -> Result<Option<String>> {
	let out = rbd_query(pool, &["ls", "-l"])?;
	let entries: Vec<RbdImageEntry> = serde_json::from_slice(&out).unwrap_or_default();
	Ok(entries
		.into_iter()
		.find(|e| e.snapshot.as_deref() == Some(snapshot))
		.map(|e| e.image))
}

fn get_snapid_for_snapshot(pool: &str, image: &str, snapshot: &str) -> Result<Option<u64>> {
	let out = rbd_query(pool, &["snap", "ls", "-l", image])?;
	let entries: Vec<RbdSnapEntry> = serde_json::from_slice(&out).unwrap_or_default();
	Ok(entries.into_iter().find(|e| e.name == snapshot).map(|e| e.id))
}

fn create_snapshot(pool: &str, image: &str) -> Result<String> {
	let snapshot = format!("backup-{}", Uuid::new_v4());
	rbd_exec(
		pool,
		"snap",
		&["create".into(), "--image".into(), image.into(), "--snap".into(), snapshot.clone()],
	)?;
	Ok(snapshot)
}

fn delete_snapshot(pool: &str, image: &str, snapshot: &str) -> Result<()> {
	rbd_exec(
		pool,
		"snap",
		&["rm".into(), "--image".into(), image.into(), "--snap".into(), snapshot.into()],
	)
}

fn try_unlink(path: &Path) {
	let _ = std::fs::remove_file(path);
}

/// Punch a hole in `file` at `[offset, offset+length)`, falling back to
/// a no-op if the filesystem doesn't support it (sparse file semantics
/// are then approximated by the zero writes that already happened).
fn punch(file: &File, offset: u64, length: u64) -> std::io::Result<()> {
	let ret = unsafe {
		libc::fallocate(
			file.as_raw_fd(),
			libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
			offset as libc::off_t,
			length as libc::off_t,
		)
	};
	if ret != 0 {
		let err = std::io::Error::last_os_error();
		if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
			return Err(err);
		}
	}
	Ok(())
}

/// A writable file-like object that opens read-only until the first
/// write or punch, at which point it reopens read-write at the same
/// offset. Minimizes unnecessary COW against an LVM snapshot when a
/// diff contains no changes to a given region.
struct LazyWriteFile {
	path: PathBuf,
	file: File,
	writable: bool,
}

impl LazyWriteFile {
	fn open(path: &Path, create: bool) -> std::io::Result<Self> {
		let file = if create && !path.exists() {
			OpenOptions::new().read(true).write(true).create(true).open(path)?
		} else {
			File::open(path)?
		};
		let writable = create && path.exists();
		Ok(Self {
			path: path.to_path_buf(),
			file,
			writable: writable || create,
		})
	}

	fn reopen_rw(&mut self) -> std::io::Result<()> {
		if self.writable {
			return Ok(());
		}
		let offset = self.file.stream_position()?;
		self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
		self.file.seek(SeekFrom::Start(offset))?;
		self.writable = true;
		Ok(())
	}

	fn truncate(&mut self, len: u64) -> std::io::Result<()> {
		let saved = self.file.stream_position()?;
		let current_len = self.file.seek(SeekFrom::End(0))?;
		self.file.seek(SeekFrom::Start(saved))?;
		if current_len != len {
			self.reopen_rw()?;
			self.file.set_len(len)?;
		}
		Ok(())
	}

	fn write_data(&mut self, buf: &[u8]) -> std::io::Result<()> {
		self.reopen_rw()?;
		self.file.write_all(buf)
	}

	fn punch(&mut self, offset: u64, length: u64) -> std::io::Result<()> {
		self.reopen_rw()?;
		punch(&self.file, offset, length)
	}
}

/// A [`LazyWriteFile`] that treats the existing file as ground truth: on
/// write, compares the incoming bytes against what's on disk and only
/// reopens read-write (and overwrites) when they actually differ.
struct ScrubbingFile(LazyWriteFile);

impl ScrubbingFile {
	fn open(path: &Path) -> std::io::Result<Self> {
		Ok(Self(LazyWriteFile::open(path, false)?))
	}

	fn write_data(&mut self, buf: &[u8]) -> std::io::Result<()> {
		let mut start = 0;
		while start < buf.len() {
			let want = (buf.len() - start).min(BLOCKSIZE);
			let mut disk_buf = vec![0u8; want];
			let n = self.0.file.read(&mut disk_buf)?;
			disk_buf.truncate(n);
			let input = &buf[start..start + n];
			if disk_buf != input {
				self.0.file.seek(SeekFrom::Current(-(n as i64)))?;
				eprintln!("Fixing data mismatch at {}", self.0.file.stream_position()?);
				self.0.write_data(input)?;
			}
			if n == 0 {
				break;
			}
			start += n;
		}
		Ok(())
	}

	fn punch(&mut self, offset: u64, length: u64) -> std::io::Result<()> {
		if !self.0.writable {
			self.0.file.seek(SeekFrom::Start(offset))?;
			let mut buf = vec![0u8; length as usize];
			let n = self.0.file.read(&mut buf)?;
			if n as u64 == length && buf[..n].iter().all(|&b| b == 0) {
				return Ok(());
			}
		}
		self.0.punch(offset, length)
	}
}

fn export_diff(pool: &str, image: &str, snapshot: &str, basis: Option<&str>) -> Result<std::process::Child> {
	let mut cmd = vec![
		"rbd".to_string(),
		"export-diff".to_string(),
		"--no-progress".to_string(),
		"-p".to_string(),
		pool.to_string(),
		image.to_string(),
		"--snap".to_string(),
		snapshot.to_string(),
		"-".to_string(),
	];
	if let Some(basis) = basis {
		cmd.push("--from-snap".to_string());
		cmd.push(basis.to_string());
	}
	println!("{}", cmd.join(" "));
	Ok(Command::new(&cmd[0]).args(&cmd[1..]).stdout(Stdio::piped()).spawn()?)
}

fn read_exact_or_err(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
	r.read_exact(buf).map_err(|e| Error::BadRbdDiff {
		message: format!("short read: {e}"),
	})
}

enum Sink<'a> {
	Write(&'a mut LazyWriteFile),
	Scrub(&'a mut ScrubbingFile),
}

impl Sink<'_> {
	fn truncate(&mut self, len: u64) -> std::io::Result<()> {
		match self {
			Sink::Write(f) => f.truncate(len),
			Sink::Scrub(_) => Ok(()),
		}
	}

	fn write_data(&mut self, buf: &[u8]) -> std::io::Result<()> {
		match self {
			Sink::Write(f) => f.write_data(buf),
			Sink::Scrub(f) => f.write_data(buf),
		}
	}

	fn punch(&mut self, offset: u64, length: u64) -> std::io::Result<()> {
		match self {
			Sink::Write(f) => f.punch(offset, length),
			Sink::Scrub(f) => f.punch(offset, length),
		}
	}
}

/// Parse and apply an `rbd export-diff` stream. Record types: `f`/`t`
/// (source/dest snapshot name, ignored), `s` (image size, truncates the
/// destination), `w` (data write), `z` (zero range, punches a hole), `e`
/// (end of stream — nothing may follow).
fn unpack_diff(input: &mut impl Read, mut output: Sink<'_>, verbose: bool) -> Result<()> {
	let mut total_size = 0u64;
	let mut total_changed = 0u64;

	let mut magic = [0u8; 12];
	read_exact_or_err(input, &mut magic)?;
	if magic != DIFF_MAGIC {
		return Err(Error::BadRbdDiff {
			message: "missing diff magic string".into(),
		});
	}

	loop {
		let mut type_buf = [0u8; 1];
		read_exact_or_err(input, &mut type_buf)?;
		match &type_buf {
			b"f" | b"t" => {
				let mut len_buf = [0u8; 4];
				read_exact_or_err(input, &mut len_buf)?;
				let len = u32::from_le_bytes(len_buf) as usize;
				let mut discard = vec![0u8; len];
				read_exact_or_err(input, &mut discard)?;
			}
			b"s" => {
				let mut buf = [0u8; 8];
				read_exact_or_err(input, &mut buf)?;
				total_size = u64::from_le_bytes(buf);
				output.truncate(total_size)?;
			}
			b"w" => {
				let mut buf = [0u8; 16];
				read_exact_or_err(input, &mut buf)?;
				let offset = u64::from_le_bytes(buf[0..8].try_into().unwrap());
				let mut length = u64::from_le_bytes(buf[8..16].try_into().unwrap());
				total_changed += length;
				if let Sink::Write(f) = &mut output {
					f.file.seek(SeekFrom::Start(offset))?;
				} else if let Sink::Scrub(f) = &mut output {
					f.0.file.seek(SeekFrom::Start(offset))?;
				}
				let mut chunk = vec![0u8; BLOCKSIZE];
				while length > 0 {
					let want = length.min(BLOCKSIZE as u64) as usize;
					read_exact_or_err(input, &mut chunk[..want])?;
					output.write_data(&chunk[..want])?;
					length -= want as u64;
				}
			}
			b"z" => {
				let mut buf = [0u8; 16];
				read_exact_or_err(input, &mut buf)?;
				let offset = u64::from_le_bytes(buf[0..8].try_into().unwrap());
				let length = u64::from_le_bytes(buf[8..16].try_into().unwrap());
				total_changed += length;
				output.punch(offset, length)?;
			}
			b"e" => {
				let mut trailing = [0u8; 1];
				if input.read(&mut trailing)? != 0 {
					return Err(Error::BadRbdDiff {
						message: "expected EOF, didn't find it".into(),
					});
				}
				break;
			}
			other => {
				return Err(Error::BadRbdDiff {
					message: format!("unknown record type: {:?}", other[0] as char),
				})
			}
		}
	}
	if verbose {
		println!("{total_changed} bytes written, {total_size} total");
	}
	Ok(())
}

pub fn fetch_snapshot(pool: &str, image: &str, snapshot: &str, path: &Path) -> Result<()> {
	if path.exists() {
		std::fs::remove_file(path)?;
	}
	let mut child = export_diff(pool, image, snapshot, None)?;
	let mut stdout = child.stdout.take().expect("piped stdout");

	let result = (|| -> Result<()> {
		let mut ofh = LazyWriteFile::open(path, true)?;
		unpack_diff(&mut stdout, Sink::Write(&mut ofh), true)?;
		Ok(())
	})();

	let status = child.wait()?;
	if result.is_err() || !status.success() {
		try_unlink(path);
		result?;
		return Err(Error::SubprocessFailed {
			program: "rbd export-diff".into(),
			code: status.code().unwrap_or(-1),
		});
	}
	XAttrs::new(path).update(ATTR_SNAPSHOT, snapshot)?;
	Ok(())
}

pub fn scrub_snapshot(pool: &str, image: &str, snapshot: &str, path: &Path) -> Result<()> {
	let mut child = export_diff(pool, image, snapshot, None)?;
	let mut stdout = child.stdout.take().expect("piped stdout");
	let mut ofh = ScrubbingFile::open(path)?;
	unpack_diff(&mut stdout, Sink::Scrub(&mut ofh), false)?;
	let status = child.wait()?;
	if !status.success() {
		return Err(Error::SubprocessFailed {
			program: "rbd export-diff".into(),
			code: status.code().unwrap_or(-1),
		});
	}
	Ok(())
}

pub fn fetch_image(pool: &str, image: &str, path: &Path) -> Result<()> {
	let snapshot = create_snapshot(pool, image)?;
	if let Err(e) = fetch_snapshot(pool, image, &snapshot, path) {
		let _ = delete_snapshot(pool, image, &snapshot);
		return Err(e);
	}
	Ok(())
}

fn make_patch(pool: &str, image: &str, path: &Path) -> Result<()> {
	let attrs = XAttrs::new(path);
	let old_snapshot = attrs.get(ATTR_SNAPSHOT)?;
	let pending_path = pending_path_for(path);
	if attrs.contains(ATTR_PENDING_SNAPSHOT)? {
		return Err(Error::DumpError {
			message: "pending snapshot already exists".into(),
		});
	}
	try_unlink(&pending_path);

	let new_snapshot = create_snapshot(pool, image)?;
	let result = (|| -> Result<()> {
		let mut fh = File::create(&pending_path)?;
		let mut child = export_diff(pool, image, &new_snapshot, old_snapshot.as_deref())?;
		let mut stdout = child.stdout.take().expect("piped stdout");
		std::io::copy(&mut stdout, &mut fh)?;
		let status = child.wait()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "rbd export-diff".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		attrs.update(ATTR_PENDING_SNAPSHOT, &new_snapshot)?;
		Ok(())
	})();
	if result.is_err() {
		try_unlink(&pending_path);
		let _ = delete_snapshot(pool, image, &new_snapshot);
	}
	result
}

fn pending_path_for(path: &Path) -> PathBuf {
	let mut s = path.as_os_str().to_os_string();
	s.push(PENDING_EXT);
	PathBuf::from(s)
}

fn apply_patch_and_rebase(pool: &str, image: &str, path: &Path) -> Result<()> {
	let pending_path = pending_path_for(path);
	let attrs = XAttrs::new(path);
	let old_snapshot = attrs.get(ATTR_SNAPSHOT)?;
	let new_snapshot = attrs.get(ATTR_PENDING_SNAPSHOT)?;
	let Some(new_snapshot) = new_snapshot else {
		try_unlink(&pending_path);
		return Ok(());
	};
	{
		let mut ifh = File::open(&pending_path)?;
		let mut ofh = LazyWriteFile::open(path, true)?;
		unpack_diff(&mut ifh, Sink::Write(&mut ofh), true)?;
	}
	if let Some(old_snapshot) = old_snapshot {
		delete_snapshot(pool, image, &old_snapshot)?;
	}
	attrs.update(ATTR_SNAPSHOT, &new_snapshot)?;
	attrs.delete(ATTR_PENDING_SNAPSHOT)?;
	std::fs::remove_file(&pending_path)?;
	Ok(())
}

pub fn backup_image(pool: &str, image: &str, path: &Path) -> Result<()> {
	let attrs = XAttrs::new(path);
	let mut old_snapshot = attrs.get(ATTR_SNAPSHOT)?;

	if let Some(snapshot) = &old_snapshot {
		let old_image = get_image_for_snapshot(pool, snapshot)?;
		if old_image.as_deref() != Some(image) {
			if let Some(old_image) = &old_image {
				let _ = delete_snapshot(pool, old_image, snapshot);
			}
			std::fs::remove_file(path)?;
			old_snapshot = None;
		}
	}

	if old_snapshot.is_none() {
		fetch_image(pool, image, path)
	} else {
		apply_patch_and_rebase(pool, image, path)?;
		make_patch(pool, image, path)?;
		apply_patch_and_rebase(pool, image, path)
	}
}

pub fn backup_snapshot(pool: &str, snapshot: &str, path: &Path) -> Result<()> {
	let image = get_image_for_snapshot(pool, snapshot)?.ok_or_else(|| Error::DumpError {
		message: format!("couldn't locate snapshot {snapshot}"),
	})?;
	let snapid = get_snapid_for_snapshot(pool, &image, snapshot)?.ok_or_else(|| Error::DumpError {
		message: format!("couldn't locate snapshot {snapshot}"),
	})?;
	let attrs = XAttrs::new(path);
	if attrs.get(ATTR_SNAPID)? == Some(snapid.to_string()) {
		return Ok(());
	}
	fetch_snapshot(pool, &image, snapshot, path)?;
	attrs.update(ATTR_SNAPID, &snapid.to_string())
}

pub fn restore_image(path: &Path, pool: &str, image: &str) -> Result<()> {
	if XAttrs::new(path).get(ATTR_PENDING_SNAPSHOT)?.is_some() {
		return Err(Error::VerificationFailed {
			message: "backup image has partially-applied diff".into(),
		});
	}
	rbd_exec(pool, "import", &[path.display().to_string(), image.to_string()])
}

pub fn drop_image_snapshots(pool: &str, path: &Path) -> Result<()> {
	if !path.exists() {
		return Ok(());
	}
	let attrs = XAttrs::new(path);
	for attr in [ATTR_SNAPSHOT, ATTR_PENDING_SNAPSHOT] {
		if let Some(snapshot) = attrs.get(attr)? {
			if let Ok(Some(image)) = get_image_for_snapshot(pool, &snapshot) {
				let _ = delete_snapshot(pool, &image, &snapshot);
			}
			attrs.delete(attr)?;
		}
	}
	try_unlink(&pending_path_for(path));
	Ok(())
}

pub fn backup(config: &Config, pool: &str, friendly_name: &str, scrub: bool, snapshot: bool) -> Result<()> {
	let settings = &config.settings;
	let entry = config
		.rbd
		.get(friendly_name)
		.ok_or_else(|| Error::DumpError {
			message: format!("no manifest entry for {friendly_name}"),
		})?;
	let out_path = settings.root.join(get_relroot(pool, friendly_name, snapshot));
	if let Some(parent) = out_path.parent() {
		make_dir_path(parent)?;
	}
	if snapshot {
		backup_snapshot(pool, &entry.image, &out_path)?;
		if scrub {
			if let Some(image) = get_image_for_snapshot(pool, &entry.image)? {
				scrub_snapshot(pool, &image, &entry.image, &out_path)?;
			}
		}
	} else {
		backup_image(pool, &entry.image, &out_path)?;
		if scrub {
			if let Some(snapshot) = XAttrs::new(&out_path).get(ATTR_SNAPSHOT)? {
				scrub_snapshot(pool, &entry.image, &snapshot, &out_path)?;
			}
		}
	}
	Ok(())
}
