//! Small, independently-testable primitives shared by the reconcilers,
//! scheduler, and archive pipeline. Each submodule corresponds to one
//! leaf component from the component design: the atomic updater, the xattr
//! store, the bloom presence set, the subprocess pipeline, and the process
//! lock.

pub mod atomic_update;
pub mod bloom;
pub mod lock;
pub mod pipeline;
pub mod xattrs;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub const TEMPFILE_PREFIX: &str = ".backup-tmp";

/// `os.makedirs`, tolerating the directory already existing.
pub fn make_dir_path(path: impl AsRef<Path>) -> std::io::Result<PathBuf> {
	let path = path.as_ref().to_path_buf();
	match fs::create_dir_all(&path) {
		Ok(()) => Ok(path),
		Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(path),
		Err(e) => Err(e),
	}
}

/// Probabilistically decide whether to do optional extra work (scrubbing,
/// ACL refresh), the way the original samples `random.random() < p` once per
/// unit per run.
pub fn random_do_work(probability: f64) -> bool {
	rand::thread_rng().gen::<f64>() < probability
}

pub fn unix_time(t: SystemTime) -> i64 {
	match t.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(e) => -(e.duration().as_secs() as i64),
	}
}

pub fn humanize_size(size: f64) -> String {
	const UNITS: [&str; 5] = ["  B", "KiB", "MiB", "GiB", "TiB"];
	let mut size = size;
	let mut index = 0;
	while size >= 1024.0 && index < UNITS.len() - 1 {
		size /= 1024.0;
		index += 1;
	}
	format!("{size:.1} {}", UNITS[index])
}

/// Recursively delete anything under `root` for which `is_valid` returns
/// false, directories last. `is_valid` is typically backed by a
/// [`bloom::BloomSet`] for large trees or a `HashSet<PathBuf>` for small
/// ones; directories that become empty as a result are removed too,
/// tolerating ones that don't (still occupied by something we decided to
/// keep).
pub fn gc_directory_tree(
	root: &Path,
	is_valid: impl Fn(&Path) -> bool,
	mut report: impl FnMut(&Path, bool),
) -> std::io::Result<()> {
	gc_walk(root, &is_valid, &mut report)
}

fn gc_walk(
	dir: &Path,
	is_valid: &impl Fn(&Path) -> bool,
	report: &mut impl FnMut(&Path, bool),
) -> std::io::Result<()> {
	if !dir.is_dir() {
		return Ok(());
	}
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let path = entry.path();
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			gc_walk(&path, is_valid, report)?;
			if !is_valid(&path) {
				if fs::remove_dir(&path).is_ok() {
					report(&path, true);
				}
			}
		} else if !is_valid(&path) {
			fs::remove_file(&path)?;
			report(&path, false);
		}
	}
	Ok(())
}

fn utimensat(path: &Path, mtime: i64, flags: libc::c_int) -> std::io::Result<()> {
	use std::os::unix::ffi::OsStrExt;
	let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())?;
	let ts = libc::timespec {
		tv_sec: mtime as libc::time_t,
		tv_nsec: 0,
	};
	let times = [ts, ts];
	let ret = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), flags) };
	if ret != 0 {
		return Err(std::io::Error::last_os_error());
	}
	Ok(())
}

/// Set the mtime (and atime) of a symlink itself, without following it.
/// `std::fs::File::set_times` cannot target a symlink, so this goes
/// straight to `utimensat(2)` with `AT_SYMLINK_NOFOLLOW`.
pub fn lutime(path: &Path, mtime: i64) -> std::io::Result<()> {
	utimensat(path, mtime, libc::AT_SYMLINK_NOFOLLOW)
}

/// Set the mtime (and atime) of `path`, following symlinks.
pub fn set_mtime(path: &Path, mtime: i64) -> std::io::Result<()> {
	utimensat(path, mtime, 0)
}

pub fn random_hex_suffix(len: usize) -> String {
	let mut rng = rand::thread_rng();
	(0..len)
		.map(|_| format!("{:x}", rng.gen_range(0..16u8)))
		.collect()
}
