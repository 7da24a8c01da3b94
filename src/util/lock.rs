//! Exclusive, non-blocking, filesystem-anchored process lock (component
//! C7).
//!
//! Before any mutating top-level command runs, we check that the backup
//! root is actually a mounted filesystem (not merely a directory on the
//! parent device — a sign the volume failed to mount) and take a
//! non-blocking advisory lock on `<root>/.lock/<name>`. Held for the
//! process's lifetime; released automatically on drop (including on
//! panic unwind and on Ctrl-C, since the lock file descriptor is closed
//! either way).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fs4::FileExt;

use crate::error::{Error, Result};
use crate::util::make_dir_path;

pub struct LockFile {
	_file: File,
}

/// Acquire `<root>/.lock/<name>`, verifying first that `root` is mounted
/// (its device differs from its parent's). Returns [`Error::NotMounted`]
/// or [`Error::LockConflict`] as appropriate.
pub fn acquire(root: &Path, name: &str) -> Result<LockFile> {
	let root_dev = root.metadata()?.dev();
	let parent = root.parent().unwrap_or(root);
	let parent_dev = parent.metadata()?.dev();
	if root_dev == parent_dev {
		return Err(Error::NotMounted {
			path: root.to_path_buf(),
		});
	}

	let lock_dir = make_dir_path(root.join(".lock"))?;
	let lock_path = lock_dir.join(name);
	let file = OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(false)
		.open(&lock_path)?;

	match file.try_lock_exclusive() {
		Ok(()) => Ok(LockFile { _file: file }),
		Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::LockConflict {
			name: name.to_string(),
		}),
		Err(e) => Err(e.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_lock_conflicts() {
		let dir = tempfile::tempdir().unwrap();
		// tempdir is on the same device as its parent, so bypass the
		// mount check by locking the file directly instead of going
		// through acquire().
		let lock_dir = dir.path().join(".lock");
		std::fs::create_dir_all(&lock_dir).unwrap();
		let path = lock_dir.join("run");
		let f1 = OpenOptions::new()
			.write(true)
			.create(true)
			.open(&path)
			.unwrap();
		f1.try_lock_exclusive().unwrap();

		let f2 = OpenOptions::new()
			.write(true)
			.create(true)
			.open(&path)
			.unwrap();
		assert!(f2.try_lock_exclusive().is_err());
	}
}
