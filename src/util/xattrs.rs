//! Extended-attribute metadata store (component C2).
//!
//! Mirror entries carry source-side metadata the local filesystem can't
//! natively represent (owner triples, upstream ETags, RBD snapshot
//! pointers) as xattrs. All access is no-follow: we never want to chase a
//! symlink and tag the wrong inode.

use std::path::Path;

use crate::error::Result;

pub struct XAttrs<'a> {
	path: &'a Path,
}

impl<'a> XAttrs<'a> {
	pub fn new(path: &'a Path) -> Self {
		Self { path }
	}

	pub fn get(&self, key: &str) -> Result<Option<String>> {
		match xattr::get(self.path, key)? {
			Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
			None => Ok(None),
		}
	}

	pub fn contains(&self, key: &str) -> Result<bool> {
		Ok(self.get(key)?.is_some())
	}

	/// Set `key` to `value` only if it's different from the current
	/// value, avoiding a spurious xattr-table rewrite (and, in turn,
	/// unnecessary COW on the snapshot).
	pub fn update(&self, key: &str, value: &str) -> Result<()> {
		if self.get(key)?.as_deref() != Some(value) {
			xattr::set(self.path, key, value.as_bytes())?;
		}
		Ok(())
	}

	pub fn delete(&self, key: &str) -> Result<()> {
		match xattr::remove(self.path, key) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_get_delete_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"hi").unwrap();
		let attrs = XAttrs::new(&path);

		assert_eq!(attrs.get("user.deltaic.test").unwrap(), None);
		attrs.update("user.deltaic.test", "value").unwrap();
		assert_eq!(
			attrs.get("user.deltaic.test").unwrap(),
			Some("value".to_string())
		);
		attrs.delete("user.deltaic.test").unwrap();
		assert_eq!(attrs.get("user.deltaic.test").unwrap(), None);
	}
}
