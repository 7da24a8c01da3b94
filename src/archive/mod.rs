//! Offsite archiving (component C11): a pluggable backend uploads one
//! packed, optionally GPG-signed tarball per mirror unit per snapshot,
//! and a parallel metadata ledger tracks completeness so interrupted
//! runs can resume and old sets can be pruned.
//!
//! The original discovers `Archiver` subclasses via setuptools entry
//! points (`deltaic.archivers`); here the backend set is the closed pair
//! named by [`crate::config::ArchiverKind`], matching the rest of the
//! source/sink plugin tables in this crate.

pub mod aws;
pub mod googledrive;
pub mod packer;
pub mod retrieval;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{PhysicalSnapshot, Snapshot};
use crate::util::make_dir_path;

pub use packer::{ArchiveInfo, ArchivePacker};

/// Per-set rollup returned by [`Archiver::list_sets`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetMetadata {
	pub count: u64,
	pub size: u64,
	pub complete: bool,
	/// Backends may refuse to delete a set for a backend-specific reason
	/// (e.g. AWS's early-deletion penalty window); `prune` respects this.
	pub protected: bool,
}

/// One backend implementation: AWS (SimpleDB + Glacier) or Google Drive.
/// Every method is synchronous from the caller's perspective; async
/// backends drive their own `tokio::runtime::Handle` internally, the
/// same pattern used by the rgw and github sources.
pub trait Archiver: Send + Sync {
	fn profile_name(&self) -> &str;
	fn workers(&self) -> usize;
	fn keep_count(&self) -> usize;

	fn list_sets(&self) -> Result<HashMap<String, SetMetadata>>;
	fn complete_set(&self, set_name: &str) -> Result<()>;
	fn delete_set(&self, set_name: &str) -> Result<()>;

	/// unit name -> metadata, for one set.
	fn list_set_archives(&self, set_name: &str) -> Result<HashMap<String, ArchiveInfo>>;
	fn upload_archive(&self, set_name: &str, archive_name: &str, metadata: &ArchiveInfo, local_path: &Path) -> Result<()>;

	/// Retrievals are initiated in order but may complete out of order;
	/// the returned vector preserves the order results became available.
	fn download_archives(&self, set_name: &str, archive_list: &[(String, PathBuf)], max_rate: Option<u64>) -> Result<Vec<(String, std::result::Result<ArchiveInfo, Error>)>>;

	fn resync(&self) -> Result<()>;
	fn report_cost(&self) -> Result<()>;
}

fn profile_not_found(name: &str) -> Error {
	Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("archive profile '{name}' not found")))
}

/// Instantiate the backend named by the manifest profile `profile_name`.
pub fn get_archiver(config: &Config, profile_name: &str, runtime: tokio::runtime::Handle) -> Result<Box<dyn Archiver>> {
	let profile = config.archivers.get(profile_name).ok_or_else(|| profile_not_found(profile_name))?;
	match profile.archiver {
		crate::config::ArchiverKind::Aws => Ok(Box::new(aws::AwsArchiver::new(profile_name, profile, runtime)?)),
		crate::config::ArchiverKind::Googledrive => Ok(Box::new(googledrive::GoogledriveArchiver::new(profile_name, profile, runtime)?)),
	}
}

/// One logical offsite archive: `snapshot/unit_name` in backend terms.
#[derive(Debug, Clone)]
pub struct Archive {
	pub snapshot_name: String,
	pub unit_name: String,
	pub size: u64,
}

impl Archive {
	fn store(&self, archiver: &dyn Archiver, in_path: &Path, info: &ArchiveInfo) -> Result<()> {
		archiver.upload_archive(&self.snapshot_name, &self.unit_name, info, in_path)
	}
}

/// One archive backend's view of a mirror snapshot: which units have
/// been uploaded so far, and whether the set has been marked complete.
pub struct SnapshotArchiveSet<'a> {
	archiver: &'a dyn Archiver,
	pub snapshot: Snapshot,
	pub count: u64,
	pub size: u64,
	pub complete: bool,
	pub protected: bool,
}

impl<'a> SnapshotArchiveSet<'a> {
	pub fn new(archiver: &'a dyn Archiver, snapshot: Snapshot) -> Self {
		Self { archiver, snapshot, count: 0, size: 0, complete: false, protected: false }
	}

	pub fn list(archiver: &'a dyn Archiver) -> Result<Vec<Self>> {
		let mut sets: Vec<Self> = Vec::new();
		let mut raw: Vec<(String, SetMetadata)> = archiver.list_sets()?.into_iter().collect();
		raw.sort_by(|a, b| a.0.cmp(&b.0));
		for (set_name, metadata) in raw {
			let snapshot = Snapshot::parse(&set_name)?;
			sets.push(Self {
				archiver,
				snapshot,
				count: metadata.count,
				size: metadata.size,
				complete: metadata.complete,
				protected: metadata.protected,
			});
		}
		sets.sort_by_key(|s| s.snapshot.sort_key());
		Ok(sets)
	}

	pub fn get_archives(&self) -> Result<HashMap<String, Archive>> {
		let result = self.archiver.list_set_archives(&self.snapshot.name)?;
		Ok(result
			.into_iter()
			.map(|(unit_name, info)| {
				let archive = Archive { snapshot_name: self.snapshot.name.clone(), unit_name: unit_name.clone(), size: info.size };
				(unit_name, archive)
			})
			.collect())
	}

	pub fn get_archive(&self, unit_name: &str) -> Archive {
		Archive { snapshot_name: self.snapshot.name.clone(), unit_name: unit_name.to_string(), size: 0 }
	}

	pub fn mark_complete(&self) -> Result<()> {
		self.archiver.complete_set(&self.snapshot.name)
	}

	pub fn delete(&self) -> Result<()> {
		self.archiver.delete_set(&self.snapshot.name)
	}

	/// Download every archive in `archives` into `out_dir`, naming each
	/// `<snapshot>:<unit-name-with-slashes-dashed>`.
	pub fn retrieve_archives(&self, out_dir: &Path, archives: &[Archive], max_rate: Option<u64>) -> Vec<(Archive, std::result::Result<PathBuf, Error>)> {
		let mut lookup = HashMap::new();
		let mut out_paths = HashMap::new();
		let mut request_list = Vec::new();
		let mut results = Vec::new();

		for archive in archives {
			let out_path = out_dir.join(format!("{}:{}", self.snapshot.name, archive.unit_name.replace('/', "-")));
			if out_path.exists() {
				results.push((archive.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::AlreadyExists, "output file already exists")))));
				continue;
			}
			lookup.insert(archive.unit_name.clone(), archive.clone());
			out_paths.insert(archive.unit_name.clone(), out_path.clone());
			request_list.push((archive.unit_name.clone(), out_path));
		}

		let downloaded = match self.archiver.download_archives(&self.snapshot.name, &request_list, max_rate) {
			Ok(d) => d,
			Err(e) => {
				for (name, _) in request_list {
					if let Some(archive) = lookup.get(&name) {
						results.push((archive.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))));
					}
				}
				return results;
			}
		};

		for (archive_name, outcome) in downloaded {
			let Some(archive) = lookup.get(&archive_name) else { continue };
			let out_path = out_paths.get(&archive_name).cloned().unwrap_or_default();
			let result = match outcome {
				Ok(info) => match info.to_file(&out_path) {
					Ok(()) => Ok(out_path),
					Err(e) => Err(e),
				},
				Err(e) => Err(e),
			};
			results.push((archive.clone(), result));
		}
		results
	}
}

/// Pack and upload one mirror unit. This is the entry point re-invoked
/// by the scheduler for each unit of `archive_snapshot`, and directly by
/// the low-level `archive unit` subcommand.
pub fn archive_unit(config: &Config, archiver: &dyn Archiver, archive: &Archive, snapshot_root: &Path) -> Result<()> {
	let profile = config.archivers.get(archiver.profile_name()).ok_or_else(|| profile_not_found(archiver.profile_name()))?;
	let packer = ArchivePacker::new(&config.settings, profile);
	let (spool_file, info) = packer.pack(&archive.snapshot_name, snapshot_root, &archive.unit_name, profile.compression)?;
	archive.store(archiver, spool_file.path(), &info)
}

/// Archive every not-yet-archived unit of `snapshot`, mounting it
/// read-only for the duration. Returns whether every unit succeeded; the
/// set is marked complete only if so.
pub fn archive_snapshot(config: &Config, archiver: &dyn Archiver, snapshot: &PhysicalSnapshot) -> Result<bool> {
	let settings = &config.settings;
	let set = SnapshotArchiveSet::new(archiver, snapshot.snapshot.clone());
	let archives = set.get_archives()?;

	let snapshot_dir = tempfile::Builder::new().prefix("snapshot-").tempdir_in(&settings.archive_spool)?;
	snapshot.mount(snapshot_dir.path())?;

	let outcome = (|| -> Result<bool> {
		let mut units = Vec::new();
		for label in crate::sources::SOURCE_LABELS {
			for unit in crate::sources::get_units(label, config)? {
				let unit_path = snapshot_dir.path().join(&unit.root);
				if unit_path.exists() && !archives.contains_key(&unit.root) {
					units.push(unit);
				}
			}
		}

		if !units.is_empty() {
			let profile_name = archiver.profile_name();
			let log_root = make_dir_path(settings.root.join("Logs").join("Archive").join(profile_name))?;
			let snapshot_dir_str = snapshot_dir.path().display().to_string();
			let archive_units: Vec<crate::scheduler::Unit> = units
				.into_iter()
				.map(|unit| crate::scheduler::Unit {
					backup_args: vec![
						"archive".into(),
						"-p".into(),
						profile_name.to_string(),
						"unit".into(),
						snapshot.name().to_string(),
						snapshot_dir_str.clone(),
						unit.root.clone(),
					],
					root: unit.root,
				})
				.collect();
			if !crate::scheduler::run_units(archive_units, archiver.workers(), &log_root) {
				return Ok(false);
			}
		}

		set.mark_complete()?;
		Ok(true)
	})();

	snapshot.umount(snapshot_dir.path())?;
	outcome
}

/// Delete incomplete sets (except the most recent) and complete sets
/// beyond the profile's `keep-count`, skipping any the backend protects.
pub fn prune_archives(archiver: &dyn Archiver) -> Result<()> {
	let keep_count = archiver.keep_count().max(1);
	let sets = SnapshotArchiveSet::list(archiver)?;

	let mut delete: Vec<&SnapshotArchiveSet> = Vec::new();
	if let Some((_last, rest)) = sets.split_last() {
		delete.extend(rest.iter().filter(|s| !s.complete));
	}
	let complete: Vec<&SnapshotArchiveSet> = sets.iter().filter(|s| s.complete).collect();
	if complete.len() > keep_count {
		delete.extend(&complete[..complete.len() - keep_count]);
	}

	for set in delete.into_iter().filter(|s| !s.protected) {
		let label = if set.complete { "" } else { " incomplete" };
		println!("Pruning{label} archive set {}", set.snapshot.name);
		set.delete()?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	/// A fake [`Archiver`] backed by an in-memory set table, just enough to
	/// exercise [`prune_archives`]'s selection logic without a real backend.
	struct FakeArchiver {
		keep_count: usize,
		sets: Mutex<HashMap<String, SetMetadata>>,
		deleted: Mutex<Vec<String>>,
	}

	impl Archiver for FakeArchiver {
		fn profile_name(&self) -> &str {
			"fake"
		}
		fn workers(&self) -> usize {
			1
		}
		fn keep_count(&self) -> usize {
			self.keep_count
		}
		fn list_sets(&self) -> Result<HashMap<String, SetMetadata>> {
			Ok(self.sets.lock().unwrap().clone())
		}
		fn complete_set(&self, _set_name: &str) -> Result<()> {
			Ok(())
		}
		fn delete_set(&self, set_name: &str) -> Result<()> {
			self.sets.lock().unwrap().remove(set_name);
			self.deleted.lock().unwrap().push(set_name.to_string());
			Ok(())
		}
		fn list_set_archives(&self, _set_name: &str) -> Result<HashMap<String, ArchiveInfo>> {
			Ok(HashMap::new())
		}
		fn upload_archive(&self, _set_name: &str, _archive_name: &str, _metadata: &ArchiveInfo, _local_path: &Path) -> Result<()> {
			Ok(())
		}
		fn download_archives(&self, _set_name: &str, _archive_list: &[(String, PathBuf)], _max_rate: Option<u64>) -> Result<Vec<(String, std::result::Result<ArchiveInfo, Error>)>> {
			Ok(Vec::new())
		}
		fn resync(&self) -> Result<()> {
			Ok(())
		}
		fn report_cost(&self) -> Result<()> {
			Ok(())
		}
	}

	fn set(count: u64, complete: bool, protected: bool) -> SetMetadata {
		SetMetadata { count, size: 0, complete, protected }
	}

	#[test]
	fn prune_keeps_most_recent_incomplete_set() {
		let mut sets = HashMap::new();
		sets.insert("20220101-1".to_string(), set(1, false, false));
		sets.insert("20220102-1".to_string(), set(1, false, false));
		let archiver = FakeArchiver { keep_count: 5, sets: Mutex::new(sets), deleted: Mutex::new(Vec::new()) };

		prune_archives(&archiver).unwrap();

		let deleted = archiver.deleted.lock().unwrap();
		let names: Vec<&str> = deleted.iter().map(String::as_str).collect();
		assert_eq!(names, ["20220101-1"]);
	}

	#[test]
	fn prune_keeps_only_keep_count_complete_sets() {
		let mut sets = HashMap::new();
		for day in 1..=5 {
			sets.insert(format!("2022010{day}-1"), set(1, true, false));
		}
		let archiver = FakeArchiver { keep_count: 2, sets: Mutex::new(sets), deleted: Mutex::new(Vec::new()) };

		prune_archives(&archiver).unwrap();

		let deleted = archiver.deleted.lock().unwrap();
		assert_eq!(deleted.len(), 3);
		assert!(deleted.iter().all(|name| name.as_str() < "20220104-1"));
	}

	#[test]
	fn prune_never_deletes_protected_sets() {
		let mut sets = HashMap::new();
		sets.insert("20220101-1".to_string(), set(1, true, true));
		sets.insert("20220102-1".to_string(), set(1, true, false));
		sets.insert("20220103-1".to_string(), set(1, true, false));
		let archiver = FakeArchiver { keep_count: 1, sets: Mutex::new(sets), deleted: Mutex::new(Vec::new()) };

		prune_archives(&archiver).unwrap();

		let deleted = archiver.deleted.lock().unwrap();
		let names: Vec<&str> = deleted.iter().map(String::as_str).collect();
		assert_eq!(names, ["20220102-1"]);
	}

	#[test]
	fn prune_is_a_no_op_within_keep_count_and_no_incomplete_backlog() {
		let mut sets = HashMap::new();
		sets.insert("20220101-1".to_string(), set(1, true, false));
		let archiver = FakeArchiver { keep_count: 5, sets: Mutex::new(sets), deleted: Mutex::new(Vec::new()) };

		prune_archives(&archiver).unwrap();

		assert!(archiver.deleted.lock().unwrap().is_empty());
	}
}
