//! Snapshot data model and registry (component C5).
//!
//! A [`Snapshot`] is the logical identity (`YYYYMMDD-N`, plus derived
//! calendar fields used by the retention planner). A [`PhysicalSnapshot`]
//! additionally carries the volume group it lives in and knows how to
//! talk to the external volume manager (`sudo lvs/lvcreate/lvremove/
//! lvchange/mount/umount`) to enumerate, create, remove, mount, and
//! unmount itself.

use std::path::Path;
use std::process::Command;

use chrono::{Datelike, NaiveDate};

use crate::config::Settings;
use crate::error::{Error, Result};

pub const SNAPSHOT_TAG: &str = "backup-snapshot";
const DATE_FMT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
	pub name: String,
	pub date: NaiveDate,
	pub revision: u32,
	pub iso_year: i32,
	pub iso_week: u32,
	/// Synthetic 28-day "month": 4 seven-day ISO weeks per month, so 13
	/// (or 14, on long ISO-week years) per year.
	pub month: u32,
}

impl Snapshot {
	pub fn parse(name: &str) -> Result<Self> {
		let (datecode, revision) = name.split_once('-').ok_or_else(|| Error::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			format!("invalid snapshot name: {name}"),
		)))?;
		let date = NaiveDate::parse_from_str(datecode, DATE_FMT).map_err(|e| {
			Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
		})?;
		let revision: u32 = revision.parse().map_err(|_| {
			Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				format!("invalid revision in snapshot name: {name}"),
			))
		})?;
		let iso = date.iso_week();
		let month = ((iso.week() - 1) / 4) + 1;
		Ok(Self {
			name: name.to_string(),
			date,
			revision,
			iso_year: iso.year(),
			iso_week: iso.week(),
			month,
		})
	}

	/// Lexical sort by `YYYYMMDD` then numeric revision, which is also
	/// chronological order.
	pub fn sort_key(&self) -> (NaiveDate, u32) {
		(self.date, self.revision)
	}
}

impl Ord for Snapshot {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.sort_key().cmp(&other.sort_key())
	}
}
impl PartialOrd for Snapshot {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalSnapshot {
	pub vg: String,
	pub snapshot: Snapshot,
}

impl PhysicalSnapshot {
	pub fn new(vg: impl Into<String>, name: &str) -> Result<Self> {
		if name.contains('/') {
			return Err(Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				format!("invalid snapshot name: {name}"),
			)));
		}
		Ok(Self {
			vg: vg.into(),
			snapshot: Snapshot::parse(name)?,
		})
	}

	pub fn name(&self) -> &str {
		&self.snapshot.name
	}

	fn backup_vg_lv(settings: &Settings) -> Result<(String, String)> {
		let (vg, lv) = settings.backup_lv.split_once('/').ok_or_else(|| {
			Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				"settings.backup-lv must be VG/LV",
			))
		})?;
		Ok((vg.to_string(), lv.to_string()))
	}

	/// Enumerate all LVs tagged [`SNAPSHOT_TAG`], sorted chronologically.
	pub fn list() -> Result<Vec<Self>> {
		let out = Command::new("sudo")
			.args(["lvs", "--noheadings", "-o", "vg_name,lv_name", &format!("@{SNAPSHOT_TAG}")])
			.output()?;
		if !out.status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvs".into(),
				code: out.status.code().unwrap_or(-1),
			});
		}
		let text = String::from_utf8_lossy(&out.stdout);
		let mut snapshots = Vec::new();
		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			let mut parts = line.split_whitespace();
			let vg = parts.next().unwrap_or_default();
			let lv = parts.next().unwrap_or_default();
			snapshots.push(Self::new(vg, lv)?);
		}
		snapshots.sort();
		Ok(snapshots)
	}

	/// Probe `YYYYMMDD-1` through `-99` for a free name and create a
	/// read-only snapshot of the configured origin volume.
	pub fn create(settings: &Settings) -> Result<Self> {
		let (vg, lv) = Self::backup_vg_lv(settings)?;
		let today = chrono::Local::now().date_naive().format(DATE_FMT).to_string();
		let mut chosen = None;
		for n in 1..100 {
			let candidate = format!("{today}-{n}");
			let status = Command::new("sudo")
				.args(["lvs", &format!("{vg}/{candidate}")])
				.stdout(std::process::Stdio::null())
				.stderr(std::process::Stdio::null())
				.status()?;
			if !status.success() {
				chosen = Some(candidate);
				break;
			}
		}
		let name = chosen.ok_or_else(|| {
			Error::Io(std::io::Error::new(
				std::io::ErrorKind::Other,
				"couldn't locate unused snapshot LV",
			))
		})?;

		let status = Command::new("sudo")
			.args([
				"lvcreate", "-s", &format!("{vg}/{lv}"), "-p", "r", "-n", &name, "--addtag", SNAPSHOT_TAG,
			])
			.status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvcreate".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		Self::new(vg, &name)
	}

	pub fn remove(&self) -> Result<()> {
		let status = Command::new("sudo")
			.args(["lvremove", "--force", &format!("{}/{}", self.vg, self.name())])
			.status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvremove".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		Ok(())
	}

	pub fn mount(&self, mountpoint: &Path) -> Result<()> {
		let status = Command::new("sudo")
			.args(["lvchange", "-a", "y", "-K", &format!("{}/{}", self.vg, self.name())])
			.status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvchange".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		let status = Command::new("sudo")
			.args([
				"mount",
				"-o",
				"ro",
				&format!("/dev/{}/{}", self.vg, self.name()),
				&mountpoint.display().to_string(),
			])
			.status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "mount".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		Ok(())
	}

	/// Unmount and deactivate. Deactivation may fail if the same LV is
	/// mounted elsewhere concurrently; that's tolerated, matching the
	/// original's best-effort `lvchange -a n`.
	pub fn umount(&self, mountpoint: &Path) -> Result<()> {
		let status = Command::new("sudo")
			.args(["umount", &mountpoint.display().to_string()])
			.status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: "umount".into(),
				code: status.code().unwrap_or(-1),
			});
		}
		let _ = Command::new("sudo")
			.args(["lvchange", "-a", "n", &format!("{}/{}", self.vg, self.name())])
			.status();
		Ok(())
	}
}

impl Ord for PhysicalSnapshot {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(&self.vg, &self.snapshot).cmp(&(&other.vg, &other.snapshot))
	}
}
impl PartialOrd for PhysicalSnapshot {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

/// Free-space report for the filesystem and its backing thin pool.
pub struct StorageStatus {
	pub fs_free: f64,
	pub fs_free_pct: f64,
	pub ino_free: f64,
	pub ino_free_pct: f64,
	pub lv_free_data: f64,
	pub lv_free_data_pct: f64,
	pub lv_free_metadata: f64,
	pub lv_free_metadata_pct: f64,
}

impl StorageStatus {
	pub fn collect(vg: &str, lv: &str, mountpoint: &Path) -> Result<Self> {
		let stat = nix::sys::statvfs::statvfs(mountpoint).map_err(|e| {
			Error::Io(std::io::Error::from_raw_os_error(e as i32))
		})?;
		let fs_free = stat.blocks_available() as f64 * stat.fragment_size() as f64;
		let fs_free_pct = 100.0 * stat.blocks_available() as f64 / stat.blocks() as f64;
		let ino_free = stat.files_available() as f64;
		let ino_free_pct = 100.0 * stat.files_available() as f64 / stat.files() as f64;

		let out = Command::new("sudo")
			.args(["lvs", "--noheadings", "-o", "pool_lv", &format!("{vg}/{lv}")])
			.output()?;
		if !out.status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvs".into(),
				code: out.status.code().unwrap_or(-1),
			});
		}
		let pool_lv = String::from_utf8_lossy(&out.stdout).trim().to_string();
		if pool_lv.is_empty() {
			return Err(Error::Io(std::io::Error::new(
				std::io::ErrorKind::Other,
				"couldn't retrieve pool LV",
			)));
		}

		let out = Command::new("sudo")
			.args([
				"lvs", "--noheadings", "--nosuffix", "--units", "b", "-o",
				"lv_size,data_percent,lv_metadata_size,metadata_percent",
				&format!("{vg}/{pool_lv}"),
			])
			.output()?;
		if !out.status.success() {
			return Err(Error::SubprocessFailed {
				program: "lvs".into(),
				code: out.status.code().unwrap_or(-1),
			});
		}
		let text = String::from_utf8_lossy(&out.stdout);
		let vals: Vec<f64> = text.split_whitespace().filter_map(|s| s.parse().ok()).collect();
		let [data_size, data_pct, meta_size, meta_pct] = vals[..4].try_into().map_err(|_| {
			Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "unexpected lvs output"))
		})?;

		Ok(Self {
			fs_free,
			fs_free_pct,
			ino_free,
			ino_free_pct,
			lv_free_data: data_size * (100.0 - data_pct) / 100.0,
			lv_free_data_pct: 100.0 - data_pct,
			lv_free_metadata: meta_size * (100.0 - meta_pct) / 100.0,
			lv_free_metadata_pct: 100.0 - meta_pct,
		})
	}

	/// Print rows below `pct_threshold`; returns whether anything was
	/// printed (i.e. whether a `-c/--check` caller should exit 1).
	pub fn report(&self, pct_threshold: f64) -> bool {
		use crate::util::humanize_size;
		let rows: [(&str, bool, f64, f64); 4] = [
			("Free filesystem space", true, self.fs_free, self.fs_free_pct),
			("Free inodes", false, self.ino_free, self.ino_free_pct),
			("Free LVM data space", true, self.lv_free_data, self.lv_free_data_pct),
			("Free LVM metadata space", true, self.lv_free_metadata, self.lv_free_metadata_pct),
		];
		let mut printed = false;
		for (label, humanize, value, pct) in rows {
			if pct < pct_threshold {
				let value = if humanize {
					humanize_size(value)
				} else {
					format!("{value}    ")
				};
				println!("{:<25} {value:>14} ({pct:4.1}%)", format!("{label}:"));
				printed = true;
			}
		}
		printed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_name_and_derives_month() {
		let s = Snapshot::parse("20210104-1").unwrap();
		assert_eq!(s.revision, 1);
		assert_eq!(s.date, NaiveDate::from_ymd_opt(2021, 1, 4).unwrap());
	}

	#[test]
	fn sorts_chronologically_then_by_revision() {
		let mut v = vec![
			Snapshot::parse("20210105-1").unwrap(),
			Snapshot::parse("20210104-2").unwrap(),
			Snapshot::parse("20210104-1").unwrap(),
		];
		v.sort();
		let names: Vec<_> = v.iter().map(|s| s.name.as_str()).collect();
		assert_eq!(names, ["20210104-1", "20210104-2", "20210105-1"]);
	}
}
