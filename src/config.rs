//! Configuration schema and loader.
//!
//! spec names YAML as the on-disk format; the core here is expressed in
//! JSON5 instead (see `SPEC_FULL.md` §D) since it is a drop-in, comment-
//! friendly superset of JSON and the surrounding tool stack already reads
//! and writes JSON5 elsewhere. Schema shape (top-level `settings`, one key
//! per source, `archivers`) is unchanged from spec.md §6.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub settings: Settings,
	#[serde(default)]
	pub rsync: HashMap<String, RsyncHostConfig>,
	#[serde(default)]
	pub coda: HashMap<String, CodaVolumeConfig>,
	#[serde(default)]
	pub rbd: HashMap<String, RbdImageConfig>,
	#[serde(default)]
	pub rgw: HashMap<String, RgwBucketConfig>,
	#[serde(default)]
	pub github: HashMap<String, GitHubOrgConfig>,
	#[serde(default)]
	pub archivers: HashMap<String, ArchiverProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	/// Root of the mirror tree; must be a mounted filesystem.
	pub root: PathBuf,
	/// `<volume-group>/<logical-volume>` pair for the snapshot registry.
	#[serde(rename = "backup-lv")]
	pub backup_lv: String,
	/// Scratch space for building archives before upload.
	#[serde(rename = "archive-spool")]
	pub archive_spool: PathBuf,
	#[serde(rename = "archive-tar-path", default)]
	pub archive_tar_path: Option<String>,
	#[serde(rename = "archive-gpg-path", default)]
	pub archive_gpg_path: Option<String>,

	#[serde(rename = "rsync-workers", default = "default_one")]
	pub rsync_workers: usize,
	#[serde(rename = "coda-workers", default = "default_one")]
	pub coda_workers: usize,
	#[serde(rename = "rbd-workers", default = "default_one")]
	pub rbd_workers: usize,
	#[serde(rename = "rgw-workers", default = "default_one")]
	pub rgw_workers: usize,
	#[serde(rename = "github-workers", default = "default_one")]
	pub github_workers: usize,

	#[serde(rename = "rgw-server", default)]
	pub rgw_server: Option<String>,
	#[serde(rename = "rgw-secure", default)]
	pub rgw_secure: bool,
	#[serde(rename = "rgw-threads", default = "default_four")]
	pub rgw_threads: usize,

	#[serde(rename = "rsync-exclude", default)]
	pub rsync_exclude: Vec<String>,
	#[serde(rename = "rsync-local-binary", default)]
	pub rsync_local_binary: Option<String>,

	#[serde(rename = "coda-volutil-path", default)]
	pub coda_volutil_path: Option<String>,
	#[serde(rename = "coda-codadump2tar-path", default)]
	pub coda_codadump2tar_path: Option<String>,

	#[serde(rename = "rsync-scrub-probability", default = "default_scrub_prob")]
	pub rsync_scrub_probability: f64,
	#[serde(rename = "rbd-scrub-probability", default = "default_scrub_prob")]
	pub rbd_scrub_probability: f64,
	#[serde(rename = "rgw-scrub-probability", default = "default_scrub_prob")]
	pub rgw_scrub_probability: f64,
	#[serde(rename = "rgw-scrub-acl-probability", default)]
	pub rgw_scrub_acl_probability: f64,
	#[serde(rename = "coda-full-probability", default = "default_coda_full_prob")]
	pub coda_full_probability: f64,
	#[serde(rename = "github-scrub-probability", default = "default_scrub_prob")]
	pub github_scrub_probability: f64,

	#[serde(rename = "df-warning", default = "default_df_warning")]
	pub df_warning: f64,

	#[serde(rename = "duplicate-days", default = "default_duplicate_days")]
	pub duplicate_days: i64,
	#[serde(rename = "daily-weeks", default = "default_daily_weeks")]
	pub daily_weeks: i64,
	#[serde(rename = "weekly-months", default = "default_weekly_months")]
	pub weekly_months: i64,
	#[serde(rename = "log-keep-days", default = "default_log_keep_days")]
	pub log_keep_days: usize,
}

fn default_one() -> usize {
	1
}
fn default_four() -> usize {
	4
}
fn default_scrub_prob() -> f64 {
	0.0166
}
fn default_coda_full_prob() -> f64 {
	0.143
}
fn default_df_warning() -> f64 {
	5.0
}
fn default_duplicate_days() -> i64 {
	14
}
fn default_daily_weeks() -> i64 {
	8
}
fn default_weekly_months() -> i64 {
	12
}
fn default_log_keep_days() -> usize {
	60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RsyncHostConfig {
	pub alias: Option<String>,
	#[serde(default)]
	pub mounts: Vec<String>,
	#[serde(default)]
	pub exclude: Vec<String>,
	pub user: Option<String>,
	pub pre: Option<String>,
	pub post: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodaVolumeConfig {
	pub server: String,
	pub volume: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RbdImageConfig {
	pub pool: String,
	pub image: String,
	#[serde(default)]
	pub snapshot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RgwBucketConfig {
	#[serde(default)]
	pub alias: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubOrgConfig {
	pub token: String,
	#[serde(default)]
	pub repos: Vec<String>,
	#[serde(default)]
	pub wiki: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverProfile {
	pub archiver: ArchiverKind,
	#[serde(default = "default_archiver_workers")]
	pub workers: usize,
	#[serde(default)]
	pub keep_count: Option<usize>,
	#[serde(default)]
	pub compression: Compression,
	#[serde(default)]
	pub signing_key: Option<String>,
	#[serde(default)]
	pub recipients: Vec<String>,
	/// Backend-specific settings (bucket/domain names, folder ids, etc).
	#[serde(default)]
	pub backend: HashMap<String, serde_json::Value>,
}

fn default_archiver_workers() -> usize {
	8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiverKind {
	Aws,
	Googledrive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
	#[default]
	Gzip,
	Lzop,
	None,
}

pub fn load(path: &Path) -> Result<Config> {
	let text = std::fs::read_to_string(path)?;
	let config: Config = json5::from_str(&text)?;
	Ok(config)
}

pub fn default_path() -> PathBuf {
	dirs::config_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("deltaic")
		.join("config.json5")
}
