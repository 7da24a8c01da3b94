//! Per-source mirror reconcilers (component C8) and the `Source` plugin
//! table that the scheduler (C9) and the CLI's low-level subcommands
//! dispatch through.
//!
//! Rather than the original's dynamic discovery of `Source` subclasses
//! via entry points, sources are a closed, compile-time set: a plugin
//! table keyed by string label, populated once at startup, as suggested
//! in spec.md §9.

pub mod coda;
pub mod github;
pub mod rbd;
pub mod rgw;
pub mod rsync;

use crate::config::Config;
use crate::error::Result;
use crate::scheduler::Unit;

/// All known source labels, in the order `run` processes them.
pub const SOURCE_LABELS: &[&str] = &["rsync", "coda", "rbd", "rgw", "github"];

pub fn get_units(label: &str, config: &Config) -> Result<Vec<Unit>> {
	match label {
		"rsync" => rsync::get_units(config),
		"coda" => coda::get_units(config),
		"rbd" => rbd::get_units(config),
		"rgw" => rgw::get_units(config),
		"github" => github::get_units(config),
		other => Ok(Vec::new()).map(|v: Vec<Unit>| {
			tracing::warn!(label = other, "unknown source label");
			v
		}),
	}
}

pub fn worker_count(label: &str, config: &Config) -> usize {
	match label {
		"rsync" => config.settings.rsync_workers,
		"coda" => config.settings.coda_workers,
		"rbd" => config.settings.rbd_workers,
		"rgw" => config.settings.rgw_workers,
		"github" => config.settings.github_workers,
		_ => 1,
	}
}
