//! `deltaic prune`: apply the retention policy to LVM snapshots and trim
//! per-unit backup logs.

use std::collections::HashSet;
use std::path::Path;

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::retention::{select_snapshots_to_remove, RetentionPolicy};
use crate::storage::PhysicalSnapshot;

#[derive(Debug, Clone, Parser)]
pub struct PruneArgs {
	/// Just print the snapshots that would be removed
	#[arg(short = 'n', long)]
	pub dry_run: bool,
	/// Report snapshots removed
	#[arg(short, long)]
	pub verbose: bool,
}

pub async fn run(ctx: Context<crate::args::Args, PruneArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let settings = &config.settings;

	let physical = PhysicalSnapshot::list().into_diagnostic()?;
	let snapshots: Vec<_> = physical.iter().map(|p| p.snapshot.clone()).collect();
	let policy = RetentionPolicy {
		duplicate_days: settings.duplicate_days,
		daily_weeks: settings.daily_weeks,
		weekly_months: settings.weekly_months,
	};
	let today = chrono::Local::now().date_naive();
	let to_remove: HashSet<String> = select_snapshots_to_remove(&snapshots, today, &policy)
		.into_iter()
		.map(|s| s.name)
		.collect();

	let mut doomed: Vec<&PhysicalSnapshot> = physical.iter().filter(|p| to_remove.contains(&p.snapshot.name)).collect();
	doomed.sort();
	for snap in doomed {
		if ctx.args_sub.dry_run {
			println!("{}", snap.name());
		} else {
			snap.remove().into_diagnostic()?;
			if ctx.args_sub.verbose {
				println!("removed {}", snap.name());
			}
		}
	}

	if !ctx.args_sub.dry_run {
		prune_logs(&settings.root.join("Logs"), settings.log_keep_days).into_diagnostic()?;
	}
	Ok(())
}

/// Within each unit's log directory, keep logs from the most recent
/// `distinct_days` distinct days and delete the rest. Filenames sort
/// lexicographically newest-first since they're `YYYYMMDD.{out,err}`.
fn prune_logs(root_dir: &Path, distinct_days: usize) -> std::io::Result<()> {
	if !root_dir.is_dir() {
		return Ok(());
	}
	for entry in walk_dirs(root_dir)? {
		let mut filenames: Vec<_> = std::fs::read_dir(&entry)?.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect();
		filenames.sort_by(|a, b| b.cmp(a));

		let mut days = HashSet::new();
		for filename in filenames {
			let day = filename.split('.').next().unwrap_or(&filename).to_string();
			if days.contains(&day) {
				continue;
			} else if days.len() < distinct_days {
				days.insert(day);
				continue;
			}
			let _ = std::fs::remove_file(entry.join(&filename));
		}
	}
	Ok(())
}

fn walk_dirs(root: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
	let mut dirs = Vec::new();
	let mut stack = vec![root.to_path_buf()];
	while let Some(dir) = stack.pop() {
		let mut has_files = false;
		for entry in std::fs::read_dir(&dir)? {
			let entry = entry?;
			if entry.file_type()?.is_dir() {
				stack.push(entry.path());
			} else {
				has_files = true;
			}
		}
		if has_files {
			dirs.push(dir);
		}
	}
	Ok(dirs)
}
