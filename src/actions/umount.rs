//! `deltaic umount`: unmount one or more previously mounted snapshots.

use std::os::unix::fs::MetadataExt;

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::storage::PhysicalSnapshot;

#[derive(Debug, Clone, Parser)]
pub struct UmountArgs {
	/// Unmount every snapshot currently mounted under Snapshots/
	#[arg(short, long)]
	pub all: bool,
	/// Snapshot names (`YYYYMMDD-N`) to unmount
	pub snapshot: Vec<String>,
}

pub async fn run(ctx: Context<crate::args::Args, UmountArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let settings = &config.settings;
	let (vg, _) = settings.backup_lv.split_once('/').ok_or_else(|| miette::miette!("settings.backup-lv must be VG/LV"))?;
	let snapshot_dir = settings.root.join("Snapshots");

	let names: Vec<String> = if ctx.args_sub.all {
		let root_dev = settings.root.metadata().into_diagnostic()?.dev();
		let mut names = Vec::new();
		if snapshot_dir.is_dir() {
			let mut entries: Vec<_> = std::fs::read_dir(&snapshot_dir).into_diagnostic()?.filter_map(|e| e.ok()).collect();
			entries.sort_by_key(|e| e.file_name());
			for entry in entries {
				if entry.metadata().map(|m| m.dev()).unwrap_or(root_dev) != root_dev {
					names.push(entry.file_name().to_string_lossy().into_owned());
				}
			}
		}
		names
	} else {
		if ctx.args_sub.snapshot.is_empty() {
			return Err(miette::miette!("at least one snapshot must be specified"));
		}
		ctx.args_sub.snapshot.clone()
	};

	for name in names {
		let snapshot = PhysicalSnapshot::new(vg, &name).into_diagnostic()?;
		let mountpoint = snapshot_dir.join(snapshot.name());
		snapshot.umount(&mountpoint).into_diagnostic()?;
		let _ = std::fs::remove_dir(&mountpoint);
	}
	Ok(())
}
