//! `deltaic mount`: mount one or more snapshots read-only for inspection.

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::storage::PhysicalSnapshot;
use crate::util::make_dir_path;

#[derive(Debug, Clone, Parser)]
pub struct MountArgs {
	/// Snapshot names (`YYYYMMDD-N`) to mount
	#[arg(required = true)]
	pub snapshot: Vec<String>,
}

pub async fn run(ctx: Context<crate::args::Args, MountArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let settings = &config.settings;
	let (vg, _) = settings.backup_lv.split_once('/').ok_or_else(|| miette::miette!("settings.backup-lv must be VG/LV"))?;

	for name in &ctx.args_sub.snapshot {
		let snapshot = PhysicalSnapshot::new(vg, name).into_diagnostic()?;
		let mountpoint = make_dir_path(settings.root.join("Snapshots").join(snapshot.name())).into_diagnostic()?;
		if let Err(err) = snapshot.mount(&mountpoint) {
			let _ = std::fs::remove_dir(&mountpoint);
			return Err(err).into_diagnostic();
		}
		println!("{}", mountpoint.display());
	}
	Ok(())
}
