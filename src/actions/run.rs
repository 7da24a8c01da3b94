//! `deltaic run`: walk every configured source and back it up.

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::sources::{self, SOURCE_LABELS};
use crate::storage::PhysicalSnapshot;
use crate::util::lock;

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
	/// Don't snapshot the backup volume after the run
	#[arg(long)]
	pub no_snapshot: bool,
}

pub async fn run(ctx: Context<crate::args::Args, RunArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let _lock = lock::acquire(&config.settings.root, "backup").into_diagnostic()?;

	let log_root = config.settings.root.join("Logs");
	let mut success = true;
	for label in SOURCE_LABELS {
		let units = sources::get_units(label, &config).into_diagnostic()?;
		if units.is_empty() {
			continue;
		}
		let workers = sources::worker_count(label, &config);
		println!("=== {label} ({} units, {workers} workers) ===", units.len());
		if !crate::scheduler::run_units(units, workers, &log_root) {
			success = false;
		}
	}

	if !ctx.args_sub.no_snapshot {
		PhysicalSnapshot::create(&config.settings).into_diagnostic()?;
	}

	if !success {
		std::process::exit(1);
	}
	Ok(())
}
