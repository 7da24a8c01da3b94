//! `deltaic df`: report free space on the backup filesystem and thin pool.

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::error::Error;
use crate::storage::StorageStatus;

#[derive(Debug, Clone, Parser)]
pub struct DfArgs {
	/// Only report problems, and exit nonzero if any were found
	#[arg(short, long)]
	pub check: bool,
}

pub async fn run(ctx: Context<crate::args::Args, DfArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let settings = &config.settings;
	let (vg, lv) = settings.backup_lv.split_once('/').ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "settings.backup-lv must be VG/LV"))).into_diagnostic()?;

	let status = StorageStatus::collect(vg, lv, &settings.root).into_diagnostic()?;
	let threshold = if ctx.args_sub.check { settings.df_warning } else { 100.0 };
	let printed = status.report(threshold);
	if ctx.args_sub.check && printed {
		std::process::exit(1);
	}
	Ok(())
}
