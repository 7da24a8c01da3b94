//! `deltaic coda`: low-level backup entry point for the Coda source.
//!
//! Restoring a Coda mirror back to a server is done with `deltaic rsync
//! restore --coda`, since the mirror tree is plain files either way.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::sources::coda::{get_relroot, sync_backup_volume};

#[derive(Debug, Clone, Parser)]
pub struct CodaArgs {
	#[command(subcommand)]
	pub action: CodaAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CodaAction {
	/// Mirror one manifest-configured volume
	Backup {
		/// Request an incremental backup instead of a full dump
		#[arg(short, long)]
		incremental: bool,
		/// Show volutil output
		#[arg(short, long)]
		verbose: bool,
		host: String,
		volume: String,
	},
}

pub async fn run(ctx: Context<crate::args::Args, CodaArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let CodaAction::Backup { incremental, verbose, host, volume } = ctx.args_sub.action;
	let root_dir = config.settings.root.join(get_relroot(&host, &volume));
	let volutil = config.settings.coda_volutil_path.as_deref().unwrap_or("volutil");
	let codadump2tar = config.settings.coda_codadump2tar_path.as_deref().unwrap_or("codadump2tar");
	sync_backup_volume(&host, &volume, &root_dir, incremental, volutil, codadump2tar, verbose).into_diagnostic()
}
