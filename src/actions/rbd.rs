//! `deltaic rbd`: low-level backup/restore/drop entry points for the RBD
//! source.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::sources::rbd::{backup as backup_image_set, drop_image_snapshots, get_relroot, restore_image};

#[derive(Debug, Clone, Parser)]
pub struct RbdArgs {
	#[command(subcommand)]
	pub action: RbdAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RbdAction {
	/// Mirror one manifest-configured image or snapshot set
	Backup {
		/// Check backup data against the original
		#[arg(short = 'c', long = "scrub")]
		scrub: bool,
		/// The requested object is a snapshot set, not a live image
		#[arg(short, long)]
		snapshot: bool,
		pool: String,
		friendly_name: String,
	},
	/// Restore a mirrored image file back into a pool
	Restore { path: PathBuf, pool: String, image: String },
	/// Drop the internal snapshots used to track a mirror's diff chain
	Drop { pool: String, friendly_name: String },
}

pub async fn run(ctx: Context<crate::args::Args, RbdArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	match ctx.args_sub.action {
		RbdAction::Backup { scrub, snapshot, pool, friendly_name } => backup_image_set(&config, &pool, &friendly_name, scrub, snapshot).into_diagnostic(),
		RbdAction::Restore { path, pool, image } => restore_image(&path, &pool, &image).into_diagnostic(),
		RbdAction::Drop { pool, friendly_name } => {
			let root_dir = config.settings.root.join(get_relroot(&pool, &friendly_name, false));
			drop_image_snapshots(&pool, &root_dir).into_diagnostic()
		}
	}
}
