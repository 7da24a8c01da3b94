//! `deltaic rsync`: low-level backup/restore entry points for the rsync
//! source, invoked directly by operators or re-invoked by the scheduler.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::sources::rsync::{backup_host, get_relroot, remote_command, restore_host};

#[derive(Debug, Clone, Parser)]
pub struct RsyncArgs {
	#[command(subcommand)]
	pub action: RsyncAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RsyncAction {
	/// Mirror one manifest-configured host
	Backup {
		/// Check backup data against the original (full checksum pass)
		#[arg(short = 'c', long = "scrub")]
		scrub: bool,
		host: String,
	},
	/// Restore a mirror tree back onto a remote host
	Restore {
		/// Source tree was mirrored from a Coda volume (affects rsync flags)
		#[arg(long)]
		coda: bool,
		/// Remote user to connect as
		#[arg(short, long, default_value = "root")]
		user: String,
		source: String,
		host: String,
		destdir: String,
		#[arg(trailing_var_arg = true)]
		extra_args: Vec<String>,
	},
}

pub async fn run(ctx: Context<crate::args::Args, RsyncArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	match ctx.args_sub.action {
		RsyncAction::Backup { scrub, host } => {
			let info = config.rsync.get(&host).ok_or_else(|| miette::miette!("no manifest entry for host {host}"))?;
			let root_dir = config.settings.root.join(get_relroot(&host, info));
			let user = info.user.as_deref().unwrap_or("root");
			if let Some(pre) = &info.pre {
				remote_command(&host, pre, user).into_diagnostic()?;
			}
			backup_host(&host, &root_dir, &info.mounts, &info.exclude, scrub, config.settings.rsync_local_binary.as_deref(), user).into_diagnostic()?;
			if let Some(post) = &info.post {
				remote_command(&host, post, user).into_diagnostic()?;
			}
			Ok(())
		}
		RsyncAction::Restore {
			coda,
			user,
			source,
			host,
			destdir,
			extra_args,
		} => restore_host(&source, &host, &destdir, coda, &user, &extra_args, config.settings.rsync_local_binary.as_deref()).into_diagnostic(),
	}
}
