//! `deltaic github`: low-level backup entry point and repo listing for the
//! GitHub source.
//!
//! The original obtains a token interactively via a GitHub OAuth device
//! flow (`github3.login().authorize(...)`); here the token is simply a
//! manifest field (`github.<org>.token`), since Rust has no equivalent of
//! that library and a long-lived personal/organization access token is
//! the simpler, non-interactive fit for a cron-driven tool.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::sources::github::{backup as backup_org_or_repo, list_repos};

#[derive(Debug, Clone, Parser)]
pub struct GithubArgs {
	#[command(subcommand)]
	pub action: GithubAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum GithubAction {
	/// Mirror an organization's metadata, or one repository within it
	Backup {
		/// Check backup data against the original
		#[arg(short = 'c', long = "scrub")]
		scrub: bool,
		organization: String,
		repo: Option<String>,
	},
	/// List repositories visible to the configured token
	Ls { organization: String },
}

pub async fn run(ctx: Context<crate::args::Args, GithubArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let runtime = tokio::runtime::Handle::current();
	match ctx.args_sub.action {
		GithubAction::Backup { scrub, organization, repo } => {
			tokio::task::block_in_place(|| backup_org_or_repo(&config, &organization, repo.as_deref(), scrub, &runtime)).into_diagnostic()
		}
		GithubAction::Ls { organization } => {
			let info = config.github.get(&organization).ok_or_else(|| miette::miette!("no manifest entry for organization {organization}"))?;
			for repo in list_repos(&info.token, &organization).await.into_diagnostic()? {
				println!("{repo}");
			}
			Ok(())
		}
	}
}
