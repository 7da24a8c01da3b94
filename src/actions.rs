use clap::Subcommand;
use miette::Result;
use tracing::debug;

pub use context::Context;
pub mod context;

pub mod archive;
pub mod askpass;
pub mod coda;
pub mod df;
pub mod github;
pub mod ls;
pub mod mkconf;
pub mod mount;
pub mod prune;
pub mod rbd;
pub mod rgw;
pub mod rsync;
pub mod run;
pub mod umount;

use crate::args::Args;

/// Top-level subcommands. The five per-source groups (`rsync`/`coda`/`rbd`/
/// `rgw`/`github`) are the low-level backup/restore entry points the
/// scheduler re-invokes this binary with; `run` is the orchestrator that
/// walks the manifest and dispatches to them.
#[derive(Debug, Clone, Subcommand)]
pub enum Action {
	/// Run a full backup pass across every configured source
	Run(run::RunArgs),
	/// Create, list, and remove retention-managed snapshots
	Prune(prune::PruneArgs),
	/// Report free space on the backup filesystem and its thin pool
	Df(df::DfArgs),
	/// List snapshots in the local registry
	Ls(ls::LsArgs),
	/// Mount a snapshot read-only for inspection or restore
	Mount(mount::MountArgs),
	/// Unmount a previously mounted snapshot
	Umount(umount::UmountArgs),
	/// Generate a config skeleton, crontab, or sudoers fragment
	Mkconf(mkconf::MkconfArgs),
	/// Internal: emit a credential for `GIT_ASKPASS`/`SSH_ASKPASS`
	#[command(hide = true)]
	Askpass(askpass::AskpassArgs),
	/// Pack, upload, retrieve, and prune offsite archives
	Archive(archive::ArchiveArgs),
	/// Low-level rsync-source backup/restore
	Rsync(rsync::RsyncArgs),
	/// Low-level Coda-source backup/restore
	Coda(coda::CodaArgs),
	/// Low-level RBD-source backup/restore
	Rbd(rbd::RbdArgs),
	/// Low-level radosgw-source backup/restore
	Rgw(rgw::RgwArgs),
	/// Low-level GitHub-source backup/restore
	Github(github::GithubArgs),
}

pub async fn run(args: Args) -> Result<()> {
	debug!(version = %env!("CARGO_PKG_VERSION"), "starting up");
	let ctx = Context::new().with_top(args.clone());
	match args.action {
		Action::Run(sub) => run::run(ctx.with_sub(sub)).await,
		Action::Prune(sub) => prune::run(ctx.with_sub(sub)).await,
		Action::Df(sub) => df::run(ctx.with_sub(sub)).await,
		Action::Ls(sub) => ls::run(ctx.with_sub(sub)).await,
		Action::Mount(sub) => mount::run(ctx.with_sub(sub)).await,
		Action::Umount(sub) => umount::run(ctx.with_sub(sub)).await,
		Action::Mkconf(sub) => mkconf::run(ctx.with_sub(sub)).await,
		Action::Askpass(sub) => askpass::run(ctx.with_sub(sub)).await,
		Action::Archive(sub) => archive::run(ctx.with_sub(sub)).await,
		Action::Rsync(sub) => rsync::run(ctx.with_sub(sub)).await,
		Action::Coda(sub) => coda::run(ctx.with_sub(sub)).await,
		Action::Rbd(sub) => rbd::run(ctx.with_sub(sub)).await,
		Action::Rgw(sub) => rgw::run(ctx.with_sub(sub)).await,
		Action::Github(sub) => github::run(ctx.with_sub(sub)).await,
	}
}

/// Load the manifest named by `-c/--config-file`, or the platform default.
pub(crate) fn load_config(args: &Args) -> Result<crate::config::Config> {
	use miette::IntoDiagnostic;
	let path = args.config_file.clone().unwrap_or_else(crate::config::default_path);
	crate::config::load(&path).into_diagnostic()
}
