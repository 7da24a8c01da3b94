//! `deltaic askpass`: credential helper invoked as `$GIT_ASKPASS`/
//! `$SSH_ASKPASS` by the rsync and GitHub reconcilers so secrets never
//! appear in a process's argv.

use clap::Parser;
use miette::{miette, Result};

use crate::actions::Context;

#[derive(Debug, Clone, Parser)]
pub struct AskpassArgs {
	/// The prompt text the calling program printed (e.g. "Username for ...")
	pub prompt: String,
}

pub async fn run(ctx: Context<crate::args::Args, AskpassArgs>) -> Result<()> {
	let prompt = &ctx.args_sub.prompt;
	if prompt.contains("Username") {
		println!("{}", std::env::var("DT_ASKPASS_USER").unwrap_or_default());
	} else if prompt.contains("Password") {
		println!("{}", std::env::var("DT_ASKPASS_PASS").unwrap_or_default());
	} else {
		return Err(miette!("unrecognized askpass prompt: {prompt}"));
	}
	Ok(())
}
