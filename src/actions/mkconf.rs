//! `deltaic mkconf`: print a crontab or sudoers fragment for this install.

use clap::{Parser, ValueEnum};
use miette::Result;

use crate::actions::Context;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfFile {
	Crontab,
	Sudoers,
}

#[derive(Debug, Clone, Parser)]
pub struct MkconfArgs {
	/// Email address to send cron status reports to
	#[arg(long, default_value = "root")]
	pub email: String,
	/// Which fragment to print
	pub file: ConfFile,
}

pub async fn run(ctx: Context<crate::args::Args, MkconfArgs>) -> Result<()> {
	let prog = std::env::current_exe().unwrap_or_else(|_| "deltaic".into()).display().to_string();
	let user = std::env::var("USER").or_else(|_| std::env::var("LOGNAME")).unwrap_or_else(|_| "deltaic".to_string());

	let text = match ctx.args_sub.file {
		ConfFile::Crontab => format!(
			"MAILTO = {email}\n\n\
			0 23 * * * {prog} prune\n\
			55 23 * * * {prog} df -c\n\
			0 0 * * * {prog} run >/dev/null && echo \"OK\"\n\n\
			# To run offsite archives, enable these jobs and configure their schedule\n\
			#0 0 1 1,4,7,10 * {prog} archive run\n\
			#0 4 * * * {prog} archive prune\n\
			#0 3 30 6,12 * {prog} archive resync\n",
			email = ctx.args_sub.email,
		),
		ConfFile::Sudoers => format!(
			"# Allow Deltaic to query, create, delete, mount, and unmount snapshot volumes\n\
			{user} ALL=NOPASSWD: /sbin/lvs, /sbin/lvcreate, /sbin/lvremove, /sbin/lvchange, /bin/mount, /bin/umount\n\
			# Allow running sudo from cron\n\
			Defaults:{user} !requiretty\n",
		),
	};
	print!("{}", text.trim_end());
	println!();
	Ok(())
}
