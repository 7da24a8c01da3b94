//! Filesystem mirroring delegated to the external `rsync` binary
//! (component C8.4.6.1).

use std::path::Path;
use std::process::{Command, Stdio};

use regex::Regex;

use crate::config::{Config, RsyncHostConfig};
use crate::error::{Error, Result};
use crate::scheduler::Unit;
use crate::util::{make_dir_path, random_do_work};

pub fn get_relroot(hostname: &str, info: &RsyncHostConfig) -> String {
	let alias = info
		.alias
		.clone()
		.unwrap_or_else(|| hostname.split('.').next().unwrap_or(hostname).to_string());
	format!("rsync/{alias}")
}

pub fn get_units(config: &Config) -> Result<Vec<Unit>> {
	let mut hosts: Vec<(&String, &RsyncHostConfig)> = config.rsync.iter().collect();
	hosts.sort_by_key(|(hostname, info)| info.alias.clone().unwrap_or_else(|| (*hostname).clone()));

	let mut units = Vec::new();
	for (hostname, info) in hosts {
		let mut backup_args = vec!["rsync".to_string(), "backup".to_string(), hostname.clone()];
		if random_do_work(config.settings.rsync_scrub_probability) {
			backup_args.push("-c".to_string());
		}
		units.push(Unit {
			root: get_relroot(hostname, info),
			backup_args,
		});
	}
	Ok(units)
}

pub fn remote_command(host: &str, command: &str, user: &str) -> Result<()> {
	let args = [
		"-o",
		"BatchMode=yes",
		"-o",
		"StrictHostKeyChecking=no",
		&format!("{user}@{host}"),
		command,
	];
	println!("ssh {}", args.join(" "));
	let status = Command::new("ssh").args(args).status()?;
	if !status.success() {
		return Err(Error::SubprocessFailed {
			program: "ssh".into(),
			code: status.code().unwrap_or(-1),
		});
	}
	Ok(())
}

/// Known spurious rsync log output (itemize lines for unchanged
/// directories/symlinks under old protocol negotiations), per
/// https://bugzilla.samba.org/show_bug.cgi?id=10496.
fn spurious_line_re() -> Regex {
	Regex::new(r"^[.h][dfL]\.{8}x ").expect("static regex")
}

fn run_rsync(cmd: &[String]) -> Result<i32> {
	println!("{}", cmd.join(" "));
	let mut child = Command::new(&cmd[0])
		.args(&cmd[1..])
		.stdout(Stdio::piped())
		.spawn()?;
	let stdout = child.stdout.take().expect("piped stdout");
	let spurious = spurious_line_re();
	use std::io::{BufRead, BufReader};
	for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
		if !spurious.is_match(&line) {
			println!("{}", line.trim_end());
		}
	}
	let status = child.wait()?;
	Ok(status.code().unwrap_or(-1))
}

fn run_rsync_with_fallback(mut cmd: Vec<String>) -> Result<()> {
	let mut ret = run_rsync(&cmd)?;
	if ret == 2 || ret == 12 {
		cmd.retain(|a| a != "--acls" && a != "--xattrs");
		ret = run_rsync(&cmd)?;
	}
	if ret != 0 && ret != 24 {
		return Err(Error::SubprocessFailed {
			program: "rsync".into(),
			code: ret,
		});
	}
	Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn backup_host(
	host: &str,
	root_dir: &Path,
	mounts: &[String],
	exclude: &[String],
	scrub: bool,
	rsync_binary: Option<&str>,
	user: &str,
) -> Result<()> {
	make_dir_path(root_dir)?;
	let rsync = rsync_binary.unwrap_or("rsync");
	let mut args: Vec<String> = vec![
		rsync.to_string(),
		"-aHRxi".to_string(),
		"--acls".to_string(),
		"--xattrs".to_string(),
		"--fake-super".to_string(),
		"--delete".to_string(),
		"--delete-excluded".to_string(),
		"--numeric-ids".to_string(),
		"--stats".to_string(),
		"--partial".to_string(),
		"--rsh=ssh -o BatchMode=yes -o StrictHostKeyChecking=no".to_string(),
	];
	args.extend(exclude.iter().map(|e| format!("--exclude={e}")));
	args.extend(
		mounts
			.iter()
			.map(|m| format!("{user}@{host}:{}", if m.trim_end_matches('/').is_empty() { "/" } else { m.trim_end_matches('/') })),
	);
	args.push(root_dir.display().to_string().trim_end_matches('/').to_string());
	if scrub {
		args.push("--checksum".to_string());
	}
	run_rsync_with_fallback(args)
}

pub fn restore_host(
	source: &str,
	dest_host: &str,
	dest_dir: &str,
	coda: bool,
	user: &str,
	extra_args: &[String],
	rsync_binary: Option<&str>,
) -> Result<()> {
	let rsync = rsync_binary.unwrap_or("rsync");
	let mut source = source.trim_end_matches('/').to_string();
	if Path::new(&source).is_dir() {
		source.push('/');
	}
	let dest = format!("{user}@{dest_host}:{}/", dest_dir.trim_end_matches('/'));

	let mut args: Vec<String> = if !coda {
		vec![
			rsync.to_string(),
			"-aHi".to_string(),
			"--acls".to_string(),
			"--xattrs".to_string(),
			"--fake-super".to_string(),
			"-M--super".to_string(),
			"--numeric-ids".to_string(),
			source,
			dest,
		]
	} else {
		vec![
			rsync.to_string(),
			"-rlptoHi".to_string(),
			"--fake-super".to_string(),
			"-M--super".to_string(),
			"--numeric-ids".to_string(),
			source,
			dest,
		]
	};
	args.extend(extra_args.iter().cloned());
	run_rsync_with_fallback(args)
}
