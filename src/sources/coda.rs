//! Tar-stream reconciler for Coda volumes (component C8.4.6.2).
//!
//! A volume dump is streamed from the Coda server as
//! `ssh host volutil dump ... | codadump2tar -rn .` and consumed entry by
//! entry without buffering the whole tree in memory.

use std::collections::HashSet;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;
use tar::{Archive, EntryType};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::Unit;
use crate::util::atomic_update::UpdateFile;
use crate::util::xattrs::XAttrs;
use crate::util::{gc_directory_tree, lutime, make_dir_path, random_do_work, set_mtime};

const ATTR_INCREMENTAL: &str = "user.coda.incremental-ok";
const ATTR_STAT: &str = "user.rsync.%stat";
const DUMP_ATTEMPTS: u32 = 10;

pub fn get_relroot(hostname: &str, volume: &str) -> String {
	let host = hostname.split('.').next().unwrap_or(hostname);
	format!("coda/{host}/{volume}")
}

pub fn get_units(config: &Config) -> Result<Vec<Unit>> {
	let mut entries: Vec<_> = config.coda.iter().collect();
	entries.sort_by_key(|(name, _)| (*name).clone());

	let mut units = Vec::new();
	for (name, info) in entries {
		let mut backup_args = vec![
			"coda".to_string(),
			"backup".to_string(),
			info.server.clone(),
			info.volume.clone(),
		];
		if random_do_work(config.settings.coda_full_probability) {
			backup_args.push("-i".to_string());
		}
		units.push(Unit {
			root: get_relroot(&info.server, &info.volume),
			backup_args,
		});
		let _ = name;
	}
	Ok(units)
}

fn volutil_cmd(host: &str, subcommand: &str, args: &[String], volutil: &str) -> Vec<String> {
	let mut cmd = vec![
		"ssh".to_string(),
		"-o".to_string(),
		"BatchMode=yes".to_string(),
		"-o".to_string(),
		"StrictHostKeyChecking=no".to_string(),
		format!("root@{host}"),
		volutil.to_string(),
		subcommand.to_string(),
	];
	cmd.extend(args.iter().cloned());
	println!("> {}", cmd.join(" "));
	cmd
}

fn run_volutil(host: &str, subcommand: &str, args: &[String], volutil: &str, verbose: bool) -> Result<()> {
	let cmd = volutil_cmd(host, subcommand, args, volutil);
	let mut command = Command::new(&cmd[0]);
	command.args(&cmd[1..]);
	if !verbose {
		command.stdout(Stdio::null()).stderr(Stdio::null());
	}
	let status = command.status()?;
	if !status.success() {
		return Err(Error::SubprocessFailed {
			program: "volutil".into(),
			code: status.code().unwrap_or(-1),
		});
	}
	Ok(())
}

fn volutil_output(host: &str, subcommand: &str, args: &[String], volutil: &str) -> Result<String> {
	let cmd = volutil_cmd(host, subcommand, args, volutil);
	let output = Command::new(&cmd[0]).args(&cmd[1..]).stderr(Stdio::null()).output()?;
	if !output.status.success() {
		return Err(Error::DumpError {
			message: format!("couldn't get volume info via {volutil}"),
		});
	}
	Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn get_volume_ids(host: &str, volume: &str, volutil: &str) -> Result<(String, String)> {
	let info = volutil_output(host, "info", &[volume.to_string()], volutil)?;

	let id_re = Regex::new(r"(?m)^id = ([0-9a-f]+)").unwrap();
	let volume_id = id_re
		.captures(&info)
		.and_then(|c| c.get(1))
		.ok_or_else(|| Error::DumpError {
			message: format!("couldn't find volume ID for {volume}"),
		})?
		.as_str()
		.to_string();

	let backup_re = Regex::new(r", backupId = ([0-9a-f]+)").unwrap();
	let backup_id = backup_re
		.captures(&info)
		.and_then(|c| c.get(1))
		.ok_or_else(|| Error::DumpError {
			message: format!("couldn't find backup ID for {volume}"),
		})?
		.as_str()
		.to_string();

	Ok((volume_id, backup_id))
}

pub fn refresh_backup_volume(host: &str, volume: &str, volutil: &str, verbose: bool) -> Result<()> {
	let (volume_id, _) = get_volume_ids(host, volume, volutil)?;
	run_volutil(host, "lock", &[volume_id.clone()], volutil, verbose)?;
	run_volutil(host, "backup", &[volume_id], volutil, verbose)?;
	Ok(())
}

fn build_path(root_dir: &Path, name: &str) -> Result<PathBuf> {
	let joined = root_dir.join(name);
	if joined.components().any(|c| c.as_os_str() == "..") {
		return Err(Error::DumpError {
			message: format!("attempted directory traversal: {name}"),
		});
	}
	Ok(joined)
}

/// Copy one tar entry's contents into `dest`, raising [`Error::DumpError`]
/// if the stream is truncated mid-file (rather than leaving a partially
/// overwritten mirror file).
fn copy_entry<R: Read>(entry: &mut tar::Entry<'_, R>, dest: &Path) -> Result<bool> {
	let expected = entry.size();
	let mut update = UpdateFile::new(dest)?;
	let copied = io::copy(entry, &mut update)?;
	if copied < expected {
		update.abort();
		return Err(Error::DumpError {
			message: "premature EOF on tar stream".into(),
		});
	}
	Ok(update.finish()?)
}

/// Stream a tar archive into `root_dir`, returning the set of paths that
/// are now valid (backing a GC pass for full backups).
pub fn update_dir_from_tar<R: Read>(archive: &mut Archive<R>, root_dir: &Path) -> Result<HashSet<PathBuf>> {
	let mut directories: Vec<(PathBuf, i64)> = Vec::new();
	let mut valid_paths: HashSet<PathBuf> = HashSet::new();

	for entry in archive.entries()? {
		let mut entry = entry.map_err(|e| Error::DumpError { message: e.to_string() })?;
		let header = entry.header().clone();
		let entry_type = header.entry_type();
		let name = entry.path()?.to_path_buf();
		let path = build_path(root_dir, &name.to_string_lossy())?;
		let mtime = header.mtime().unwrap_or(0) as i64;
		let mode = header.mode().unwrap_or(0o644);
		let uid = header.uid().unwrap_or(0);
		let gid = header.gid().unwrap_or(0);

		let stat_type = match entry_type {
			EntryType::Directory => libc::S_IFDIR,
			EntryType::Regular | EntryType::Link => libc::S_IFREG,
			EntryType::Symlink => libc::S_IFLNK,
			other => {
				return Err(Error::DumpError {
					message: format!("unexpected tar entry type {other:?}"),
				})
			}
		};

		let existing = std::fs::symlink_metadata(&path).ok();
		if let Some(st) = &existing {
			if (st.mode() as u32 & libc::S_IFMT as u32) != stat_type as u32 {
				if st.is_dir() {
					std::fs::remove_dir_all(&path)?;
				} else {
					std::fs::remove_file(&path)?;
				}
			}
		}
		let existing = std::fs::symlink_metadata(&path).ok();

		if let Some(parent) = path.parent() {
			make_dir_path(parent)?;
		}

		match entry_type {
			EntryType::Directory => {
				if existing.is_none() {
					println!("d {}", path.display());
					std::fs::create_dir(&path)?;
				}
				directories.push((path.clone(), mtime));
			}
			EntryType::Regular => {
				if copy_entry(&mut entry, &path)? {
					println!("f {}", path.display());
				}
			}
			EntryType::Symlink => {
				let link_name = entry.link_name()?.map(|p| p.to_path_buf());
				if let Some(link_name) = link_name {
					let current = std::fs::read_link(&path).ok();
					if current.as_deref() != Some(link_name.as_path()) {
						println!("s {}", path.display());
						if existing.is_some() {
							std::fs::remove_file(&path)?;
						}
						std::os::unix::fs::symlink(&link_name, &path)?;
					}
				}
			}
			EntryType::Link => {
				let link_name = entry.link_name()?.map(|p| p.to_path_buf());
				if let Some(link_name) = link_name {
					let target_path = build_path(root_dir, &link_name.to_string_lossy())?;
					let target_st = std::fs::symlink_metadata(&target_path)?;
					let same = existing
						.as_ref()
						.map(|st| st.dev() == target_st.dev() && st.ino() == target_st.ino())
						.unwrap_or(false);
					if !same {
						println!("l {}", path.display());
						if existing.is_some() {
							std::fs::remove_file(&path)?;
						}
						std::fs::hard_link(&target_path, &path)?;
					}
				}
			}
			_ => unreachable!(),
		}

		let attrs = XAttrs::new(&path);
		if matches!(entry_type, EntryType::Regular | EntryType::Directory) {
			let mode_field = stat_type | (mode as i32);
			attrs.update(ATTR_STAT, &format!("{mode_field:o} 0,0 {uid}:{gid}"))?;
		}
		if matches!(entry_type, EntryType::Regular | EntryType::Symlink) {
			if let Ok(st) = std::fs::symlink_metadata(&path) {
				if st.mtime() != mtime {
					lutime(&path, mtime)?;
				}
			}
		}

		valid_paths.insert(path);
	}

	for (path, mtime) in directories {
		let st = std::fs::metadata(&path)?;
		if st.mtime() != mtime {
			set_mtime(&path, mtime)?;
		}
	}

	Ok(valid_paths)
}

#[allow(clippy::too_many_arguments)]
pub fn update_dir(host: &str, backup_id: &str, root_dir: &Path, incremental: bool, volutil: &str, codadump2tar: &str) -> Result<HashSet<PathBuf>> {
	let mut args = if incremental {
		vec!["-i".to_string(), "-1".to_string()]
	} else {
		Vec::new()
	};
	args.push(backup_id.to_string());

	let mut cmd = volutil_cmd(host, "dump", &args, volutil);
	let shell = format!("{} | {} -rn .", cmd.drain(..).collect::<Vec<_>>().join(" "), codadump2tar);

	let mut child = Command::new("sh")
		.arg("-c")
		.arg(&shell)
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.spawn()?;
	let stdout = child.stdout.take().expect("piped stdout");
	let mut archive = Archive::new(stdout);
	let result = update_dir_from_tar(&mut archive, root_dir);
	let status = child.wait()?;

	let valid_paths = result?;
	if !status.success() {
		return Err(Error::DumpError {
			message: format!("coda dump returned {}", status.code().unwrap_or(-1)),
		});
	}
	Ok(valid_paths)
}

#[allow(clippy::too_many_arguments)]
pub fn sync_backup_volume(
	host: &str,
	volume: &str,
	root_dir: &Path,
	mut incremental: bool,
	volutil: &str,
	codadump2tar: &str,
	verbose: bool,
) -> Result<()> {
	make_dir_path(root_dir)?;

	let root_attrs = XAttrs::new(root_dir);
	if !root_attrs.contains(ATTR_INCREMENTAL)? {
		incremental = false;
	}
	if !incremental {
		root_attrs.delete(ATTR_INCREMENTAL)?;
	}

	let (_, backup_id) = get_volume_ids(host, volume, volutil)?;

	let mut valid_paths = None;
	let mut tries_remaining = DUMP_ATTEMPTS - 1;
	loop {
		match update_dir(host, &backup_id, root_dir, incremental, volutil, codadump2tar) {
			Ok(paths) => {
				valid_paths = Some(paths);
				break;
			}
			Err(Error::DumpError { .. }) if tries_remaining > 0 => {
				tries_remaining -= 1;
			}
			Err(e) => return Err(e),
		}
	}
	let valid_paths = valid_paths.expect("loop exits only with paths or an error");

	if !incremental {
		gc_directory_tree(
			root_dir,
			|p| valid_paths.contains(p),
			|p, _| println!("- {}", p.display()),
		)?;
	}

	run_volutil(host, "ancient", &[backup_id], volutil, verbose)?;
	root_attrs.update(ATTR_INCREMENTAL, "true")?;
	Ok(())
}
