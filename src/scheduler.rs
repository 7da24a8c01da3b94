//! Two-level work scheduler (component C9).
//!
//! One pool per source type, pools running concurrently; each pool has a
//! fixed-size worker set pulling [`Unit`]s from a shared FIFO. A worker
//! executes a unit by re-invoking the current binary with the unit's
//! argv, stdin from `/dev/null`, and stdout/stderr appended to per-day
//! log files under `Logs/<unit-root>/`. A unit's failure is recorded and
//! reported but never aborts its siblings.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use chrono::Local;

use crate::util::make_dir_path;

const LOG_EXCERPT_INPUT_BYTES: u64 = 8192;
const LOG_EXCERPT_MAX_BYTES: usize = 4096;
const LOG_EXCERPT_MAX_LINES: usize = 10;

/// A logical backup subject: a relative mirror path plus the argv that
/// re-invokes the program to back it up.
#[derive(Debug, Clone)]
pub struct Unit {
	pub root: String,
	pub backup_args: Vec<String>,
}

/// Implemented once per source label; `get_units` enumerates the
/// manifest-configured units for that source.
pub trait Source {
	fn label(&self) -> &'static str;
	fn get_units(&self) -> crate::error::Result<Vec<Unit>>;
	fn worker_count(&self) -> usize {
		1
	}
}

/// Run `units` across `thread_count` worker threads, each re-invoking the
/// current executable per unit, logging to `log_root/<unit-root>/`.
/// Returns whether every unit exited successfully.
pub fn run_units(units: Vec<Unit>, thread_count: usize, log_root: &Path) -> bool {
	let queue = Arc::new(Mutex::new(VecDeque::from(units)));
	let thread_count = thread_count.max(1);
	let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("deltaic"));

	std::thread::scope(|scope| {
		let handles: Vec<_> = (0..thread_count)
			.map(|_| {
				let queue = Arc::clone(&queue);
				let exe = exe.clone();
				scope.spawn(move || {
					let mut ok = true;
					loop {
						let unit = {
							let mut q = queue.lock().unwrap();
							q.pop_front()
						};
						let Some(unit) = unit else { break };
						let log_dir = match make_dir_path(log_root.join(&unit.root)) {
							Ok(d) => d,
							Err(_) => {
								ok = false;
								continue;
							}
						};
						if !execute_unit(&exe, &unit, &log_dir) {
							ok = false;
						}
					}
					ok
				})
			})
			.collect();
		handles.into_iter().all(|h| h.join().unwrap_or(false))
	})
}

fn execute_unit(exe: &Path, unit: &Unit, log_dir: &Path) -> bool {
	let name = &unit.root;
	let start_time = Local::now();
	println!("{} Starting {name}", start_time.format("%Y-%m-%d %H:%M:%S"));

	let log_base = log_dir.join(start_time.format("%Y%m%d").to_string());
	let err_path = log_base.with_extension("err");
	let out_path = log_base.with_extension("out");

	let command_line = std::iter::once(exe.display().to_string())
		.chain(unit.backup_args.iter().cloned())
		.collect::<Vec<_>>()
		.join(" ");

	let open_append = |path: &Path| -> std::io::Result<std::fs::File> {
		OpenOptions::new().create(true).append(true).open(path)
	};

	let success = (|| -> std::io::Result<bool> {
		let mut out = open_append(&out_path)?;
		let mut err = open_append(&err_path)?;
		for fh in [&mut out, &mut err] {
			writeln!(fh, "# Starting task at {}", start_time.format("%Y-%m-%d %H:%M:%S"))?;
			writeln!(fh, "# {command_line}")?;
			fh.flush()?;
		}

		let status = Command::new(exe)
			.args(&unit.backup_args)
			.stdin(Stdio::null())
			.stdout(Stdio::from(out.try_clone()?))
			.stderr(Stdio::from(err.try_clone()?))
			.env("DELTAIC_UNBUFFERED", "1")
			.status()?;

		let end_time = Local::now();
		for fh in [&mut out, &mut err] {
			match status.code() {
				Some(code) => writeln!(fh, "# Task exited with status {code}")?,
				None => writeln!(fh, "# Task died on signal")?,
			}
			writeln!(fh, "# Ending task at {}\n", end_time.format("%Y-%m-%d %H:%M:%S"))?;
		}

		if !status.success() {
			let excerpt = read_failure_excerpt(&err_path)?;
			eprintln!(
				"{} Failed:  {name}\n   {command_line}\n{excerpt}",
				end_time.format("%Y-%m-%d %H:%M:%S")
			);
		}
		println!("{} Ending   {name}", end_time.format("%Y-%m-%d %H:%M:%S"));
		Ok(status.success())
	})();

	success.unwrap_or(false)
}

/// Read a bounded tail of a failed unit's stderr log, strip
/// Python-style traceback blocks (keep the summary line, drop indented
/// continuation lines), and cap the result at
/// [`LOG_EXCERPT_MAX_BYTES`]/[`LOG_EXCERPT_MAX_LINES`], prefixing `[...]`
/// if anything was cut.
fn read_failure_excerpt(err_path: &Path) -> std::io::Result<String> {
	let mut file = std::fs::File::open(err_path)?;
	let len = file.seek(SeekFrom::End(0))?;
	let start = len.saturating_sub(LOG_EXCERPT_INPUT_BYTES);
	file.seek(SeekFrom::Start(start))?;
	let mut buf = Vec::new();
	file.read_to_end(&mut buf)?;
	let excerpt = String::from_utf8_lossy(&buf);
	let excerpt = excerpt.trim();
	let mut truncated = start > 0;

	let mut accept = true;
	let mut lines = Vec::new();
	for line in excerpt.split('\n') {
		if accept {
			if line == "Traceback (most recent call last):" {
				accept = false;
			} else {
				lines.push(line.to_string());
			}
		} else if !line.starts_with(' ') {
			accept = true;
			lines.push(line.to_string());
		}
	}

	let mut joined = lines.join("\n");
	if joined.len() > LOG_EXCERPT_MAX_BYTES {
		joined = joined[joined.len() - LOG_EXCERPT_MAX_BYTES..].to_string();
		truncated = true;
	}
	let mut lines: Vec<&str> = joined.split('\n').collect();
	if lines.len() > LOG_EXCERPT_MAX_LINES {
		let cut = lines.len() - LOG_EXCERPT_MAX_LINES;
		lines.drain(0..cut);
		truncated = true;
	}
	if truncated {
		lines.insert(0, "[...]");
	}
	Ok(lines.iter().map(|l| format!("   {l}")).collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write as _;

	#[test]
	fn excerpt_strips_traceback_and_keeps_summary() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("20240101.err");
		let mut f = std::fs::File::create(&path).unwrap();
		writeln!(f, "starting up").unwrap();
		writeln!(f, "Traceback (most recent call last):").unwrap();
		writeln!(f, "  File \"x.py\", line 1").unwrap();
		writeln!(f, "    raise ValueError").unwrap();
		writeln!(f, "ValueError: boom").unwrap();
		drop(f);

		let excerpt = read_failure_excerpt(&path).unwrap();
		assert!(excerpt.contains("starting up"));
		assert!(!excerpt.contains("File \"x.py\""));
		assert!(excerpt.contains("ValueError: boom"));
	}

	#[test]
	fn excerpt_marks_truncation() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("20240101.err");
		let mut f = std::fs::File::create(&path).unwrap();
		for i in 0..40 {
			writeln!(f, "line {i}").unwrap();
		}
		drop(f);

		let excerpt = read_failure_excerpt(&path).unwrap();
		assert!(excerpt.starts_with("   [...]"));
	}
}
