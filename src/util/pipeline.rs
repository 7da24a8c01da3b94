//! Fan-in/fan-out chain of external programs with controlled fd plumbing
//! (component C4).
//!
//! The packer builds `tar | compress | gpg`; the RBD reconciler streams
//! `rbd export-diff` straight into the differential applier. Both need an
//! N-stage pipeline where only the first stage's stdin and the last
//! stage's stdout are overridable, intermediate fds are wired
//! automatically, and a failure partway through tears everything down
//! instead of deadlocking on a half-drained pipe.

use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};

pub enum Endpoint {
	Inherit,
	Null,
	Piped,
}

/// One stage of the pipeline: program name plus arguments.
pub struct Stage {
	pub program: String,
	pub args: Vec<String>,
	pub envs: Vec<(String, String)>,
}

impl Stage {
	pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			program: program.into(),
			args: args.into_iter().map(Into::into).collect(),
			envs: Vec::new(),
		}
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.envs.push((key.into(), value.into()));
		self
	}
}

/// A running N-stage pipeline. Stage 0's stdin and the last stage's
/// stdout are controlled by `stdin`/`stdout`; everything between is piped
/// stage-to-stage by the OS.
pub struct Pipeline {
	children: Vec<(String, Child)>,
}

impl Pipeline {
	pub fn spawn(stages: Vec<Stage>, stdin: Endpoint, stdout: Endpoint) -> Result<Self> {
		assert!(!stages.is_empty(), "pipeline must have at least one stage");
		let n = stages.len();
		let mut children = Vec::with_capacity(n);
		let mut next_stdin: Option<std::process::ChildStdout> = None;

		for (i, stage) in stages.into_iter().enumerate() {
			let mut cmd = Command::new(&stage.program);
			cmd.args(&stage.args);
			for (k, v) in &stage.envs {
				cmd.env(k, v);
			}

			if i == 0 {
				cmd.stdin(match stdin {
					Endpoint::Inherit => Stdio::inherit(),
					Endpoint::Null => Stdio::null(),
					Endpoint::Piped => Stdio::piped(),
				});
			} else if let Some(pipe) = next_stdin.take() {
				cmd.stdin(Stdio::from(pipe));
			}

			if i + 1 == n {
				cmd.stdout(match stdout {
					Endpoint::Inherit => Stdio::inherit(),
					Endpoint::Null => Stdio::null(),
					Endpoint::Piped => Stdio::piped(),
				});
			} else {
				cmd.stdout(Stdio::piped());
			}

			let program = stage.program.clone();
			let spawned = match cmd.spawn() {
				Ok(c) => c,
				Err(e) => {
					// Tear down anything already spawned before bubbling up.
					for (_, mut child) in children {
						let _ = child.kill();
						let _ = child.wait();
					}
					return Err(Error::Io(e));
				}
			};
			let mut spawned = spawned;
			if i + 1 < n {
				next_stdin = spawned.stdout.take();
			}
			children.push((program, spawned));
		}

		Ok(Self { children })
	}

	/// Take the final stage's stdout, if it was spawned with
	/// [`Endpoint::Piped`].
	pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
		self.children.last_mut()?.1.stdout.take()
	}

	/// Take the first stage's stdin, if it was spawned with
	/// [`Endpoint::Piped`].
	pub fn take_stdin(&mut self) -> Option<std::process::ChildStdin> {
		self.children.first_mut()?.1.stdin.take()
	}

	/// Wait for every stage; error if any exited non-zero.
	pub fn wait(mut self) -> Result<()> {
		let mut failure = None;
		for (program, mut child) in self.children.drain(..) {
			let status = child.wait()?;
			if !status.success() && failure.is_none() {
				failure = Some(Error::SubprocessFailed {
					program,
					code: status.code().unwrap_or(-1),
				});
			}
		}
		match failure {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Terminate every stage immediately; used on the exceptional exit
	/// path to avoid deadlocking on a pipe nobody will ever drain again.
	pub fn terminate(mut self) {
		for (_, mut child) in self.children.drain(..) {
			let _ = child.kill();
			let _ = child.wait();
		}
	}
}

impl Drop for Pipeline {
	fn drop(&mut self) {
		for (_, child) in &mut self.children {
			let _ = child.kill();
			let _ = child.wait();
		}
	}
}
