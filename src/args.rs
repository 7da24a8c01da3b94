use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use miette::{miette, Result};
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Pull-based backup orchestrator for heterogeneous data sources.
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	long_version = format!("{} built from branch={} commit={} dirty={} source_timestamp={}",
		env!("CARGO_PKG_VERSION"),
		env!("GIT_BRANCH"),
		env!("GIT_COMMIT"),
		env!("GIT_DIRTY"),
		env!("SOURCE_TIMESTAMP"),
    ),
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help.",
)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	/// Path to the configuration file
	#[arg(short = 'c', long, env = "DELTAIC_CONFIG", value_hint = ValueHint::FilePath)]
	pub config_file: Option<PathBuf>,

	/// When to use terminal colours
	#[arg(long, default_value = "auto", value_name = "MODE", alias = "colour")]
	pub color: ColourMode,

	/// Set diagnostic log level
	///
	/// This enables diagnostic logging, which is useful for investigating bugs. Use multiple
	/// times to increase verbosity. Goes up to '-vvvvv'.
	///
	/// You may want to use with '--log-file' to avoid polluting your terminal.
	///
	/// Setting $RUST_LOG also works, and takes precedence, but is not recommended unless you know
	/// what you're doing. However, using $RUST_LOG is the only way to get logs from before these
	/// options are parsed.
	#[arg(
		long,
		short,
		action = ArgAction::Count,
		num_args = 0,
	)]
	pub verbose: Option<u8>,

	/// Write diagnostic logs to a file
	///
	/// This writes diagnostic logs to a file, instead of the terminal, in JSON format. If a log
	/// level was not already specified, this will set it to '-vvv'.
	///
	/// If the path provided is a directory, a file will be created in that directory. The file
	/// name will be the current date and time, in the format 'deltaic.YYYY-MM-DDTHH-MM-SSZ.log'.
	#[arg(
		long,
		num_args = 0..=1,
		default_missing_value = ".",
		value_hint = ValueHint::AnyPath,
		value_name = "PATH",
	)]
	pub log_file: Option<PathBuf>,

	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ColourMode {
	Auto,
	Always,
	Never,
}

fn level_filter(verbose: u8) -> &'static str {
	match verbose {
		0 => "info",
		1 => "info,deltaic=debug",
		2 => "debug",
		3 => "debug,deltaic=trace",
		_ => "trace",
	}
}

/// Parse arguments and install the global tracing subscriber, returning the
/// appender's flush guard alongside the parsed arguments: dropping it early
/// would silently truncate the log file on exit.
pub fn args() -> Result<(Args, Option<WorkerGuard>)> {
	if std::env::var("RUST_LOG").is_ok() {
		warn!("⚠ RUST_LOG environment variable set, logging options have no effect");
	}

	let parsed = Args::parse();
	let verbosity = parsed.verbose.unwrap_or(0);
	let filter = if std::env::var("RUST_LOG").is_ok() {
		EnvFilter::from_default_env()
	} else {
		EnvFilter::new(level_filter(if parsed.log_file.is_some() { verbosity.max(3) } else { verbosity }))
	};

	let guard = match &parsed.log_file {
		Some(path) => {
			let (dir, prefix) = if path.as_os_str() == "." || path.is_dir() {
				(path.clone(), "deltaic".to_string())
			} else {
				(
					path.parent().map(PathBuf::from).unwrap_or_default(),
					path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "deltaic".to_string()),
				)
			};
			let appender = tracing_appender::rolling::never(dir, prefix);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			fmt()
				.json()
				.with_env_filter(filter)
				.with_writer(writer)
				.try_init()
				.map_err(|err| miette!("{err}"))?;
			Some(guard)
		}
		None => {
			let ansi = match parsed.color {
				ColourMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
				ColourMode::Always => true,
				ColourMode::Never => false,
			};
			fmt()
				.with_env_filter(filter)
				.with_writer(std::io::stderr)
				.with_ansi(ansi)
				.try_init()
				.map_err(|err| miette!("{err}"))?;
			None
		}
	};

	debug!(?parsed, "got arguments");
	Ok((parsed, guard))
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
