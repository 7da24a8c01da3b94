//! Error taxonomy shared across the core. Transient conditions that a caller
//! is expected to retry (`ConditionalCheckFailed`, rbd/dump truncation) are
//! distinct variants rather than generic I/O errors, so that retry loops can
//! match on them instead of string-sniffing.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
	/// Another instance already holds the named lock.
	#[error("another action is already running (lock: {name})")]
	#[diagnostic(code(deltaic::lock_conflict))]
	LockConflict { name: String },

	/// A streamed Coda tar dump was truncated mid-entry.
	#[error("dump stream truncated: {message}")]
	#[diagnostic(code(deltaic::dump_error))]
	DumpError { message: String },

	/// A compare-and-swap write to the archive metadata ledger lost a race.
	#[error("conditional check failed against metadata store")]
	#[diagnostic(code(deltaic::cas_failed))]
	ConditionalCheckFailed,

	/// A unit's backup/restore subcommand exited non-zero.
	#[error("unit {unit} failed")]
	#[diagnostic(code(deltaic::unit_failed))]
	UnitFailed { unit: String },

	/// A subprocess pipeline stage exited non-zero.
	#[error("subprocess {program} exited with status {code}")]
	#[diagnostic(code(deltaic::subprocess_failed))]
	SubprocessFailed { program: String, code: i32 },

	/// The configured root is not actually a mounted filesystem.
	#[error("backup filesystem at {path} is not mounted")]
	#[diagnostic(code(deltaic::not_mounted))]
	NotMounted { path: PathBuf },

	/// The RBD diff wire format did not match the documented grammar.
	#[error("malformed rbd diff stream: {message}")]
	#[diagnostic(code(deltaic::bad_rbd_diff))]
	BadRbdDiff { message: String },

	/// A packed archive failed GPG signature verification or checksum
	/// verification during unpack.
	#[error("archive verification failed: {message}")]
	#[diagnostic(code(deltaic::verification_failed))]
	VerificationFailed { message: String },

	#[error(transparent)]
	#[diagnostic(code(deltaic::io))]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	#[diagnostic(code(deltaic::config))]
	Config(#[from] json5::Error),

	#[error(transparent)]
	#[diagnostic(code(deltaic::json))]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
