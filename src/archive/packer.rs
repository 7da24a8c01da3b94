//! Tar -> compress -> optional GPG sign/encrypt -> SHA-256 pipeline
//! (component C4 applied to the archive path).
//!
//! Packing never decrypts anything, so it's a straight multi-stage
//! [`Pipeline`]. Unpacking can't use the same trick: GPG must finish
//! verifying the signature before tar sees a single untrusted byte, so
//! the GPG stage is run to completion into a spool file first and only
//! then handed to tar.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::{ArchiverProfile, Compression, Settings};
use crate::error::{Error, Result};
use crate::util::pipeline::{Endpoint, Pipeline, Stage};
use crate::util::xattrs::XAttrs;

const BUFLEN: usize = 4 << 20;

const ATTR_COMPRESSION: &str = "user.archive.compression";
const ATTR_ENCRYPTION: &str = "user.archive.encryption";
const ATTR_SHA256: &str = "user.archive.sha256";

/// Metadata describing a packed archive, stored both as xattrs on the
/// local spool file and as fields in the backend's metadata record.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
	pub compression: String,
	pub encryption: String,
	pub sha256: String,
	pub size: u64,
}

impl ArchiveInfo {
	pub fn from_file(path: &Path) -> Result<Self> {
		let attrs = XAttrs::new(path);
		Ok(Self {
			compression: attrs.get(ATTR_COMPRESSION)?.unwrap_or_default(),
			encryption: attrs.get(ATTR_ENCRYPTION)?.unwrap_or_default(),
			sha256: attrs.get(ATTR_SHA256)?.unwrap_or_default(),
			size: std::fs::metadata(path)?.len(),
		})
	}

	pub fn to_file(&self, path: &Path) -> Result<()> {
		if std::fs::metadata(path)?.len() != self.size {
			return Err(Error::VerificationFailed { message: "size mismatch".into() });
		}
		let attrs = XAttrs::new(path);
		attrs.update(ATTR_COMPRESSION, &self.compression)?;
		attrs.update(ATTR_ENCRYPTION, &self.encryption)?;
		attrs.update(ATTR_SHA256, &self.sha256)?;
		Ok(())
	}
}

pub struct ArchivePacker {
	spool_dir: PathBuf,
	tar_path: String,
	gpg_path: String,
	gpg_recipients: Vec<String>,
	gpg_signing_key: Option<String>,
	encryption: &'static str,
}

impl ArchivePacker {
	pub fn new(settings: &Settings, profile: &ArchiverProfile) -> Self {
		let encryption = if profile.recipients.is_empty() { "none" } else { "gpg" };
		Self {
			spool_dir: settings.archive_spool.clone(),
			tar_path: settings.archive_tar_path.clone().unwrap_or_else(|| "tar".into()),
			gpg_path: settings.archive_gpg_path.clone().unwrap_or_else(|| "gpg2".into()),
			gpg_recipients: profile.recipients.clone(),
			gpg_signing_key: profile.signing_key.clone(),
			encryption,
		}
	}

	fn compress_option(compression: Compression) -> Option<&'static str> {
		match compression {
			Compression::Gzip => Some("--gzip"),
			Compression::Lzop => Some("--lzop"),
			Compression::None => None,
		}
	}

	fn compression_label(compression: Compression) -> &'static str {
		match compression {
			Compression::Gzip => "gzip",
			Compression::Lzop => "lzop",
			Compression::None => "none",
		}
	}

	fn parse_compression(label: &str) -> Result<Compression> {
		match label {
			"gzip" => Ok(Compression::Gzip),
			"lzop" => Ok(Compression::Lzop),
			"none" => Ok(Compression::None),
			other => Err(Error::VerificationFailed { message: format!("unknown compression algorithm: {other}") }),
		}
	}

	fn gpg_args(&self, extra: Vec<String>) -> Vec<String> {
		let mut args = vec![
			"--batch".to_string(),
			"--no-tty".into(),
			"--no-options".into(),
			"--personal-cipher-preferences".into(),
			"AES256,AES192,AES".into(),
			"--personal-digest-preferences".into(),
			"SHA256,SHA1".into(),
			"--personal-compress-preferences".into(),
			"Uncompressed".into(),
		];
		args.extend(extra);
		args
	}

	fn tty_name() -> Option<String> {
		unsafe {
			let ptr = libc::ttyname(0);
			if ptr.is_null() {
				return None;
			}
			std::ffi::CStr::from_ptr(ptr).to_str().ok().map(str::to_string)
		}
	}

	/// Pack `unit_name` under `snapshot_root` into a fresh spool file,
	/// returning it (unlinked on drop) along with the metadata to store
	/// alongside the uploaded bytes.
	pub fn pack(&self, snapshot_name: &str, snapshot_root: &Path, unit_name: &str, compression: Compression) -> Result<(NamedTempFile, ArchiveInfo)> {
		let mut tar_args = vec![
			"c".to_string(),
			"--force-local".into(),
			"--format=gnu".into(),
			"--sparse".into(),
			"--acls".into(),
			"--selinux".into(),
			"--xattrs".into(),
			"-V".into(),
			format!("{snapshot_name} {unit_name}"),
			"-C".into(),
			snapshot_root.display().to_string(),
			unit_name.into(),
		];
		if let Some(opt) = Self::compress_option(compression) {
			tar_args.push(opt.to_string());
		}

		let mut stages = vec![Stage::new(&self.tar_path, tar_args)];
		if self.encryption == "gpg" {
			let key = self
				.gpg_signing_key
				.as_deref()
				.ok_or_else(|| Error::VerificationFailed { message: "archiver profile has recipients but no signing key".into() })?;
			let mut extra = vec!["-seu".to_string(), key.to_string()];
			for recipient in &self.gpg_recipients {
				extra.push("-r".into());
				extra.push(recipient.clone());
			}
			let mut gpg = Stage::new(&self.gpg_path, self.gpg_args(extra));
			if let Some(tty) = Self::tty_name() {
				gpg = gpg.env("GPG_TTY", tty);
			}
			stages.push(gpg);
		}

		let mut pipeline = Pipeline::spawn(stages, Endpoint::Null, Endpoint::Piped)?;
		let mut stdout = pipeline.take_stdout().expect("last stage spawned with piped stdout");

		let out_file = NamedTempFile::with_prefix_in("archive-", &self.spool_dir)?;
		let mut out = out_file.reopen()?;
		let mut hasher = Sha256::new();
		let mut buf = vec![0u8; BUFLEN];
		loop {
			let n = stdout.read(&mut buf)?;
			if n == 0 {
				break;
			}
			hasher.update(&buf[..n]);
			out.write_all(&buf[..n])?;
		}
		out.flush()?;
		drop(stdout);
		pipeline.wait()?;

		let size = out.metadata()?.len();
		Ok((
			out_file,
			ArchiveInfo {
				compression: Self::compression_label(compression).to_string(),
				encryption: self.encryption.to_string(),
				sha256: hex::encode(hasher.finalize()),
				size,
			},
		))
	}

	/// Verify and unpack a downloaded archive into `out_root`.
	pub fn unpack(&self, in_file: &Path, out_root: &Path) -> Result<()> {
		let info = ArchiveInfo::from_file(in_file)?;
		if info.encryption != self.encryption {
			// If the archive backend were compromised, it shouldn't be able to
			// bypass signature checking by replacing the archive and setting
			// the encryption field to "none".
			return Err(Error::VerificationFailed { message: "archive encryption doesn't match local settings; check metadata integrity".into() });
		}
		let compress_opt = Self::compress_option(Self::parse_compression(&info.compression)?);

		let source = match info.encryption.as_str() {
			"gpg" => self.gpg_decrypt_verify(in_file)?,
			"none" => {
				let mut fh = File::open(in_file)?;
				let mut hasher = Sha256::new();
				let mut buf = vec![0u8; BUFLEN];
				loop {
					let n = fh.read(&mut buf)?;
					if n == 0 {
						break;
					}
					hasher.update(&buf[..n]);
				}
				if hex::encode(hasher.finalize()) != info.sha256 {
					return Err(Error::VerificationFailed { message: "sha-256 mismatch".into() });
				}
				NamedTempFileOrPlain::Plain(in_file.to_path_buf())
			}
			other => return Err(Error::VerificationFailed { message: format!("unknown encryption method: {other}") }),
		};

		let mut tar_args = vec!["x".to_string(), "--force-local".into(), "--acls".into(), "--selinux".into(), "--xattrs".into(), "-C".into(), out_root.display().to_string()];
		if let Some(opt) = compress_opt {
			tar_args.push(opt.to_string());
		}
		let in_path = source.path();
		let stdin_file = File::open(in_path)?;
		let status = Command::new(&self.tar_path).args(&tar_args).stdin(Stdio::from(stdin_file)).status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed { program: self.tar_path.clone(), code: status.code().unwrap_or(-1) });
		}
		Ok(())
	}

	/// Run the archive through `gpg -d`, parsing `--status-fd` output for a
	/// `GOODSIG`/`VALIDSIG` line naming the configured signing key before
	/// trusting a single decrypted byte.
	fn gpg_decrypt_verify(&self, in_path: &Path) -> Result<NamedTempFileOrPlain> {
		use std::os::unix::io::FromRawFd;
		use std::os::unix::process::CommandExt;

		let configured_key = self.gpg_signing_key.as_deref().unwrap_or_default().to_lowercase();
		let in_fh = File::open(in_path)?;
		let out_file = NamedTempFile::with_prefix_in("unpack-", &self.spool_dir)?;
		let out_fh = out_file.reopen()?;

		let mut fds = [0 as libc::c_int; 2];
		if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
			return Err(Error::Io(std::io::Error::last_os_error()));
		}
		let (status_r, status_w) = (fds[0], fds[1]);

		let mut cmd = Command::new(&self.gpg_path);
		cmd.args(self.gpg_args(vec!["-d".into(), "--status-fd".into(), "3".into()]));
		if let Some(tty) = Self::tty_name() {
			cmd.env("GPG_TTY", tty);
		}
		cmd.stdin(Stdio::from(in_fh));
		cmd.stdout(Stdio::from(out_fh));
		unsafe {
			cmd.pre_exec(move || {
				if libc::dup2(status_w, 3) < 0 {
					return Err(std::io::Error::last_os_error());
				}
				Ok(())
			});
		}

		let spawn_result = cmd.spawn();
		unsafe {
			libc::close(status_w);
		}
		let mut child = spawn_result?;
		let mut status_text = String::new();
		unsafe { File::from_raw_fd(status_r) }.read_to_string(&mut status_text)?;

		let exit = child.wait()?;
		if !exit.success() {
			return Err(Error::SubprocessFailed { program: self.gpg_path.clone(), code: exit.code().unwrap_or(-1) });
		}

		let verified = status_text.lines().any(|line| {
			let words: Vec<&str> = line.split_whitespace().collect();
			words.len() > 2 && matches!(words[1], "GOODSIG" | "VALIDSIG") && words[2].to_lowercase() == configured_key
		});
		if !verified {
			return Err(Error::VerificationFailed { message: "could not verify GPG signature with configured signing key".into() });
		}

		Ok(NamedTempFileOrPlain::Temp(out_file))
	}
}

/// Unpack reads from either a freshly-decrypted spool file or, when the
/// archive carries no encryption, the input file itself.
enum NamedTempFileOrPlain {
	Temp(NamedTempFile),
	Plain(PathBuf),
}

impl NamedTempFileOrPlain {
	fn path(&self) -> &Path {
		match self {
			Self::Temp(f) => f.path(),
			Self::Plain(p) => p.as_path(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn archive_info_xattr_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("archive.tar");
		std::fs::write(&path, b"some bytes").unwrap();

		let info = ArchiveInfo {
			compression: "gzip".to_string(),
			encryption: "gpg".to_string(),
			sha256: "deadbeef".to_string(),
			size: "some bytes".len() as u64,
		};
		info.to_file(&path).unwrap();

		let read_back = ArchiveInfo::from_file(&path).unwrap();
		assert_eq!(read_back.compression, "gzip");
		assert_eq!(read_back.encryption, "gpg");
		assert_eq!(read_back.sha256, "deadbeef");
		assert_eq!(read_back.size, info.size);
	}

	#[test]
	fn to_file_rejects_size_mismatch() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("archive.tar");
		std::fs::write(&path, b"some bytes").unwrap();

		let info = ArchiveInfo { compression: "none".to_string(), encryption: "none".to_string(), sha256: "abc".to_string(), size: 999 };
		let err = info.to_file(&path).unwrap_err();
		assert!(matches!(err, Error::VerificationFailed { .. }));
	}

	#[test]
	fn compression_label_roundtrips_through_parse() {
		for c in [Compression::Gzip, Compression::Lzop, Compression::None] {
			let label = ArchivePacker::compression_label(c);
			assert_eq!(ArchivePacker::parse_compression(label).unwrap(), c);
		}
	}

	#[test]
	fn parse_compression_rejects_unknown_label() {
		assert!(ArchivePacker::parse_compression("zstd").is_err());
	}

	#[test]
	fn compress_option_is_none_only_for_no_compression() {
		assert_eq!(ArchivePacker::compress_option(Compression::None), None);
		assert!(ArchivePacker::compress_option(Compression::Gzip).is_some());
		assert!(ArchivePacker::compress_option(Compression::Lzop).is_some());
	}
}
