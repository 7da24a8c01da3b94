//! Google Drive-backed archiver: each archive set is a folder under the
//! application's hidden app-data folder, each archive a file tagged with
//! custom properties (the googleapiclient v2 API's per-file key/value
//! store). The original stored OAuth credentials via `oauth2client`'s
//! file-backed token storage with an interactive `auth` subcommand; here
//! a service-account key path takes its place, since `google-drive3`
//! (the `yup-oauth2`-based Rust client) authenticates the same way the
//! rest of this crate's non-interactive backends do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use google_drive3::api::File as DriveFile;
use google_drive3::hyper_rustls::HttpsConnectorBuilder;
use google_drive3::{hyper, hyper_util, yup_oauth2, DriveHub};

use crate::archive::{ArchiveInfo, Archiver, SetMetadata};
use crate::config::ArchiverProfile;
use crate::error::{Error, Result};

/// Google Drive's hard file-size limit is 5TiB; stay well under it to
/// avoid off-by-one surprises near the boundary.
const MAX_FILESIZE: u64 = 4096 << 30;

const PRICING_TIERS: &[(u64, f64)] = &[(15 << 30, 0.0), (100 << 30, 1.99), (1 << 40, 9.99), (10 << 40, 99.99), (20 << 40, 199.99), (30 << 40, 299.99), (u64::MAX, 999.99)];

type Hub = DriveHub<hyper_util::client::legacy::connect::HttpConnector>;

fn gdrive_err(context: &str, e: impl std::fmt::Display) -> Error {
	Error::VerificationFailed { message: format!("{context}: {e}") }
}

pub struct GoogledriveArchiver {
	profile_name: String,
	hub: Hub,
	workers: usize,
	keep_count: usize,
	runtime: tokio::runtime::Handle,
}

impl GoogledriveArchiver {
	pub fn new(profile_name: &str, profile: &ArchiverProfile, runtime: tokio::runtime::Handle) -> Result<Self> {
		let key_path = profile
			.backend
			.get("googledrive-credentials-file")
			.and_then(|v| v.as_str())
			.ok_or_else(|| gdrive_err("config", "googledrive-credentials-file not set"))?
			.to_string();

		let hub = runtime.block_on(async {
			let key = yup_oauth2::read_service_account_key(&key_path).await.map_err(|e| gdrive_err("read service account key", e))?;
			let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
				.build()
				.await
				.map_err(|e| gdrive_err("build authenticator", e))?;
			let connector = HttpsConnectorBuilder::new().with_native_roots().map_err(|e| gdrive_err("tls roots", e))?.https_or_http().enable_http1().enable_http2().build();
			let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);
			Ok::<_, Error>(DriveHub::new(client, auth))
		})?;

		Ok(Self {
			profile_name: profile_name.to_string(),
			hub,
			workers: profile.workers,
			keep_count: profile.keep_count.unwrap_or(1),
			runtime,
		})
	}

	fn list_folder(&self, folder_id: &str, extra_query: Option<&str>) -> Result<Vec<DriveFile>> {
		let mut query = format!("'{folder_id}' in parents and trashed = false");
		if let Some(extra) = extra_query {
			query.push_str(" and ");
			query.push_str(extra);
		}

		let mut files = Vec::new();
		let mut page_token: Option<String> = None;
		loop {
			let mut call = self.hub.files().list().q(&query).param("fields", "nextPageToken, files(id, name, size, createdTime, properties)");
			if let Some(token) = &page_token {
				call = call.page_token(token);
			}
			let (_, result) = self.runtime.block_on(call.doit()).map_err(|e| gdrive_err("files.list", e))?;
			files.extend(result.files.unwrap_or_default());
			page_token = result.next_page_token;
			if page_token.is_none() {
				break;
			}
		}
		Ok(files)
	}

	fn find_set_id(&self, set_name: &str) -> Result<Option<String>> {
		let files = self.list_folder("appDataFolder", Some(&format!("mimeType = 'application/vnd.google-apps.folder' and name = '{set_name}'")))?;
		Ok(files.into_iter().next().and_then(|f| f.id))
	}

	fn properties(file: &DriveFile) -> HashMap<String, String> {
		file.properties.clone().unwrap_or_default()
	}
}

impl Archiver for GoogledriveArchiver {
	fn profile_name(&self) -> &str {
		&self.profile_name
	}
	fn workers(&self) -> usize {
		self.workers
	}
	fn keep_count(&self) -> usize {
		self.keep_count
	}

	fn list_sets(&self) -> Result<HashMap<String, SetMetadata>> {
		let folders = self.list_folder("appDataFolder", Some("mimeType = 'application/vnd.google-apps.folder'"))?;
		let mut sets = HashMap::new();
		for folder in folders {
			let Some(set_name) = folder.name.clone() else { continue };
			let Some(set_id) = folder.id.clone() else { continue };
			let props = Self::properties(&folder);
			let archives = self.list_folder(&set_id, None)?;
			let size: u64 = archives.iter().filter_map(|f| f.size).map(|s| s as u64).sum();
			sets.insert(
				set_name,
				SetMetadata {
					count: archives.len() as u64,
					size,
					complete: props.get("complete").map(String::as_str) == Some("true"),
					protected: false,
				},
			);
		}
		Ok(sets)
	}

	fn complete_set(&self, set_name: &str) -> Result<()> {
		let Some(set_id) = self.find_set_id(set_name)? else { return Ok(()) };
		let mut props = HashMap::new();
		props.insert("complete".to_string(), "true".to_string());
		let update = DriveFile { properties: Some(props), ..Default::default() };
		self.runtime
			.block_on(self.hub.files().update(update, &set_id).add_scope(google_drive3::api::Scope::Full).doit_without_upload())
			.map_err(|e| gdrive_err("files.update", e))?;
		Ok(())
	}

	fn delete_set(&self, set_name: &str) -> Result<()> {
		let Some(set_id) = self.find_set_id(set_name)? else { return Ok(()) };
		for archive in self.list_folder(&set_id, None)? {
			if let Some(id) = archive.id {
				self.runtime.block_on(self.hub.files().delete(&id).doit()).map_err(|e| gdrive_err("files.delete", e))?;
			}
		}
		self.runtime.block_on(self.hub.files().delete(&set_id).doit()).map_err(|e| gdrive_err("files.delete", e))?;
		Ok(())
	}

	fn list_set_archives(&self, set_name: &str) -> Result<HashMap<String, ArchiveInfo>> {
		let Some(set_id) = self.find_set_id(set_name)? else {
			// Create the set folder up front so upload_archive always has
			// somewhere to put the first archive.
			let folder = DriveFile {
				name: Some(set_name.to_string()),
				mime_type: Some("application/vnd.google-apps.folder".to_string()),
				parents: Some(vec!["appDataFolder".to_string()]),
				..Default::default()
			};
			self.runtime.block_on(self.hub.files().create(folder).upload(std::io::Cursor::new(Vec::new()), "application/octet-stream".parse().unwrap())).map_err(|e| gdrive_err("files.create", e))?;
			return Ok(HashMap::new());
		};

		let mut archives = HashMap::new();
		for file in self.list_folder(&set_id, None)? {
			let props = Self::properties(&file);
			if props.get("part").map(String::as_str).unwrap_or("1") != "1" {
				continue; // only the first part carries the reassembled metadata
			}
			let Some(name) = file.name.clone() else { continue };
			archives.insert(
				name,
				ArchiveInfo {
					compression: props.get("compression").cloned().unwrap_or_default(),
					encryption: props.get("encryption").cloned().unwrap_or_default(),
					sha256: props.get("sha256").cloned().unwrap_or_default(),
					size: props.get("size").and_then(|s| s.parse().ok()).or(file.size.map(|s| s as u64)).unwrap_or(0),
				},
			);
		}
		Ok(archives)
	}

	fn upload_archive(&self, set_name: &str, archive_name: &str, metadata: &ArchiveInfo, local_path: &Path) -> Result<()> {
		let Some(set_id) = self.find_set_id(set_name)? else {
			return Err(gdrive_err("upload_archive", format!("set folder for '{set_name}' missing")));
		};

		let size = std::fs::metadata(local_path)?.len();
		let parts = size.div_ceil(MAX_FILESIZE).max(1);
		let data = std::fs::read(local_path)?;

		for part in 0..parts {
			let offset = (part * MAX_FILESIZE) as usize;
			let end = ((part + 1) * MAX_FILESIZE).min(size) as usize;
			let chunk = data[offset..end].to_vec();

			let mut props = HashMap::new();
			props.insert("compression".to_string(), metadata.compression.clone());
			props.insert("encryption".to_string(), metadata.encryption.clone());
			props.insert("sha256".to_string(), metadata.sha256.clone());
			props.insert("size".to_string(), metadata.size.to_string());
			props.insert("part".to_string(), (part + 1).to_string());
			props.insert("parts".to_string(), parts.to_string());

			let body = DriveFile {
				name: Some(archive_name.to_string()),
				mime_type: Some("application/octet-stream".to_string()),
				parents: Some(vec![set_id.clone()]),
				properties: Some(props),
				..Default::default()
			};
			self.runtime
				.block_on(self.hub.files().create(body).upload(std::io::Cursor::new(chunk), "application/octet-stream".parse().unwrap()))
				.map_err(|e| gdrive_err("files.create (upload)", e))?;
		}
		Ok(())
	}

	fn download_archives(&self, set_name: &str, archive_list: &[(String, PathBuf)], _max_rate: Option<u64>) -> Result<Vec<(String, std::result::Result<ArchiveInfo, Error>)>> {
		let Some(set_id) = self.find_set_id(set_name)? else {
			return Ok(archive_list.iter().map(|(name, _)| (name.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such archive set"))))).collect());
		};

		let mut by_name: HashMap<String, Vec<DriveFile>> = HashMap::new();
		for part in self.list_folder(&set_id, None)? {
			let props = Self::properties(&part);
			let n: usize = props.get("part").and_then(|s| s.parse().ok()).unwrap_or(1);
			let m: usize = props.get("parts").and_then(|s| s.parse().ok()).unwrap_or(1);
			let Some(name) = part.name.clone() else { continue };
			let entry = by_name.entry(name).or_default();
			while entry.len() < m {
				entry.push(DriveFile::default());
			}
			entry[n - 1] = part;
		}

		let mut results = Vec::new();
		for (archive_name, path) in archive_list {
			let Some(parts) = by_name.get(archive_name) else {
				results.push((archive_name.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such archive")))));
				continue;
			};
			let outcome = (|| -> Result<ArchiveInfo> {
				let mut out = std::fs::File::create(path)?;
				for part in parts {
					let id = part.id.as_deref().ok_or_else(|| gdrive_err("download", "missing part id"))?;
					let (response, _) = self.runtime.block_on(self.hub.files().get(id).param("alt", "media").doit()).map_err(|e| gdrive_err("files.get (media)", e))?;
					let bytes = self.runtime.block_on(hyper::body::to_bytes(response.into_body())).map_err(|e| gdrive_err("read body", e))?;
					std::io::Write::write_all(&mut out, &bytes)?;
				}
				let props = Self::properties(&parts[0]);
				Ok(ArchiveInfo {
					compression: props.get("compression").cloned().unwrap_or_default(),
					encryption: props.get("encryption").cloned().unwrap_or_default(),
					sha256: props.get("sha256").cloned().unwrap_or_default(),
					size: props.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
				})
			})();
			if let Err(e) = &outcome {
				let _ = e;
				let _ = std::fs::remove_file(path);
			}
			results.push((archive_name.clone(), outcome));
		}
		Ok(results)
	}

	fn resync(&self) -> Result<()> {
		// Drive has no separate metadata ledger to drift from its files;
		// nothing to resynchronize.
		Ok(())
	}

	fn report_cost(&self) -> Result<()> {
		let total_size: u64 = self.list_sets()?.values().map(|m| m.size).sum();
		let (tier, cost) = PRICING_TIERS.iter().find(|(tier, _)| total_size <= *tier).copied().unwrap_or(*PRICING_TIERS.last().unwrap());
		println!(
			"The {} currently in storage requires the {} tier which costs ${cost:.2}/month.",
			crate::util::humanize_size(total_size as f64),
			crate::util::humanize_size(tier as f64),
		);
		Ok(())
	}
}
