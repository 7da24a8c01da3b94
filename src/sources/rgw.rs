//! Object-store reconciler for Ceph RGW buckets (component C8.4.6.4).
//!
//! Keys are mirrored into a directory tree where every path component
//! carries a one-character type code (`_d` directory, `_k` object data,
//! `_m` object metadata, `_a` object ACL) so that object names containing
//! characters the filesystem can't represent unambiguously (trailing
//! slashes, `.`/`..` segments) round-trip safely. Two sentinel paths,
//! `bucket_A`/`bucket_C`, hold the bucket's own ACL and CORS policy.
//!
//! Upstream ACL/CORS documents are XML on the wire; the S3 SDK used here
//! exposes them as structured grants rather than raw XML, so they are
//! persisted as their JSON serialization instead of a byte-exact copy.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::Unit;
use crate::util::atomic_update::{update_file, UpdateFile};
use crate::util::bloom::BloomSet;
use crate::util::{gc_directory_tree, make_dir_path, random_do_work};

const SCRUB_NONE: u8 = 0;
const SCRUB_ACLS: u8 = 1;
const SCRUB_ALL: u8 = 2;

pub fn get_relroot(bucket: &str) -> String {
	format!("rgw/{bucket}")
}

pub fn get_units(config: &Config) -> Result<Vec<Unit>> {
	let mut names: Vec<&String> = config.rgw.keys().collect();
	names.sort();

	let mut units = Vec::new();
	for name in names {
		let mut backup_args = vec!["rgw".to_string(), "backup".to_string(), name.clone()];
		if random_do_work(config.settings.rgw_scrub_acl_probability) {
			backup_args.push("-A".to_string());
		}
		if random_do_work(config.settings.rgw_scrub_probability) {
			backup_args.push("-c".to_string());
		}
		units.push(Unit {
			root: get_relroot(name),
			backup_args,
		});
	}
	Ok(units)
}

fn radosgw_admin(args: &[&str]) -> Result<serde_json::Value> {
	let mut cmd = vec!["radosgw-admin".to_string(), "--format=json".to_string()];
	cmd.extend(args.iter().map(|s| s.to_string()));
	let output = Command::new(&cmd[0]).args(&cmd[1..]).output()?;
	if !output.status.success() {
		return Err(Error::SubprocessFailed {
			program: "radosgw-admin".into(),
			code: output.status.code().unwrap_or(-1),
		});
	}
	Ok(serde_json::from_slice(&output.stdout)?)
}

struct Credentials {
	access_key: String,
	secret_key: String,
}

fn get_user_credentials(userid: &str) -> Result<Credentials> {
	let info = radosgw_admin(&["user", "info", "--uid", userid])?;
	let key = &info["keys"][0];
	Ok(Credentials {
		access_key: key["access_key"].as_str().unwrap_or_default().to_string(),
		secret_key: key["secret_key"].as_str().unwrap_or_default().to_string(),
	})
}

fn get_bucket_credentials(bucket_name: &str) -> Result<Credentials> {
	let info = radosgw_admin(&["bucket", "stats", "--bucket", bucket_name])?;
	let owner = info["owner"].as_str().ok_or_else(|| Error::DumpError {
		message: format!("no owner reported for bucket {bucket_name}"),
	})?;
	get_user_credentials(owner)
}

async fn connect(server: &str, secure: bool, creds: Credentials) -> aws_sdk_s3::Client {
	let scheme = if secure { "https" } else { "http" };
	let endpoint = format!("{scheme}://{server}");
	let credentials = aws_credential_types::Credentials::new(creds.access_key, creds.secret_key, None, None, "radosgw");
	let config = aws_sdk_s3::config::Builder::new()
		.endpoint_url(endpoint)
		.region(aws_sdk_s3::config::Region::new("default"))
		.credentials_provider(credentials)
		.force_path_style(true)
		.behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
		.build();
	aws_sdk_s3::Client::from_conf(config)
}

fn add_type_code(path: &str, code: char) -> String {
	format!("{path}_{code}")
}

fn split_type_code(path: &str) -> Result<(String, char)> {
	let bytes = path.as_bytes();
	if bytes.len() < 2 || bytes[bytes.len() - 2] != b'_' {
		return Err(Error::DumpError {
			message: format!("path has no type code: {path}"),
		});
	}
	let code = bytes[bytes.len() - 1] as char;
	Ok((path[..path.len() - 2].to_string(), code))
}

fn key_name_to_path(root_dir: &Path, key_name: &str, type_code: char) -> PathBuf {
	let mut parts: Vec<&str> = key_name.split('/').collect();
	let filename = parts.pop().unwrap_or("");
	let mut out = root_dir.to_path_buf();
	for component in parts {
		out.push(add_type_code(component, 'd'));
	}
	out.push(add_type_code(filename, type_code));
	out
}

fn path_to_key_name(root_dir: &Path, path: &Path) -> Result<String> {
	let relpath = path.strip_prefix(root_dir).unwrap_or(path);
	let components: Vec<&str> = relpath.to_str().unwrap_or_default().split('/').collect();
	let mut out = Vec::new();
	for component in &components[..components.len().saturating_sub(1)] {
		let (name, code) = split_type_code(component)?;
		if code != 'd' {
			return Err(Error::DumpError {
				message: format!("path element missing directory type code: {name}"),
			});
		}
		out.push(name);
	}
	if let Some(last) = components.last() {
		let (name, _) = split_type_code(last)?;
		out.push(name);
	}
	Ok(out.join("/"))
}

fn enumerate_keys_from_directory(root_dir: &Path) -> Result<Vec<String>> {
	let mut out = Vec::new();
	walk_for_keys(root_dir, root_dir, &mut out)?;
	out.sort();
	Ok(out)
}

fn walk_for_keys(root_dir: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
	if !dir.is_dir() {
		return Ok(());
	}
	let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
	entries.sort_by_key(|e| e.file_name());
	for entry in entries {
		let path = entry.path();
		if entry.file_type()?.is_dir() {
			walk_for_keys(root_dir, &path, out)?;
		} else {
			let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
			match split_type_code(name) {
				Ok((_, 'k')) => out.push(path_to_key_name(root_dir, &path)?),
				_ => continue,
			}
		}
	}
	Ok(())
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct KeyMetadata {
	metadata: std::collections::HashMap<String, String>,
	#[serde(flatten)]
	headers: std::collections::HashMap<String, String>,
}

struct ObjectListing {
	key: String,
	size: i64,
	last_modified: DateTime<Utc>,
}

async fn sync_key(
	client: &aws_sdk_s3::Client,
	bucket: &str,
	listing: &ObjectListing,
	root_dir: &Path,
	scrub: u8,
) -> (Option<String>, Option<String>) {
	let out_data = key_name_to_path(root_dir, &listing.key, 'k');
	let out_meta = key_name_to_path(root_dir, &listing.key, 'm');
	let out_acl = key_name_to_path(root_dir, &listing.key, 'a');
	let out_dir = out_data.parent().map(Path::to_path_buf).unwrap_or_default();

	let update_data = match std::fs::metadata(&out_data) {
		Ok(st) => {
			scrub == SCRUB_ALL
				|| st.len() as i64 != listing.size
				|| st.modified().ok().and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs() as i64)
					!= Some(listing.last_modified.timestamp())
		}
		Err(_) => true,
	};

	if !update_data && scrub == SCRUB_NONE {
		return (None, None);
	}

	if let Err(e) = make_dir_path(&out_dir) {
		return (Some(listing.key.clone()), Some(format!("couldn't create {}: {e}", out_dir.display())));
	}

	let result: Result<bool> = async {
		let mut updated = false;
		if update_data {
			let object = client.get_object().bucket(bucket).key(&listing.key).send().await.map_err(|e| Error::DumpError {
				message: e.to_string(),
			})?;
			let content_type = object.content_type().map(|s| s.to_string());
			let body = object.body.collect().await.map_err(|e| Error::DumpError { message: e.to_string() })?.into_bytes();

			let mut fh = UpdateFile::with_options(&out_data, crate::util::TEMPFILE_PREFIX, "_t", 256 << 10)?;
			use std::io::Write;
			fh.write_all(&body)?;
			updated |= fh.finish()?;

			let meta = KeyMetadata {
				metadata: Default::default(),
				headers: content_type.into_iter().map(|v| ("content-type".to_string(), v)).collect(),
			};
			let json = serde_json::to_string_pretty(&meta).unwrap_or_default();
			updated |= update_file(out_meta.clone(), json.as_bytes())?;
		}

		let acl = client.get_object_acl().bucket(bucket).key(&listing.key).send().await.map_err(|e| Error::DumpError {
			message: e.to_string(),
		})?;
		let acl_json = serde_json::to_string_pretty(&format!("{:?}", acl.grants())).unwrap_or_default();
		updated |= update_file(out_acl.clone(), acl_json.as_bytes())?;

		if update_data {
			for path in [&out_data, &out_meta] {
				let target = filetime_from(listing.last_modified);
				crate::util::set_mtime(path, target).ok();
			}
		}
		Ok(updated)
	}
	.await;

	match result {
		Ok(true) => (Some(listing.key.clone()), None),
		Ok(false) => (None, None),
		Err(e) => {
			for path in [&out_data, &out_meta, &out_acl] {
				let _ = std::fs::remove_file(path);
			}
			(Some(listing.key.clone()), Some(format!("couldn't fetch {}: {e}", listing.key)))
		}
	}
}

fn filetime_from(dt: DateTime<Utc>) -> i64 {
	dt.timestamp()
}

pub async fn sync_bucket(server: &str, bucket_name: &str, root_dir: &Path, workers: usize, scrub: u8, secure: bool) -> Result<bool> {
	let mut ok = true;

	let creds = get_bucket_credentials(bucket_name)?;
	let client = connect(server, secure, creds).await;

	make_dir_path(root_dir)?;

	let mut key_set = BloomSet::new();
	let mut listings = Vec::new();
	let mut continuation: Option<String> = None;
	loop {
		let mut req = client.list_objects_v2().bucket(bucket_name);
		if let Some(token) = &continuation {
			req = req.continuation_token(token);
		}
		let resp = req.send().await.map_err(|e| Error::DumpError { message: e.to_string() })?;
		for obj in resp.contents() {
			if let Some(key) = obj.key() {
				key_set.add(key);
				listings.push(ObjectListing {
					key: key.to_string(),
					size: obj.size().unwrap_or(0),
					last_modified: obj
						.last_modified()
						.and_then(|d| DateTime::from_timestamp(d.secs(), 0))
						.unwrap_or_else(Utc::now),
				});
			}
		}
		if resp.is_truncated().unwrap_or(false) {
			continuation = resp.next_continuation_token().map(|s| s.to_string());
		} else {
			break;
		}
	}

	let semaphore = Arc::new(Semaphore::new(workers.max(1)));
	let client = Arc::new(client);
	let root_dir = Arc::new(root_dir.to_path_buf());
	let mut tasks = tokio::task::JoinSet::new();
	for listing in listings {
		let permit = Arc::clone(&semaphore);
		let client = Arc::clone(&client);
		let root_dir = Arc::clone(&root_dir);
		let bucket_name = bucket_name.to_string();
		tasks.spawn(async move {
			let _permit = permit.acquire_owned().await.unwrap();
			sync_key(&client, &bucket_name, &listing, &root_dir, scrub).await
		});
	}
	while let Some(res) = tasks.join_next().await {
		if let Ok((path, error)) = res {
			if let Some(error) = error {
				eprintln!("{error}");
				ok = false;
			} else if let Some(path) = path {
				println!("{path}");
			}
		}
	}

	let bucket_acl = client.get_bucket_acl().bucket(bucket_name).send().await.map_err(|e| Error::DumpError { message: e.to_string() })?;
	update_file(
		key_name_to_path(root_dir.as_ref(), "bucket", 'A'),
		serde_json::to_string_pretty(&format!("{:?}", bucket_acl.grants())).unwrap_or_default().as_bytes(),
	)?;

	let cors_path = key_name_to_path(root_dir.as_ref(), "bucket", 'C');
	match client.get_bucket_cors().bucket(bucket_name).send().await {
		Ok(cors) => {
			update_file(
				cors_path,
				serde_json::to_string_pretty(&format!("{:?}", cors.cors_rules())).unwrap_or_default().as_bytes(),
			)?;
		}
		Err(_) => {
			let _ = std::fs::remove_file(&cors_path);
		}
	}

	let start_time = chrono::Utc::now().timestamp();
	gc_directory_tree(root_dir.as_ref(), |p| is_valid_path(root_dir.as_ref(), p, &key_set), |p, _| {
		println!("Deleting {}", p.display());
		if let Ok(meta) = std::fs::metadata(p) {
			use std::os::unix::fs::MetadataExt;
			if meta.mtime() > start_time {
				eprintln!("Warning: deleting file that we just created: {}", p.display());
			}
		}
	})?;

	Ok(ok)
}

fn is_valid_path(root_dir: &Path, path: &Path, key_set: &BloomSet) -> bool {
	let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
	match split_type_code(name) {
		Ok((_, 'A')) | Ok((_, 'C')) => true,
		Ok((_, 't')) => false,
		Ok(_) => match path_to_key_name(root_dir, path) {
			Ok(key_name) => key_set.contains(key_name),
			Err(_) => false,
		},
		Err(_) => false,
	}
}

async fn upload_key(client: &aws_sdk_s3::Client, bucket: &str, root_dir: &Path, key_name: &str) -> Result<()> {
	let in_data = key_name_to_path(root_dir, key_name, 'k');
	let in_meta = key_name_to_path(root_dir, key_name, 'm');

	let meta: KeyMetadata = serde_json::from_slice(&std::fs::read(&in_meta)?)?;
	let body = std::fs::read(&in_data)?;

	let mut req = client.put_object().bucket(bucket).key(key_name).body(body.into());
	for (k, v) in &meta.metadata {
		req = req.metadata(k, v);
	}
	if let Some(ct) = meta.headers.get("content-type") {
		req = req.content_type(ct);
	}
	req.send().await.map_err(|e| Error::DumpError { message: format!("couldn't upload {key_name}: {e}") })?;
	Ok(())
}

pub async fn restore_bucket(root_dir: &Path, server: &str, dest_bucket_name: &str, secure: bool, owner: &str) -> Result<()> {
	let creds = get_user_credentials(owner)?;
	let client = connect(server, secure, creds).await;

	let key_names = enumerate_keys_from_directory(root_dir)?;
	for key_name in key_names {
		upload_key(&client, dest_bucket_name, root_dir, &key_name).await?;
		println!("{key_name}");
	}
	Ok(())
}

pub fn backup(
	config: &Config,
	bucket: &str,
	scrub_acls: bool,
	scrub: bool,
	runtime: &tokio::runtime::Handle,
) -> Result<()> {
	let settings = &config.settings;
	let root_dir = settings.root.join(get_relroot(bucket));
	let server = settings.rgw_server.as_deref().ok_or_else(|| Error::DumpError {
		message: "rgw-server not configured".into(),
	})?;
	let scrub_level = if scrub {
		SCRUB_ALL
	} else if scrub_acls {
		SCRUB_ACLS
	} else {
		SCRUB_NONE
	};
	let ok = runtime.block_on(sync_bucket(server, bucket, &root_dir, settings.rgw_threads, scrub_level, settings.rgw_secure))?;
	if !ok {
		return Err(Error::VerificationFailed {
			message: format!("bucket {bucket} sync reported warnings"),
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_nested_key_names() {
		let root = Path::new("/root");
		let path = key_name_to_path(root, "a/b/c.txt", 'k');
		assert_eq!(path, root.join("a_d").join("b_d").join("c.txt_k"));
		assert_eq!(path_to_key_name(root, &path).unwrap(), "a/b/c.txt");
	}

	#[test]
	fn rejects_path_without_type_code() {
		assert!(split_type_code("noop").is_err());
	}
}
