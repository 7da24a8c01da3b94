//! AWS-backed archiver: SimpleDB holds the archive/set metadata ledger,
//! Glacier holds the bytes. The original (boto, Python 2) issued bare
//! SimpleDB `select` strings and conditional `put_attributes` calls
//! directly against the HTTP API; the AWS SDK for Rust exposes the same
//! primitives as typed builders, so the port is close to mechanical.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aws_sdk_glacier as glacier;
use aws_sdk_sdb as sdb;
use chrono::Utc;

use crate::archive::retrieval::DownloadState;
use crate::archive::{ArchiveInfo, Archiver, SetMetadata};
use crate::config::ArchiverProfile;
use crate::error::{Error, Result};

const RETRIEVAL_DELAY_SECS: u64 = 10;
const JOB_CHECK_INTERVAL_SECS: u64 = 60;
const MONTHLY_FREE_RETRIEVAL_FRACTION: f64 = 0.05;
/// Glacier bills early-deletion penalties for archives removed inside 90
/// days; sets younger than that are reported protected so `prune` leaves
/// them alone. One hour of slop for clock skew.
const PROTECTED_PERIOD_SECS: i64 = 90 * 86400 + 3600;

/// Bandwidth ledger item, shared across every instance archiving against
/// this namespace, used to cap retrieval rate under `--max-rate`.
const BANDWIDTH_ITEM: &str = "aws-bandwidth//";
const SLOT_SECONDS: i64 = 3600;
/// A byte requested in slot `h` is assumed to still be in flight through
/// `h + BILLING_HORIZON_SLOTS - 1`.
const BILLING_HORIZON_SLOTS: i64 = 4;
/// Refuse to allocate within this many seconds of a slot boundary, to
/// tolerate clock skew between cooperating instances.
const SLOP_SECONDS: i64 = 120;
const MIN_QUANTUM: u64 = 256 * 1024;

fn backend_str<'a>(profile: &'a ArchiverProfile, key: &str) -> Option<&'a str> {
	profile.backend.get(key).and_then(|v| v.as_str())
}

fn sdb_err(context: &str, e: impl std::fmt::Display) -> Error {
	Error::VerificationFailed { message: format!("{context}: {e}") }
}

pub struct AwsArchiver {
	profile_name: String,
	namespace: String,
	storage_cost: f64,
	sdb: sdb::Client,
	glacier: glacier::Client,
	workers: usize,
	keep_count: usize,
	runtime: tokio::runtime::Handle,
}

impl AwsArchiver {
	pub fn new(profile_name: &str, profile: &ArchiverProfile, runtime: tokio::runtime::Handle) -> Result<Self> {
		let region = backend_str(profile, "aws-region").unwrap_or("us-east-1").to_string();
		let namespace = backend_str(profile, "aws-namespace").ok_or_else(|| sdb_err("config", "aws-namespace not set"))?.to_string();
		let access_key = backend_str(profile, "aws-access-key-id").map(str::to_string);
		let secret_key = backend_str(profile, "aws-secret-access-key").map(str::to_string);
		let storage_cost = profile.backend.get("aws-storage-cost").and_then(|v| v.as_f64()).unwrap_or(0.01);

		let (sdb_client, glacier_client) = runtime.block_on(async {
			let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(aws_config::Region::new(region.clone()));
			if let (Some(ak), Some(sk)) = (access_key.clone(), secret_key.clone()) {
				loader = loader.credentials_provider(aws_credential_types::Credentials::from_keys(ak, sk, None));
			}
			let shared = loader.load().await;
			(sdb::Client::new(&shared), glacier::Client::new(&shared))
		});

		runtime.block_on(sdb_client.create_domain().domain_name(&namespace).send()).map_err(|e| sdb_err("create_domain", e))?;
		runtime.block_on(glacier_client.create_vault().account_id("-").vault_name(&namespace).send()).map_err(|e| sdb_err("create_vault", e))?;

		Ok(Self {
			profile_name: profile_name.to_string(),
			namespace,
			storage_cost,
			sdb: sdb_client,
			glacier: glacier_client,
			workers: profile.workers,
			keep_count: profile.keep_count.unwrap_or(1),
			runtime,
		})
	}

	fn set_item_name(set_name: &str) -> String {
		format!("{set_name}//")
	}

	fn archive_item_name(set_name: &str, archive_name: &str) -> String {
		format!("{set_name}/{archive_name}")
	}

	fn quote(value: &str) -> String {
		value.replace('"', "\"\"")
	}

	fn item_attrs(item: &sdb::types::Item) -> HashMap<String, String> {
		item.attributes().iter().map(|a| (a.name().to_string(), a.value().to_string())).collect()
	}

	fn wait_for_job(&self, job_id: &str) -> Result<()> {
		loop {
			let job = self
				.runtime
				.block_on(self.glacier.describe_job().account_id("-").vault_name(&self.namespace).job_id(job_id).send())
				.map_err(|e| sdb_err("describe_job", e))?;
			if job.completed() {
				return Ok(());
			}
			std::thread::sleep(std::time::Duration::from_secs(JOB_CHECK_INTERVAL_SECS));
		}
	}

	fn lookup_archive_meta(&self, set_name: &str, archive_name: &str) -> Result<Option<(String, u64, HashMap<String, String>)>> {
		let item_name = Self::archive_item_name(set_name, archive_name);
		let item = self.runtime.block_on(self.sdb.get_attributes().domain_name(&self.namespace).item_name(&item_name).consistent_read(true).send()).map_err(|e| sdb_err("get_attributes", e))?;
		let attrs: HashMap<String, String> = item.attributes().iter().map(|a| (a.name().to_string(), a.value().to_string())).collect();
		if attrs.is_empty() {
			return Ok(None);
		}
		let Some(aid) = attrs.get("aws-aid").cloned() else { return Ok(None) };
		let size = attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0);
		Ok(Some((aid, size, attrs)))
	}

	/// Try to claim up to `ceil(remaining / BILLING_HORIZON_SLOTS)` bytes
	/// of this slot's quota against the shared bandwidth ledger, CAS'd on
	/// a serial number so concurrent instances never double-spend.
	/// Returns 0 (no retryable error) when the slot has no quota left, or
	/// when called too close to a slot boundary.
	fn ledger_allocate(&self, max_rate: u64, remaining: u64) -> Result<u64> {
		loop {
			let now = Utc::now().timestamp();
			let into_slot = now.rem_euclid(SLOT_SECONDS);
			if into_slot < SLOP_SECONDS || into_slot > SLOT_SECONDS - SLOP_SECONDS {
				return Ok(0);
			}
			let slot = now / SLOT_SECONDS;

			let item = self
				.runtime
				.block_on(self.sdb.get_attributes().domain_name(&self.namespace).item_name(BANDWIDTH_ITEM).consistent_read(true).send())
				.map_err(|e| sdb_err("get_attributes", e))?;
			let attrs: HashMap<String, String> = item.attributes().iter().map(|a| (a.name().to_string(), a.value().to_string())).collect();
			let serial: u64 = attrs.get("serial").and_then(|s| s.parse().ok()).unwrap_or(0);
			let used: u64 = attrs.get(&format!("bw-{slot}")).and_then(|s| s.parse().ok()).unwrap_or(0);

			let avail = max_rate.saturating_sub(used);
			let size_per_hour = remaining.div_ceil(BILLING_HORIZON_SLOTS as u64);
			let alloc = if avail >= size_per_hour { size_per_hour } else { (avail / MIN_QUANTUM) * MIN_QUANTUM };
			if alloc == 0 {
				return Ok(0);
			}

			let mut put = self.sdb.put_attributes().domain_name(&self.namespace).item_name(BANDWIDTH_ITEM);
			for i in 0..BILLING_HORIZON_SLOTS {
				let key = format!("bw-{}", slot + i);
				let cur: u64 = attrs.get(&key).and_then(|s| s.parse().ok()).unwrap_or(0);
				put = put.attributes(sdb::types::ReplaceableAttribute::builder().name(&key).value((cur + alloc).to_string()).replace(true).build());
			}
			let month_total: u64 = attrs.get("max-bandwidth-month").and_then(|s| s.parse().ok()).unwrap_or(0) + alloc;
			put = put
				.attributes(sdb::types::ReplaceableAttribute::builder().name("max-bandwidth-month").value(month_total.to_string()).replace(true).build())
				.attributes(sdb::types::ReplaceableAttribute::builder().name("serial").value((serial + 1).to_string()).replace(true).build());
			put = if serial == 0 {
				put.expected(sdb::types::UpdateCondition::builder().name("serial").exists(false).build())
			} else {
				put.expected(sdb::types::UpdateCondition::builder().name("serial").value(serial.to_string()).build())
			};

			match self.runtime.block_on(put.send()) {
				Ok(_) => return Ok(alloc),
				Err(e) if e.to_string().contains("ConditionalCheckFailed") => continue,
				Err(e) => return Err(sdb_err("put_attributes", e)),
			}
		}
	}

	/// Rate-limited retrieval used when the caller supplies `--max-rate`:
	/// claims ledger quota one slot at a time, lets Glacier jobs for the
	/// granted byte ranges complete, then advances to the next slot.
	/// Unlike the original's thread-per-job design, completions are
	/// awaited sequentially within a slot; the ledger's own CAS protocol
	/// (not thread concurrency) is what bounds the aggregate rate.
	fn download_archives_throttled(&self, set_name: &str, archive_list: &[(String, PathBuf)], max_rate: u64) -> Result<Vec<(String, std::result::Result<ArchiveInfo, Error>)>> {
		let mut sizes = Vec::new();
		let mut meta: HashMap<String, (String, PathBuf, HashMap<String, String>)> = HashMap::new();
		let mut results = Vec::new();

		for (archive_name, path) in archive_list {
			match self.lookup_archive_meta(set_name, archive_name) {
				Ok(Some((aid, size, attrs))) => {
					sizes.push((archive_name.clone(), size));
					meta.insert(archive_name.clone(), (aid, path.clone(), attrs));
				}
				Ok(None) => results.push((archive_name.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such archive"))))),
				Err(e) => results.push((archive_name.clone(), Err(e))),
			}
		}

		let mut state = DownloadState::new(sizes);
		while !state.done {
			while !state.requests_done {
				let Some(name) = state.name.clone() else { break };
				let remaining = state.remaining;
				let alloc = self.ledger_allocate(max_rate, remaining)?;
				if alloc == 0 {
					break;
				}
				let offset = state.offset;
				let (aid, path, _) = meta.get(&name).expect("tracked item has metadata").clone();
				state.requested(alloc);

				let job = self.runtime.block_on(
					self.glacier
						.initiate_job()
						.account_id("-")
						.vault_name(&self.namespace)
						.job_parameters(
							glacier::types::JobParameters::builder()
								.archive_id(&aid)
								.r#type("archive-retrieval")
								.retrieval_byte_range(format!("{}-{}", offset, offset + alloc - 1))
								.build(),
						)
						.send(),
				);
				let outcome = (|| -> Result<()> {
					let job = job.map_err(|e| sdb_err("initiate_job", e))?;
					let job_id = job.job_id().unwrap_or_default().to_string();
					self.wait_for_job(&job_id)?;
					let output = self.runtime.block_on(self.glacier.get_job_output().account_id("-").vault_name(&self.namespace).job_id(&job_id).send()).map_err(|e| sdb_err("get_job_output", e))?;
					let bytes = self.runtime.block_on(output.body.collect()).map_err(|e| sdb_err("collect body", e))?.into_bytes();
					let mut fh = std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
					fh.seek(SeekFrom::Start(offset))?;
					fh.write_all(&bytes)?;
					Ok(())
				})();

				match outcome {
					Ok(()) => {
						if state.response_processed(&name) {
							let (_, _, attrs) = meta.get(&name).expect("tracked item has metadata");
							results.push((
								name.clone(),
								Ok(ArchiveInfo {
									compression: attrs.get("compression").cloned().unwrap_or_default(),
									encryption: attrs.get("encryption").cloned().unwrap_or_default(),
									sha256: attrs.get("sha256").cloned().unwrap_or_default(),
									size: attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
								}),
							));
						}
					}
					Err(e) => {
						if state.response_failed(&name) {
							results.push((name.clone(), Err(e)));
						}
					}
				}
			}

			if !state.done {
				let into_slot = Utc::now().timestamp().rem_euclid(SLOT_SECONDS);
				let wait = (SLOT_SECONDS - into_slot + SLOP_SECONDS).max(1) as u64;
				std::thread::sleep(std::time::Duration::from_secs(wait.min(JOB_CHECK_INTERVAL_SECS)));
			}
		}
		Ok(results)
	}
}

impl Archiver for AwsArchiver {
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
		let query = format!("select `aws-set`, `aws-complete`, `aws-creation-time`, `size` from `{}`", self.namespace);
		let resp = self
			.runtime
			.block_on(self.sdb.select().select_expression(&query).consistent_read(true).send())
			.map_err(|e| sdb_err("select", e))?;

		let now = Utc::now();
		let mut sets: HashMap<String, SetMetadata> = HashMap::new();
		for item in resp.items() {
			let attrs = Self::item_attrs(item);
			let Some(set_name) = attrs.get("aws-set") else { continue };
			let entry = sets.entry(set_name.clone()).or_default();
			if attrs.contains_key("aws-complete") {
				entry.complete = true;
			}
			if let Some(created) = attrs.get("aws-creation-time").and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) {
				if now.signed_duration_since(created).num_seconds() < PROTECTED_PERIOD_SECS {
					entry.protected = true;
				}
			}
			if let Some(size) = attrs.get("size").and_then(|s| s.parse::<u64>().ok()) {
				entry.count += 1;
				entry.size += size;
			}
		}
		Ok(sets)
	}

	fn complete_set(&self, set_name: &str) -> Result<()> {
		let item_name = Self::set_item_name(set_name);
		self.runtime
			.block_on(
				self.sdb
					.put_attributes()
					.domain_name(&self.namespace)
					.item_name(&item_name)
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-set").value(set_name).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-complete").value("true").replace(true).build())
					.send(),
			)
			.map_err(|e| sdb_err("put_attributes", e))?;
		Ok(())
	}

	fn delete_set(&self, set_name: &str) -> Result<()> {
		let query = format!(
			"select `aws-archive`, `aws-aid` from `{}` where `aws-set` = \"{}\" and `aws-archive` is not null",
			self.namespace,
			Self::quote(set_name)
		);
		let resp = self.runtime.block_on(self.sdb.select().select_expression(&query).consistent_read(true).send()).map_err(|e| sdb_err("select", e))?;

		let mut item_names = vec![Self::set_item_name(set_name)];
		let mut aids = Vec::new();
		for item in resp.items() {
			let attrs = Self::item_attrs(item);
			if let Some(archive_name) = attrs.get("aws-archive") {
				item_names.push(Self::archive_item_name(set_name, archive_name));
			}
			if let Some(aid) = attrs.get("aws-aid") {
				aids.push(aid.clone());
			}
		}

		for item_name in item_names {
			self.runtime.block_on(self.sdb.delete_attributes().domain_name(&self.namespace).item_name(&item_name).send()).map_err(|e| sdb_err("delete_attributes", e))?;
		}
		for aid in aids {
			self.runtime
				.block_on(self.glacier.delete_archive().account_id("-").vault_name(&self.namespace).archive_id(&aid).send())
				.map_err(|e| sdb_err("delete_archive", e))?;
		}
		Ok(())
	}

	fn list_set_archives(&self, set_name: &str) -> Result<HashMap<String, ArchiveInfo>> {
		let query = format!("select * from `{}` where `aws-set` = \"{}\" and `aws-archive` is not null", self.namespace, Self::quote(set_name));
		let resp = self.runtime.block_on(self.sdb.select().select_expression(&query).consistent_read(true).send()).map_err(|e| sdb_err("select", e))?;

		let mut archives = HashMap::new();
		for item in resp.items() {
			let attrs = Self::item_attrs(item);
			let Some(archive_name) = attrs.get("aws-archive").cloned() else { continue };
			archives.insert(
				archive_name,
				ArchiveInfo {
					compression: attrs.get("compression").cloned().unwrap_or_default(),
					encryption: attrs.get("encryption").cloned().unwrap_or_default(),
					sha256: attrs.get("sha256").cloned().unwrap_or_default(),
					size: attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
				},
			);
		}
		Ok(archives)
	}

	fn upload_archive(&self, set_name: &str, archive_name: &str, metadata: &ArchiveInfo, local_path: &Path) -> Result<()> {
		let body = std::fs::read(local_path)?;
		let upload = self
			.runtime
			.block_on(
				self.glacier
					.upload_archive()
					.account_id("-")
					.vault_name(&self.namespace)
					.body(aws_sdk_glacier::primitives::ByteStream::from(body))
					.send(),
			)
			.map_err(|e| sdb_err("upload_archive", e))?;
		let aid = upload.archive_id().unwrap_or_default().to_string();

		let item_name = Self::archive_item_name(set_name, archive_name);
		let put = self
			.runtime
			.block_on(
				self.sdb
					.put_attributes()
					.domain_name(&self.namespace)
					.item_name(&item_name)
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-set").value(set_name).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-archive").value(archive_name).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-aid").value(&aid).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("aws-creation-time").value(Utc::now().to_rfc3339()).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("compression").value(&metadata.compression).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("encryption").value(&metadata.encryption).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("sha256").value(&metadata.sha256).replace(true).build())
					.attributes(sdb::types::ReplaceableAttribute::builder().name("size").value(metadata.size.to_string()).replace(true).build())
					.expected(sdb::types::UpdateCondition::builder().name("aws-aid").exists(false).build())
					.send(),
			);
		if let Err(e) = put {
			// Lost the race against a concurrent uploader, or some other
			// failure: don't leak the Glacier archive either way.
			let _ = self.runtime.block_on(self.glacier.delete_archive().account_id("-").vault_name(&self.namespace).archive_id(&aid).send());
			if e.to_string().contains("ConditionalCheckFailed") {
				return Ok(());
			}
			return Err(sdb_err("put_attributes", e));
		}
		Ok(())
	}

	fn download_archives(&self, set_name: &str, archive_list: &[(String, PathBuf)], max_rate: Option<u64>) -> Result<Vec<(String, std::result::Result<ArchiveInfo, Error>)>> {
		if let Some(rate) = max_rate {
			return self.download_archives_throttled(set_name, archive_list, rate);
		}

		let mut results = Vec::new();
		let mut jobs = Vec::new(); // (archive_name, job_id, path, metadata)
		let mut total_size: u64 = 0;

		for (archive_name, path) in archive_list {
			let item_name = Self::archive_item_name(set_name, archive_name);
			let item = self.runtime.block_on(self.sdb.get_attributes().domain_name(&self.namespace).item_name(&item_name).consistent_read(true).send()).map_err(|e| sdb_err("get_attributes", e))?;
			let attrs: HashMap<String, String> = item.attributes().iter().map(|a| (a.name().to_string(), a.value().to_string())).collect();
			if attrs.is_empty() {
				results.push((archive_name.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such archive")))));
				continue;
			}
			let Some(aid) = attrs.get("aws-aid").cloned() else {
				results.push((archive_name.clone(), Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "archive has no glacier archive id")))));
				continue;
			};
			let size: u64 = attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0);
			total_size += size;
			let job = self.runtime.block_on(self.glacier.initiate_job().account_id("-").vault_name(&self.namespace).job_parameters(glacier::types::JobParameters::builder().archive_id(&aid).r#type("archive-retrieval").build()).send()).map_err(|e| sdb_err("initiate_job", e))?;
			jobs.push((archive_name.clone(), job.job_id().unwrap_or_default().to_string(), path.clone(), attrs));
		}

		if !jobs.is_empty() {
			println!("Going to retrieve {} of data.", crate::util::humanize_size(total_size as f64));
			std::thread::sleep(std::time::Duration::from_secs(RETRIEVAL_DELAY_SECS));
			println!("Retrieving.");
		}

		for (archive_name, job_id, path, attrs) in jobs {
			let outcome = (|| -> Result<ArchiveInfo> {
				self.wait_for_job(&job_id)?;
				let output = self
					.runtime
					.block_on(self.glacier.get_job_output().account_id("-").vault_name(&self.namespace).job_id(&job_id).send())
					.map_err(|e| sdb_err("get_job_output", e))?;
				let bytes = self.runtime.block_on(output.body.collect()).map_err(|e| sdb_err("collect body", e))?.into_bytes();
				std::fs::write(&path, &bytes)?;
				Ok(ArchiveInfo {
					compression: attrs.get("compression").cloned().unwrap_or_default(),
					encryption: attrs.get("encryption").cloned().unwrap_or_default(),
					sha256: attrs.get("sha256").cloned().unwrap_or_default(),
					size: attrs.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
				})
			})();
			results.push((archive_name, outcome));
		}
		Ok(results)
	}

	fn resync(&self) -> Result<()> {
		// Delete Glacier archives with no corresponding SimpleDB metadata.
		let inventory_job = self.runtime.block_on(self.glacier.initiate_job().account_id("-").vault_name(&self.namespace).job_parameters(glacier::types::JobParameters::builder().r#type("inventory-retrieval").build()).send()).map_err(|e| sdb_err("initiate_job", e))?;
		let job_id = inventory_job.job_id().unwrap_or_default().to_string();
		self.wait_for_job(&job_id)?;
		let output = self.runtime.block_on(self.glacier.get_job_output().account_id("-").vault_name(&self.namespace).job_id(&job_id).send()).map_err(|e| sdb_err("get_job_output", e))?;
		let bytes = self.runtime.block_on(output.body.collect()).map_err(|e| sdb_err("collect inventory", e))?.into_bytes();
		let inventory: serde_json::Value = serde_json::from_slice(&bytes)?;

		let mut vault_archives: HashMap<String, u64> = HashMap::new();
		if let Some(list) = inventory.get("ArchiveList").and_then(|v| v.as_array()) {
			for archive in list {
				if let (Some(id), Some(size)) = (archive.get("ArchiveId").and_then(|v| v.as_str()), archive.get("Size").and_then(|v| v.as_u64())) {
					vault_archives.insert(id.to_string(), size);
				}
			}
		}

		let query = format!("select `aws-aid` from `{}` where `aws-aid` is not null", self.namespace);
		let resp = self.runtime.block_on(self.sdb.select().select_expression(&query).consistent_read(true).send()).map_err(|e| sdb_err("select", e))?;
		for item in resp.items() {
			for attr in item.attributes() {
				if attr.name() == "aws-aid" {
					vault_archives.remove(attr.value());
				}
			}
		}

		let leaked_count = vault_archives.len();
		let leaked_bytes: u64 = vault_archives.values().sum();
		for aid in vault_archives.keys() {
			self.runtime.block_on(self.glacier.delete_archive().account_id("-").vault_name(&self.namespace).archive_id(aid).send()).map_err(|e| sdb_err("delete_archive", e))?;
		}
		if leaked_count > 0 {
			println!("Deleted {leaked_count} leaked archives, {leaked_bytes} bytes");
		}
		Ok(())
	}

	fn report_cost(&self) -> Result<()> {
		let total_size: u64 = self.list_sets()?.values().map(|m| m.size).sum();
		let now = Utc::now();
		let days_in_month = days_in_month(now.year(), now.month());
		let storage_cost = (total_size as f64 / (1u64 << 30) as f64) * self.storage_cost;
		let free_transfer = total_size as f64 * MONTHLY_FREE_RETRIEVAL_FRACTION / days_in_month as f64;
		let transfer_cost_gb = self.storage_cost * days_in_month as f64 * 24.0;

		println!(
			"The {} currently in storage costs ${storage_cost:.2}/month.\n\n\
			 You can retrieve around {} for free today. If you retrieve more than\n\
			 that, you must carefully watch your retrieval rate. Each additional GB/hour\n\
			 will cost ${transfer_cost_gb:.2}, but is then available for the whole month at no additional\n\
			 charge.",
			crate::util::humanize_size(total_size as f64),
			crate::util::humanize_size(free_transfer),
		);
		Ok(())
	}
}

fn days_in_month(year: i32, month: u32) -> u32 {
	use chrono::{Datelike, NaiveDate};
	let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
	NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap().pred_opt().unwrap().day()
}

use chrono::Datelike;
