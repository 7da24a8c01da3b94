//! GitHub organization/repository reconciler (component C8.4.6.5).
//!
//! Git history is mirrored with the external `git` binary via an askpass
//! helper so the token never appears in argv or process listings; issues,
//! milestones, commit comments, and releases are synced through the REST
//! API with conditional (`If-None-Match`) requests so an unchanged
//! resource costs one request instead of a full re-walk.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_NONE_MATCH};
use serde_json::json;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::Unit;
use crate::util::atomic_update::update_file;
use crate::util::bloom::BloomSet;
use crate::util::xattrs::XAttrs;
use crate::util::{gc_directory_tree, make_dir_path, random_do_work};

const ATTR_ETAG: &str = "user.github.etag";
const GIT_ATTEMPTS: u32 = 5;
const USER_AGENT: &str = "deltaic-github/1";
const API_BASE: &str = "https://api.github.com";

pub fn get_relroot(organization: &str, repo: Option<&str>) -> String {
	format!("github/{organization}/{}", repo.unwrap_or("@organization"))
}

pub fn get_units(config: &Config) -> Result<Vec<Unit>> {
	let mut orgs: Vec<_> = config.github.iter().collect();
	orgs.sort_by_key(|(name, _)| (*name).clone());

	let mut units = Vec::new();
	for (org, info) in orgs {
		let mut repos = info.repos.clone();
		repos.sort();

		units.push(unit_for(config, org, None));
		for repo in &repos {
			units.push(unit_for(config, org, Some(repo.as_str())));
		}
	}
	Ok(units)
}

fn unit_for(config: &Config, org: &str, repo: Option<&str>) -> Unit {
	let mut backup_args = vec!["github".to_string(), "backup".to_string(), org.to_string()];
	if let Some(repo) = repo {
		backup_args.push(repo.to_string());
	}
	if random_do_work(config.settings.github_scrub_probability) {
		backup_args.push("-c".to_string());
	}
	Unit {
		root: get_relroot(org, repo),
		backup_args,
	}
}

fn askpass_path() -> PathBuf {
	std::env::current_exe()
		.ok()
		.and_then(|p| p.parent().map(Path::to_path_buf))
		.unwrap_or_default()
		.join("dt-askpass")
}

pub fn update_git(url: &str, root_dir: &Path, token: &str, scrub: bool, ignore_clone_errors: bool, git_path: Option<&str>) -> Result<()> {
	let git = git_path.unwrap_or("git");
	let exists = root_dir.exists();
	let (cmd, cwd): (Vec<String>, Option<&Path>) = if !exists {
		(vec![git.to_string(), "clone".into(), "--mirror".into(), url.into(), root_dir.display().to_string()], None)
	} else {
		(vec![git.to_string(), "remote".into(), "update".into(), "--prune".into()], Some(root_dir))
	};

	let askpass = askpass_path();

	let mut tries_remaining = GIT_ATTEMPTS - 1;
	loop {
		println!("{}", cmd.join(" "));
		let mut command = Command::new(&cmd[0]);
		command.args(&cmd[1..]);
		if let Some(cwd) = cwd {
			command.current_dir(cwd);
		}
		command
			.env("GIT_ASKPASS", &askpass)
			.env("DT_ASKPASS_USER", token)
			.env("DT_ASKPASS_PASS", "");
		let status = command.status()?;
		if status.success() {
			break;
		}
		if ignore_clone_errors && !exists {
			return Ok(());
		}
		if tries_remaining == 0 {
			return Err(Error::SubprocessFailed {
				program: git.to_string(),
				code: status.code().unwrap_or(-1),
			});
		}
		tries_remaining -= 1;
		std::thread::sleep(Duration::from_secs(1));
	}

	if scrub {
		let status = Command::new(git).args(["fsck", "--no-dangling", "--no-progress"]).current_dir(root_dir).status()?;
		if !status.success() {
			return Err(Error::SubprocessFailed {
				program: git.to_string(),
				code: status.code().unwrap_or(-1),
			});
		}
	}
	Ok(())
}

struct GitHubClient {
	http: reqwest::Client,
	token: String,
}

impl GitHubClient {
	fn new(token: &str) -> Self {
		Self {
			http: reqwest::Client::new(),
			token: token.to_string(),
		}
	}

	/// One page of a conditional, paginated GET. The etag xattr on `etag_path`
	/// gates the *first* page only, matching the upstream per-resource ETag
	/// semantics; an unmodified collection short-circuits after page one.
	async fn get_conditional(&self, path: &str, etag_path: &Path, scrub: bool) -> Result<(Vec<serde_json::Value>, bool)> {
		let attrs = XAttrs::new(etag_path);
		let etag = if scrub { None } else { attrs.get(ATTR_ETAG)? };

		let mut items = Vec::new();
		let mut url = format!("{API_BASE}{path}");
		let mut first_page = true;
		let mut skipped = false;
		loop {
			let mut headers = HeaderMap::new();
			if first_page {
				if let Some(etag) = &etag {
					headers.insert(IF_NONE_MATCH, HeaderValue::from_str(etag).unwrap_or(HeaderValue::from_static("")));
				}
			}
			let resp = self
				.http
				.get(&url)
				.bearer_auth(&self.token)
				.header(reqwest::header::USER_AGENT, USER_AGENT)
				.headers(headers)
				.send()
				.await
				.map_err(|e| Error::DumpError { message: e.to_string() })?;

			if first_page && resp.status() == reqwest::StatusCode::NOT_MODIFIED {
				skipped = true;
				break;
			}
			if let Some(new_etag) = resp.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
				if first_page {
					attrs.update(ATTR_ETAG, new_etag)?;
				}
			}
			let next = next_page_url(resp.headers());
			let mut page: Vec<serde_json::Value> = resp.json().await.map_err(|e| Error::DumpError { message: e.to_string() })?;
			items.append(&mut page);
			first_page = false;
			match next {
				Some(n) => url = n,
				None => break,
			}
		}
		Ok((items, skipped))
	}

	async fn get_single(&self, path: &str) -> Result<serde_json::Value> {
		let resp = self
			.http
			.get(format!("{API_BASE}{path}"))
			.bearer_auth(&self.token)
			.header(reqwest::header::USER_AGENT, USER_AGENT)
			.send()
			.await
			.map_err(|e| Error::DumpError { message: e.to_string() })?;
		resp.json().await.map_err(|e| Error::DumpError { message: e.to_string() })
	}
}

fn next_page_url(headers: &HeaderMap) -> Option<String> {
	let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
	for part in link.split(',') {
		let mut segs = part.split(';');
		let url = segs.next()?.trim().trim_start_matches('<').trim_end_matches('>').to_string();
		if segs.any(|s| s.trim() == "rel=\"next\"") {
			return Some(url);
		}
	}
	None
}

fn write_json(path: &Path, info: &serde_json::Value, timestamp: Option<DateTime<Utc>>) -> Result<()> {
	let mut text = serde_json::to_string_pretty(info)?;
	text.push('\n');
	if update_file(path.to_path_buf(), text.as_bytes())? {
		println!("f {}", path.display());
	}
	if let Some(ts) = timestamp {
		crate::util::set_mtime(path, ts.timestamp())?;
	}
	Ok(())
}

fn gc_report(path: &Path, _is_dir: bool) {
	println!("- {}", path.display());
}

async fn update_issues(client: &GitHubClient, org: &str, repo: &str, root_dir: &Path, scrub: bool) -> Result<()> {
	let issue_dir = make_dir_path(root_dir.join("issues"))?;
	let mut valid = BloomSet::new();
	valid.add(issue_dir.to_string_lossy().as_bytes());

	let (issues, skipped) = client.get_conditional(&format!("/repos/{org}/{repo}/issues?state=all&per_page=100"), &issue_dir, scrub).await?;
	for issue in &issues {
		let number = issue["number"].as_i64().unwrap_or(0);
		let path = issue_dir.join(format!("{number}.json"));
		valid.add(path.to_string_lossy().as_bytes());
		write_json(&path, issue, parse_time(&issue["updated_at"]))?;
	}
	if !skipped {
		gc_directory_tree(&issue_dir, |p| valid.contains(p.to_string_lossy().as_bytes()), gc_report)?;
	}

	let milestone_dir = make_dir_path(root_dir.join("milestones"))?;
	let mut valid = BloomSet::new();
	valid.add(milestone_dir.to_string_lossy().as_bytes());
	let (milestones, skipped) = client
		.get_conditional(&format!("/repos/{org}/{repo}/milestones?state=all&per_page=100"), &milestone_dir, scrub)
		.await?;
	for milestone in &milestones {
		let number = milestone["number"].as_i64().unwrap_or(0);
		let path = milestone_dir.join(format!("{number}.json"));
		valid.add(path.to_string_lossy().as_bytes());
		write_json(&path, milestone, parse_time(&milestone["updated_at"]))?;
	}
	if !skipped {
		gc_directory_tree(&milestone_dir, |p| valid.contains(p.to_string_lossy().as_bytes()), gc_report)?;
	}
	Ok(())
}

async fn update_comments(client: &GitHubClient, org: &str, repo: &str, root_dir: &Path, scrub: bool) -> Result<()> {
	let comment_dir = make_dir_path(root_dir.join("comments"))?;
	let mut valid = BloomSet::new();
	valid.add(comment_dir.to_string_lossy().as_bytes());

	let (comments, skipped) = client
		.get_conditional(&format!("/repos/{org}/{repo}/comments?per_page=100"), &comment_dir, scrub)
		.await?;
	if !skipped {
		let mut by_commit: std::collections::BTreeMap<String, Vec<serde_json::Value>> = Default::default();
		let mut timestamps: std::collections::HashMap<String, DateTime<Utc>> = Default::default();
		for comment in comments {
			let commit_id = comment["commit_id"].as_str().unwrap_or_default().to_string();
			if let Some(ts) = parse_time(&comment["updated_at"]) {
				let e = timestamps.entry(commit_id.clone()).or_insert(ts);
				if ts > *e {
					*e = ts;
				}
			}
			by_commit.entry(commit_id).or_default().push(comment);
		}
		for (commit_id, items) in &by_commit {
			let path = comment_dir.join(format!("{commit_id}.json"));
			valid.add(path.to_string_lossy().as_bytes());
			write_json(&path, &json!(items), timestamps.get(commit_id).copied())?;
		}
		gc_directory_tree(&comment_dir, |p| valid.contains(p.to_string_lossy().as_bytes()), gc_report)?;
	}
	Ok(())
}

async fn update_releases(client: &GitHubClient, org: &str, repo: &str, root_dir: &Path, scrub: bool) -> Result<()> {
	let releases_dir = make_dir_path(root_dir.join("releases"))?;
	let mut valid = BloomSet::new();
	valid.add(releases_dir.to_string_lossy().as_bytes());

	let (releases, skipped) = client
		.get_conditional(&format!("/repos/{org}/{repo}/releases?per_page=100"), &releases_dir, scrub)
		.await?;
	for release in &releases {
		let tag = release["tag_name"].as_str();
		let release_dir = match tag {
			Some(tag) if !tag.is_empty() => make_dir_path(releases_dir.join(tag))?,
			_ => make_dir_path(releases_dir.join(format!("untagged-{}", release["id"])))?,
		};
		let metadata_path = release_dir.join("info.json");
		write_json(&metadata_path, release, None)?;
		valid.add(metadata_path.to_string_lossy().as_bytes());

		if let Some(assets) = release["assets"].as_array() {
			if !assets.is_empty() {
				let asset_dir = make_dir_path(release_dir.join("assets"))?;
				for asset in assets {
					let name = asset["name"].as_str().unwrap_or("asset");
					let asset_path = asset_dir.join(name);
					valid.add(asset_path.to_string_lossy().as_bytes());
					let mtime = parse_time(&asset["updated_at"]);
					let size = asset["size"].as_u64();

					let needs_fetch = match (std::fs::metadata(&asset_path), mtime, size) {
						(Ok(st), Some(mtime), Some(size)) => {
							scrub || st.len() != size || st.modified().ok().and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs() as i64) != Some(mtime.timestamp())
						}
						_ => true,
					};
					if needs_fetch {
						let url = asset["browser_download_url"].as_str().unwrap_or_default();
						let bytes = client
							.http
							.get(url)
							.bearer_auth(&client.token)
							.header(reqwest::header::USER_AGENT, USER_AGENT)
							.send()
							.await
							.map_err(|e| Error::DumpError { message: e.to_string() })?
							.bytes()
							.await
							.map_err(|e| Error::DumpError { message: e.to_string() })?;
						if update_file(asset_path.clone(), &bytes)? {
							println!("f {}", asset_path.display());
						}
						if let Some(mtime) = mtime {
							crate::util::set_mtime(&asset_path, mtime.timestamp())?;
						}
						if let Some(content_type) = asset["content_type"].as_str() {
							XAttrs::new(&asset_path).update("user.github.content-type", content_type)?;
						}
					}
				}
			}
		}
	}
	if !skipped {
		gc_directory_tree(&releases_dir, |p| valid.contains(p.to_string_lossy().as_bytes()), gc_report)?;
	}
	Ok(())
}

fn parse_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
	value.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc))
}

pub async fn sync_repo(client: &GitHubClient, org: &str, repo_name: &str, root_dir: &Path, token: &str, scrub: bool, git_path: Option<&str>) -> Result<()> {
	make_dir_path(root_dir)?;
	let repo = client.get_single(&format!("/repos/{org}/{repo_name}")).await?;

	write_json(
		&root_dir.join("info.json"),
		&json!({
			"description": repo["description"],
			"has_issues": repo["has_issues"],
			"has_wiki": repo["has_wiki"],
			"homepage": repo["homepage"],
			"private": repo["private"],
		}),
		None,
	)?;

	let clone_url = repo["clone_url"].as_str().unwrap_or_default();
	update_git(clone_url, &root_dir.join("repo"), token, scrub, false, git_path)?;

	if repo["has_wiki"].as_bool().unwrap_or(false) {
		let wiki_url = clone_url.trim_end_matches(".git").to_string() + ".wiki";
		update_git(&wiki_url, &root_dir.join("wiki"), token, scrub, true, git_path)?;
	}

	if repo["has_issues"].as_bool().unwrap_or(false) {
		update_issues(client, org, repo_name, root_dir, scrub).await?;
	}
	update_comments(client, org, repo_name, root_dir, scrub).await?;
	update_releases(client, org, repo_name, root_dir, scrub).await?;
	Ok(())
}

pub async fn sync_org(client: &GitHubClient, org: &str, root_dir: &Path) -> Result<()> {
	make_dir_path(root_dir)?;
	let teams = client.get_single(&format!("/orgs/{org}/teams")).await?;
	let mut out = serde_json::Map::new();
	if let Some(teams) = teams.as_array() {
		for team in teams {
			let name = team["name"].as_str().unwrap_or_default().to_string();
			let slug = team["slug"].as_str().unwrap_or_default();
			let members = client.get_single(&format!("/orgs/{org}/teams/{slug}/members")).await.unwrap_or(json!([]));
			let repos = client.get_single(&format!("/orgs/{org}/teams/{slug}/repos")).await.unwrap_or(json!([]));
			out.insert(
				name,
				json!({
					"permission": team["permission"],
					"members": members.as_array().map(|a| a.iter().map(|u| u["login"].clone()).collect::<Vec<_>>()),
					"repos": repos.as_array().map(|a| a.iter().map(|r| r["name"].clone()).collect::<Vec<_>>()),
				}),
			);
		}
	}
	write_json(&root_dir.join("teams.json"), &serde_json::Value::Object(out), None)
}

pub async fn list_repos(token: &str, organization: &str) -> Result<Vec<String>> {
	let client = GitHubClient::new(token);
	let (repos, _) = client
		.get_conditional(&format!("/orgs/{organization}/repos?per_page=100"), Path::new("/dev/null"), true)
		.await?;
	let mut names: Vec<String> = repos.into_iter().filter_map(|r| r["name"].as_str().map(str::to_string)).collect();
	names.sort_by_key(|n| n.to_lowercase());
	Ok(names)
}

pub fn backup(config: &Config, organization: &str, repo: Option<&str>, scrub: bool, runtime: &tokio::runtime::Handle) -> Result<()> {
	let info = config.github.get(organization).ok_or_else(|| Error::DumpError {
		message: format!("no manifest entry for organization {organization}"),
	})?;
	let client = GitHubClient::new(&info.token);
	let root = config.settings.root.join(get_relroot(organization, repo));
	match repo {
		Some(repo) => runtime.block_on(sync_repo(&client, organization, repo, &root, &info.token, scrub, None)),
		None => runtime.block_on(sync_org(&client, organization, &root)),
	}
}
