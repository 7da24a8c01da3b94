//! `deltaic archive`: offsite archiving subcommands, all scoped to one
//! manifest-configured archiver profile (`-p/--profile`, default
//! `default`), matching the original's `archive` Click group.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use crate::actions::{load_config, Context};
use crate::archive::{self, packer::ArchivePacker, Archive, SnapshotArchiveSet};
use crate::storage::{PhysicalSnapshot, Snapshot};
use crate::util::lock;

#[derive(Debug, Clone, Parser)]
pub struct ArchiveArgs {
	/// Archiver profile
	#[arg(short, long, default_value = "default")]
	pub profile: String,
	#[command(subcommand)]
	pub action: ArchiveAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ArchiveAction {
	/// Create and upload an offsite archive for every unit
	///
	/// Archives the latest snapshot unless SNAPSHOT is given.
	Run {
		/// Resume a previous incomplete run
		#[arg(short, long)]
		resume: bool,
		snapshot: Option<String>,
	},
	/// Calculate storage costs
	Cost,
	/// List existing offsite archives, or archive SET if given
	Ls {
		/// List archive sets instead of individual archives
		#[arg(short, long)]
		sets: bool,
		set: Option<String>,
	},
	/// Download offsite archives to the specified directory
	Retrieve {
		/// Maximum retrieval rate, in (possibly fractional) GiB/hour
		#[arg(short = 'r', long)]
		max_rate: Option<f64>,
		snapshot: String,
		destdir: PathBuf,
		unit: Vec<String>,
	},
	/// Unpack downloaded archives to the specified directory
	///
	/// To avoid repeated passphrase prompts, ensure gpg-agent is running.
	Unpack { destdir: PathBuf, file: Vec<PathBuf> },
	/// Delete old offsite archives
	Prune,
	/// Resynchronize index with data
	Resync,
	/// Low-level: upload a single offsite archive
	///
	/// MOUNTPOINT is the current mountpoint of the specified snapshot.
	Unit { snapshot: String, mountpoint: PathBuf, unit: String },
}

pub async fn run(ctx: Context<crate::args::Args, ArchiveArgs>) -> Result<()> {
	let config = load_config(&ctx.args_top)?;
	let profile_name = ctx.args_sub.profile.clone();
	let runtime = tokio::runtime::Handle::current();

	match ctx.args_sub.action {
		ArchiveAction::Run { resume, snapshot } => {
			if snapshot.is_some() && resume {
				return Err(miette::miette!("cannot specify snapshot with --resume"));
			}
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime.clone())).into_diagnostic()?;

			let chosen = if let Some(name) = snapshot {
				let physical = PhysicalSnapshot::list().into_diagnostic()?.into_iter().find(|s| s.name() == name).ok_or_else(|| miette::miette!("no such snapshot"))?;
				println!("Archiving selected snapshot {}", physical.name());
				physical
			} else if resume {
				let sets = tokio::task::block_in_place(|| SnapshotArchiveSet::list(archiver.as_ref())).into_diagnostic()?;
				let last = sets.last().ok_or_else(|| miette::miette!("no archive sets exist yet"))?;
				if last.complete {
					return Err(miette::miette!("{} already completely archived", last.snapshot.name));
				}
				let name = last.snapshot.name.clone();
				println!("Resuming archive of snapshot {name}");
				PhysicalSnapshot::list().into_diagnostic()?.into_iter().find(|s| s.name() == name).ok_or_else(|| miette::miette!("no such snapshot"))?
			} else {
				let physical = PhysicalSnapshot::list().into_diagnostic()?.into_iter().last().ok_or_else(|| miette::miette!("no snapshots exist yet"))?;
				println!("Archiving snapshot {}", physical.name());
				physical
			};

			let _lock = lock::acquire(&config.settings.root, "archive").into_diagnostic()?;
			let ok = tokio::task::block_in_place(|| archive::archive_snapshot(&config, archiver.as_ref(), &chosen)).into_diagnostic()?;
			if !ok {
				eprintln!("Archiving failed for some units.  Not marking archive set complete.");
				eprintln!("Use \"deltaic archive run -r\" to resume.");
				std::process::exit(1);
			}
			Ok(())
		}
		ArchiveAction::Cost => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			tokio::task::block_in_place(|| archiver.report_cost()).into_diagnostic()
		}
		ArchiveAction::Ls { sets, set } => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			let archive_sets = tokio::task::block_in_place(|| SnapshotArchiveSet::list(archiver.as_ref())).into_diagnostic()?;
			for archive_set in &archive_sets {
				if let Some(want) = &set {
					if want != &archive_set.snapshot.name {
						continue;
					}
				}
				if sets {
					println!(
						"{} {:>5} {:>10}  {} {}",
						archive_set.snapshot.name,
						archive_set.count,
						crate::util::humanize_size(archive_set.size as f64),
						if archive_set.complete { "  complete" } else { "incomplete" },
						if archive_set.protected { "protected" } else { "" },
					);
				} else {
					let mut archives: Vec<_> = tokio::task::block_in_place(|| archive_set.get_archives()).into_diagnostic()?.into_iter().collect();
					archives.sort_by(|a, b| a.0.cmp(&b.0));
					for (_, archive) in archives {
						println!("{} {:>10} {}", archive.snapshot_name, crate::util::humanize_size(archive.size as f64), archive.unit_name);
					}
				}
			}
			Ok(())
		}
		ArchiveAction::Retrieve { max_rate, snapshot, destdir, unit } => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			let set = SnapshotArchiveSet::new(archiver.as_ref(), Snapshot::parse(&snapshot).into_diagnostic()?);
			let archives: Vec<Archive> = unit.iter().map(|u| set.get_archive(u)).collect();
			let max_rate_bytes = max_rate.map(|gib_per_hour| (gib_per_hour * (1u64 << 30) as f64) as u64);

			std::fs::create_dir_all(&destdir).into_diagnostic()?;
			let results = tokio::task::block_in_place(|| set.retrieve_archives(&destdir, &archives, max_rate_bytes));

			let mut failed = false;
			for (archive, result) in results {
				match result {
					Ok(_) => println!("{}", archive.unit_name),
					Err(e) => {
						eprintln!("{}: {e}", archive.unit_name);
						failed = true;
					}
				}
			}
			if failed {
				std::process::exit(1);
			}
			Ok(())
		}
		ArchiveAction::Unpack { destdir, file } => {
			let profile = config.archivers.get(&profile_name).ok_or_else(|| miette::miette!("archive profile '{profile_name}' not found"))?;
			let packer = ArchivePacker::new(&config.settings, profile);
			std::fs::create_dir_all(&destdir).into_diagnostic()?;
			for path in file {
				packer.unpack(&path, &destdir).into_diagnostic()?;
			}
			Ok(())
		}
		ArchiveAction::Prune => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			tokio::task::block_in_place(|| archive::prune_archives(archiver.as_ref())).into_diagnostic()
		}
		ArchiveAction::Resync => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			tokio::task::block_in_place(|| archiver.resync()).into_diagnostic()
		}
		ArchiveAction::Unit { snapshot, mountpoint, unit } => {
			let archiver = tokio::task::block_in_place(|| archive::get_archiver(&config, &profile_name, runtime)).into_diagnostic()?;
			let set = SnapshotArchiveSet::new(archiver.as_ref(), Snapshot::parse(&snapshot).into_diagnostic()?);
			let archive = set.get_archive(&unit);
			tokio::task::block_in_place(|| archive::archive_unit(&config, archiver.as_ref(), &archive, &mountpoint)).into_diagnostic()
		}
	}
}
