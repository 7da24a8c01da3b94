//! `deltaic ls`: list snapshots in the local registry.

use clap::Parser;
use miette::{IntoDiagnostic, Result};

use crate::actions::Context;
use crate::storage::PhysicalSnapshot;

#[derive(Debug, Clone, Parser)]
pub struct LsArgs {}

pub async fn run(_ctx: Context<crate::args::Args, LsArgs>) -> Result<()> {
	for snapshot in PhysicalSnapshot::list().into_diagnostic()? {
		println!("{}", snapshot.name());
	}
	Ok(())
}
