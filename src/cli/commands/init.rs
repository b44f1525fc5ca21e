//! Init command implementation.

use crate::cluster::MemberSettings;
use crate::core::config::Config;
use crate::storage::{CommandLog, SnapshotStore};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Initialize a data directory.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Data directory.
    #[arg(short, long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Member id written to the generated config.
    #[arg(long, default_value_t = 1)]
    pub member_id: u64,

    /// Write a config file for this member.
    #[arg(long)]
    pub write_config: Option<PathBuf>,
}

/// Run the init command.
pub fn run_init(args: InitArgs) -> Result<()> {
    let settings = MemberSettings::new(args.member_id, &args.data_dir, vec![args.member_id]);
    std::fs::create_dir_all(settings.cluster_state_dir())
        .with_context(|| format!("failed to create {:?}", settings.cluster_state_dir()))?;
    CommandLog::open(settings.log_dir(), settings.log_rotation_size)
        .context("failed to initialize command log")?;
    SnapshotStore::open(settings.snapshot_dir()).context("failed to initialize snapshot store")?;
    println!("Initialized data directory: {:?}", args.data_dir);

    if let Some(path) = args.write_config {
        let mut config = Config::for_member(args.member_id, args.data_dir.display().to_string());
        config.cluster.initial_members = vec![args.member_id];
        std::fs::write(&path, config.to_toml()?)
            .with_context(|| format!("failed to write {:?}", path))?;
        println!("Wrote config: {:?}", path);
    }

    Ok(())
}
