//! Snapshot command implementation.

use super::{format_ms, resolve_data_dir};
use crate::cluster::MemberSettings;
use crate::storage::{SnapshotHandle, SnapshotStore};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Snapshot operations.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommand,
}

/// Snapshot subcommands.
#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// List available snapshots, newest first.
    List {
        /// Data directory (defaults to the config's).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Verify and describe a snapshot file.
    Inspect {
        /// Snapshot path.
        path: PathBuf,
    },
}

/// Run the snapshot command.
pub fn run_snapshot(args: SnapshotArgs, config_path: &Path) -> Result<()> {
    match args.command {
        SnapshotCommand::List { data_dir } => list_snapshots(data_dir, config_path),
        SnapshotCommand::Inspect { path } => inspect_snapshot(&path),
    }
}

fn list_snapshots(data_dir: Option<PathBuf>, config_path: &Path) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir, config_path)?;
    let settings = MemberSettings::new(0, data_dir, Vec::new());
    let store = SnapshotStore::open(settings.snapshot_dir())
        .with_context(|| format!("failed to open {:?}", settings.snapshot_dir()))?;

    let snapshots = store.list();
    if snapshots.is_empty() {
        println!("No snapshots in {:?}", store.dir());
        return Ok(());
    }

    println!("{:<40} {:>12} {:>12}  created", "id", "position", "bytes");
    for meta in snapshots {
        println!(
            "{:<40} {:>12} {:>12}  {}",
            meta.id,
            meta.position.to_string(),
            meta.size_bytes,
            format_ms(meta.created_at_ms)
        );
    }
    Ok(())
}

fn inspect_snapshot(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let handle = SnapshotHandle::decode(&bytes)
        .with_context(|| format!("invalid snapshot {:?}", path))?;
    let meta = &handle.meta;

    println!("Snapshot: {:?}", path);
    println!("  id:         {}", meta.id);
    println!("  position:   {}", meta.position);
    println!("  cluster_id: {}", meta.cluster_id);
    println!("  store_id:   {}", meta.store_id);
    println!("  created_at: {}", format_ms(meta.created_at_ms));
    println!("  state:      {} bytes (xxh64 {:016x}, verified)", meta.size_bytes, meta.checksum);
    println!("  members:    {:?}", handle.membership);
    Ok(())
}
