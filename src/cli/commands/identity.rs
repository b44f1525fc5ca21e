//! Identity command implementation.

use super::{format_ms, resolve_data_dir};
use crate::cluster::MemberSettings;
use crate::identity::{FileIdentityStore, IdentityStore};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Inspect or clear the persisted identity.
#[derive(Args, Debug)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub command: IdentityCommand,
}

/// Identity subcommands.
#[derive(Subcommand, Debug)]
pub enum IdentityCommand {
    /// Show the persisted identity record.
    Show {
        /// Data directory (defaults to the config's).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove the persisted identity so the member can rejoin as new.
    Clear {
        /// Data directory (defaults to the config's).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Confirm removal.
        #[arg(long)]
        yes: bool,
    },
}

/// Run the identity command.
pub fn run_identity(args: IdentityArgs, config_path: &Path) -> Result<()> {
    match args.command {
        IdentityCommand::Show { data_dir, json } => {
            let store = open_store(data_dir, config_path)?;
            show_identity(&store, json)
        }
        IdentityCommand::Clear { data_dir, yes } => {
            if !yes {
                anyhow::bail!("refusing to clear identity without --yes");
            }
            let store = open_store(data_dir, config_path)?;
            store.clear().context("failed to clear identity")?;
            println!("Cleared identity: {:?}", store.path());
            Ok(())
        }
    }
}

fn open_store(data_dir: Option<PathBuf>, config_path: &Path) -> Result<FileIdentityStore> {
    let data_dir = resolve_data_dir(data_dir, config_path)?;
    let settings = MemberSettings::new(0, data_dir, Vec::new());
    Ok(FileIdentityStore::in_dir(settings.cluster_state_dir()))
}

fn show_identity(store: &FileIdentityStore, json: bool) -> Result<()> {
    let record = store
        .load()
        .with_context(|| format!("failed to read {:?}", store.path()))?;

    let Some(record) = record else {
        println!("No identity at {:?} (unbootstrapped)", store.path());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Identity: {:?}", store.path());
        println!("  cluster_id: {}", record.cluster_id);
        println!("  store_id:   {}", record.store_id);
        println!("  phase:      {}", record.phase);
        println!("  written_at: {}", format_ms(record.written_at_ms));
        println!(
            "  created_at: {}",
            format_ms(record.store_id.creation_timestamp)
        );
    }
    Ok(())
}
