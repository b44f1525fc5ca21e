//! Command-line interface.
//!
//! Unified CLI for Lineage operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Lineage - cluster identity, join admission and snapshot catch-up.
#[derive(Parser, Debug)]
#[command(name = "lineage")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a member.
    Start(commands::StartArgs),
    /// Initialize a data directory and configuration.
    Init(commands::InitArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Inspect or clear the persisted identity.
    Identity(commands::IdentityArgs),
    /// Snapshot operations.
    Snapshot(commands::SnapshotArgs),
    /// Command log operations.
    Log(commands::LogArgs),
}
