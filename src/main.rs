//! Lineage - unified CLI entrypoint.
//!
//! Usage:
//!   lineage start --config config/lineage.toml
//!   lineage init --data-dir data --write-config config/lineage.toml
//!   lineage config validate --config config/lineage.toml
//!   lineage identity show [--data-dir DIR]
//!   lineage snapshot list [--data-dir DIR]
//!   lineage snapshot inspect <snapshot-file>
//!   lineage log inspect [--data-dir DIR] [--tail N]

use anyhow::Result;
use clap::Parser;
use lineage::cli::commands::{
    init_tracing, run_config, run_identity, run_init, run_log, run_snapshot, run_start,
};
use lineage::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/lineage.toml"));

    if !matches!(cli.command, Commands::Start(_)) {
        init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
    }

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, cli.log_level).await,
        Commands::Init(args) => run_init(args),
        Commands::Config(args) => run_config(args),
        Commands::Identity(args) => run_identity(args, &config_path),
        Commands::Snapshot(args) => run_snapshot(args, &config_path),
        Commands::Log(args) => run_log(args, &config_path),
    }
}
