//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/lineage.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/lineage.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Environment (dev, prod).
        #[arg(long, default_value = "dev")]
        env: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output, env } => generate_config(output.as_deref(), &env),
    }
}

fn validate_config(path: &PathBuf) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Config file is valid");

    if config.cluster.initial_members.is_empty() {
        println!("  ⚠ Warning: cluster.initial_members is empty; this member can only join");
    } else if !config
        .cluster
        .initial_members
        .contains(&config.member.member_id)
    {
        println!(
            "  ⚠ Warning: member {} is not an initial member; it will join through admission",
            config.member.member_id
        );
    }
    if config.cluster.initial_members.len() % 2 == 0 && !config.cluster.initial_members.is_empty() {
        println!("  ⚠ Warning: an even number of initial members tolerates no extra failure");
    }

    println!("✓ Configuration validation complete");
    Ok(())
}

fn show_config(path: &PathBuf, format: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", config.to_toml()?),
    }
    Ok(())
}

fn generate_config(output: Option<&std::path::Path>, env: &str) -> Result<()> {
    let template = match env {
        "prod" | "production" => generate_prod_template(),
        _ => generate_dev_template(),
    };

    match output {
        Some(path) => {
            std::fs::write(path, &template)?;
            println!("Generated {} config template: {:?}", env, path);
        }
        None => {
            println!("{}", template);
        }
    }

    Ok(())
}

fn generate_dev_template() -> String {
    r#"# Lineage Development Configuration

[member]
member_id = 1
data_dir = "data"

[cluster]
initial_members = [1]
commit_timeout_ms = 5000
join_retry_backoff_ms = 500
startup_timeout_ms = 30000

[pruning]
strategy = "10000 entries"
log_rotation_size = "250K"
interval_ms = 10000

[snapshot]
chunk_size_bytes = 65536
transfer_retries = 5
retry_backoff_ms = 200
keep_snapshots = 2

[telemetry]
log_level = "debug"
"#
    .to_string()
}

fn generate_prod_template() -> String {
    r#"# Lineage Production Configuration

[member]
member_id = 1
data_dir = "/var/lib/lineage"

[cluster]
initial_members = [1, 2, 3]
commit_timeout_ms = 5000
join_retry_backoff_ms = 1000
startup_timeout_ms = 120000

[pruning]
strategy = "1G size"
log_rotation_size = "250M"
interval_ms = 60000

[snapshot]
chunk_size_bytes = 1048576
transfer_retries = 10
retry_backoff_ms = 1000
keep_snapshots = 3

[telemetry]
log_level = "info"
"#
    .to_string()
}
