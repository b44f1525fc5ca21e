//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::MemberRuntime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start a member.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the data directory.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Override the member id.
    #[arg(long)]
    pub member_id: Option<u64>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over the configured level.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}

/// Run the start command with the given config path.
pub async fn run_start(args: StartArgs, config_path: &Path, log_level: Option<String>) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        data_dir: args.data_dir,
        member_id: args.member_id,
    });
    config.validate().context("invalid configuration after overrides")?;

    init_tracing(&config.telemetry.log_level);

    let mut runtime = MemberRuntime::new(config)?;
    runtime.run().await
}
