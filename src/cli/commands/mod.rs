//! CLI command implementations.

mod config;
mod identity;
mod init;
mod log;
mod snapshot;
mod start;

pub use config::{run_config, ConfigArgs};
pub use identity::{run_identity, IdentityArgs};
pub use init::{run_init, InitArgs};
pub use log::{run_log, LogArgs};
pub use snapshot::{run_snapshot, SnapshotArgs};
pub use start::{init_tracing, run_start, StartArgs};

use crate::core::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Data directory from an explicit flag, else from the config file.
pub(crate) fn resolve_data_dir(explicit: Option<PathBuf>, config_path: &Path) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    Ok(config.data_dir())
}

/// Render milliseconds since the epoch as RFC 3339.
pub(crate) fn format_ms(ms: u64) -> String {
    use chrono::TimeZone;

    chrono::Utc
        .timestamp_millis_opt(ms as i64)
        .single()
        .map_or_else(|| format!("{ms}ms"), |t| t.to_rfc3339())
}
