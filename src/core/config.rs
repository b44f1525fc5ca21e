//! Configuration parsing and validation.
//!
//! Lineage configuration is loaded from TOML files with CLI overrides.
//! Sections follow the member's components: identity location, bootstrap
//! and join timing, log pruning, snapshot transfer and telemetry.

use crate::cluster::prune::parse_byte_size;
use crate::cluster::{CatchupSettings, MemberSettings, PruningStrategy};
use crate::consensus::MemberId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level Lineage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This member.
    pub member: MemberConfig,

    /// Bootstrap and join settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Log pruning.
    #[serde(default)]
    pub pruning: PruningConfig,

    /// Snapshot transfer and retention.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Member configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Member identifier, unique within the cluster.
    pub member_id: MemberId,

    /// Directory holding the identity record, log and snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Bootstrap and join configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Members that bootstrap the cluster together.
    #[serde(default)]
    pub initial_members: Vec<MemberId>,

    /// How long to wait for a proposal to commit.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    /// Delay between join or seed attempts.
    #[serde(default = "default_join_retry_backoff_ms")]
    pub join_retry_backoff_ms: u64,

    /// How long startup keeps retrying seed or join before giving up.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            initial_members: Vec::new(),
            commit_timeout_ms: default_commit_timeout_ms(),
            join_retry_backoff_ms: default_join_retry_backoff_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

/// Log pruning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Strategy: "keep_all", "keep_none", "N entries", "N files" or "N size".
    #[serde(default = "default_pruning_strategy")]
    pub strategy: String,

    /// Segment size before the log rotates (e.g. "250K").
    #[serde(default = "default_log_rotation_size")]
    pub log_rotation_size: String,

    /// Interval between prune cycles.
    #[serde(default = "default_prune_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            strategy: default_pruning_strategy(),
            log_rotation_size: default_log_rotation_size(),
            interval_ms: default_prune_interval_ms(),
        }
    }
}

/// Snapshot transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Bytes fetched per chunk.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,

    /// Rounds over the peer list before giving up.
    #[serde(default = "default_transfer_retries")]
    pub transfer_retries: u32,

    /// Delay between rounds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Snapshots kept on disk after a prune.
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size_bytes(),
            transfer_retries: default_transfer_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            keep_snapshots: default_keep_snapshots(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_commit_timeout_ms() -> u64 {
    5_000
}

fn default_join_retry_backoff_ms() -> u64 {
    500
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_pruning_strategy() -> String {
    "1G size".to_string()
}

fn default_log_rotation_size() -> String {
    "250K".to_string()
}

fn default_prune_interval_ms() -> u64 {
    10_000
}

fn default_chunk_size_bytes() -> usize {
    64 * 1024
}

fn default_transfer_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_keep_snapshots() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for one member with every other setting at
    /// its default.
    pub fn for_member(member_id: MemberId, data_dir: impl Into<String>) -> Self {
        Self {
            member: MemberConfig {
                member_id,
                data_dir: data_dir.into(),
            },
            cluster: ClusterConfig::default(),
            pruning: PruningConfig::default(),
            snapshot: SnapshotConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "failed to serialize config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.member.data_dir = data_dir.clone();
        }
        if let Some(member_id) = overrides.member_id {
            self.member.member_id = member_id;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_member()?;
        self.validate_cluster()?;
        self.validate_pruning()?;
        self.validate_snapshot()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_member(&self) -> Result<()> {
        if self.member.data_dir.trim().is_empty() {
            anyhow::bail!("member.data_dir must not be empty");
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.commit_timeout_ms == 0 {
            anyhow::bail!("cluster.commit_timeout_ms must be > 0");
        }
        if self.cluster.startup_timeout_ms < self.cluster.commit_timeout_ms {
            anyhow::bail!(
                "cluster.startup_timeout_ms ({}) cannot be less than cluster.commit_timeout_ms ({})",
                self.cluster.startup_timeout_ms,
                self.cluster.commit_timeout_ms
            );
        }

        let mut seen = std::collections::HashSet::new();
        for id in &self.cluster.initial_members {
            if !seen.insert(id) {
                anyhow::bail!("cluster.initial_members lists member {} twice", id);
            }
        }
        Ok(())
    }

    fn validate_pruning(&self) -> Result<()> {
        self.pruning_strategy()?;
        let rotation = self.log_rotation_size()?;
        if rotation == 0 {
            anyhow::bail!("pruning.log_rotation_size must be > 0");
        }
        if self.pruning.interval_ms == 0 {
            anyhow::bail!("pruning.interval_ms must be > 0");
        }
        Ok(())
    }

    fn validate_snapshot(&self) -> Result<()> {
        if self.snapshot.chunk_size_bytes == 0 {
            anyhow::bail!("snapshot.chunk_size_bytes must be > 0");
        }
        if self.snapshot.transfer_retries == 0 {
            anyhow::bail!("snapshot.transfer_retries must be > 0");
        }
        // Catch-up needs at least one snapshot to serve.
        if self.snapshot.keep_snapshots == 0 {
            anyhow::bail!("snapshot.keep_snapshots must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Parsed pruning strategy.
    pub fn pruning_strategy(&self) -> Result<PruningStrategy> {
        self.pruning
            .strategy
            .parse()
            .map_err(|e: String| anyhow::anyhow!("pruning.strategy: {}", e))
    }

    /// Parsed segment rotation size in bytes.
    pub fn log_rotation_size(&self) -> Result<u64> {
        parse_byte_size(&self.pruning.log_rotation_size)
            .map_err(|e| anyhow::anyhow!("pruning.log_rotation_size: {}", e))
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.member.data_dir)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.startup_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.pruning.interval_ms)
    }

    /// Settings for [`crate::cluster::Member::open`].
    pub fn member_settings(&self) -> Result<MemberSettings> {
        let mut settings = MemberSettings::new(
            self.member.member_id,
            self.data_dir(),
            self.cluster.initial_members.clone(),
        );
        settings.commit_timeout = Duration::from_millis(self.cluster.commit_timeout_ms);
        settings.join_retry_backoff = Duration::from_millis(self.cluster.join_retry_backoff_ms);
        settings.pruning_strategy = self.pruning_strategy()?;
        settings.log_rotation_size = self.log_rotation_size()?;
        settings.keep_snapshots = self.snapshot.keep_snapshots;
        settings.catchup = CatchupSettings {
            chunk_size: self.snapshot.chunk_size_bytes,
            transfer_retries: self.snapshot.transfer_retries,
            retry_backoff: Duration::from_millis(self.snapshot.retry_backoff_ms),
        };
        Ok(settings)
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override data directory.
    pub data_dir: Option<String>,
    /// Override member id.
    pub member_id: Option<MemberId>,
}
