//! Log pruning.
//!
//! Pruning discards a prefix of the command log. Entries up to the newest
//! durable snapshot are reconstructible from that snapshot, so the prune
//! target never passes it. When the configured strategy wants to discard
//! more than the snapshot covers, a fresh snapshot is taken first.
//!
//! # Retention watermark
//!
//! The watermark is the lowest index every admitted member has applied. A
//! prune that passes the watermark is only safe when a snapshot at or beyond
//! the pruned prefix exists; members below it then catch up by snapshot.
//!
//! # Strategies
//!
//! | strategy      | keeps                                   |
//! |---------------|-----------------------------------------|
//! | `keep_all`    | everything                              |
//! | `keep_none`   | only the active segment                 |
//! | `N entries`   | at least the newest N entries           |
//! | `N files`     | at least the newest N segments          |
//! | `N size`      | at least N bytes of newest segments     |
//!
//! Pruning is advisory. A failed segment deletion is logged and retried on
//! the next cycle.

use super::membership::MembershipView;
use crate::storage::{LogLayout, PrunableLog, PruneReport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// How much of the log to retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PruningStrategy {
    KeepAll,
    KeepNone,
    Entries(u64),
    Files(usize),
    Size(u64),
}

impl Default for PruningStrategy {
    fn default() -> Self {
        Self::Size(1024 * 1024 * 1024)
    }
}

impl PruningStrategy {
    /// Highest index the strategy allows to discard, if any.
    pub fn prune_bound(&self, layout: &LogLayout) -> Option<u64> {
        let bound = match *self {
            Self::KeepAll => return None,
            Self::KeepNone => layout.last_index,
            Self::Entries(n) => layout.last_index.saturating_sub(n),
            Self::Files(n) => {
                let keep = n.max(1);
                let len = layout.segments.len();
                if len <= keep {
                    return None;
                }
                layout.segments[len - keep - 1].last_index
            }
            Self::Size(bytes) => {
                let mut kept = 0u64;
                let mut bound = None;
                for segment in layout.segments.iter().rev() {
                    if kept >= bytes {
                        bound = Some(segment.last_index);
                        break;
                    }
                    kept += segment.size_bytes;
                }
                bound?
            }
        };
        (bound >= layout.first_index).then_some(bound)
    }
}

impl std::fmt::Display for PruningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepAll => write!(f, "keep_all"),
            Self::KeepNone => write!(f, "keep_none"),
            Self::Entries(n) => write!(f, "{n} entries"),
            Self::Files(n) => write!(f, "{n} files"),
            Self::Size(n) => write!(f, "{n} size"),
        }
    }
}

impl std::str::FromStr for PruningStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "keep_all" | "true" => return Ok(Self::KeepAll),
            "keep_none" | "false" => return Ok(Self::KeepNone),
            _ => {}
        }

        let (amount, unit) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("invalid pruning strategy: {s:?}"))?;
        match unit.trim().to_ascii_lowercase().as_str() {
            "entries" | "txs" => amount
                .parse()
                .map(Self::Entries)
                .map_err(|_| format!("invalid entry count: {amount:?}")),
            "files" => amount
                .parse()
                .map(Self::Files)
                .map_err(|_| format!("invalid file count: {amount:?}")),
            "size" => parse_byte_size(amount).map(Self::Size),
            other => Err(format!("unknown pruning unit: {other:?}")),
        }
    }
}

impl TryFrom<String> for PruningStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PruningStrategy> for String {
    fn from(value: PruningStrategy) -> Self {
        value.to_string()
    }
}

/// Parse a byte size with an optional `K`, `M` or `G` suffix (powers of 1024).
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid byte size: {s:?}"))
}

/// Sealed segments, excluding the active one, lying entirely at or below `index`.
fn removable_segments(layout: &LogLayout, index: u64) -> usize {
    let sealed = layout.segments.len().saturating_sub(1);
    layout.segments[..sealed]
        .iter()
        .take_while(|segment| segment.last_index <= index)
        .count()
}

/// A prune that has been checked against snapshot coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneDecision {
    /// Lowest index applied by every admitted member.
    pub watermark: u64,
    /// Newest durable snapshot index.
    pub snapshot_index: u64,
    /// Discard entries up to and including this index.
    pub prune_through: u64,
}

impl PruneDecision {
    /// The retained log must start no later than just after the snapshot,
    /// unless every admitted member has already applied the pruned prefix.
    pub fn is_safe(&self, view: &MembershipView) -> bool {
        self.prune_through <= self.snapshot_index || view.all_applied(self.prune_through)
    }
}

/// What one planning pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrunePlan {
    /// Nothing to do this cycle.
    Skip { reason: &'static str },
    /// A snapshot at or beyond the watermark must exist before pruning.
    SnapshotFirst { watermark: u64 },
    /// Prune as decided.
    Prune(PruneDecision),
}

/// Prune statistics.
#[derive(Debug, Clone, Default)]
pub struct PruneStats {
    pub cycles: u64,
    pub failures: u64,
    pub snapshots_requested: u64,
    pub segments_removed: u64,
    pub last_watermark: u64,
}

/// Plans and executes log prunes.
#[derive(Debug)]
pub struct PruneCoordinator {
    strategy: PruningStrategy,
    cycles: AtomicU64,
    failures: AtomicU64,
    snapshots_requested: AtomicU64,
    segments_removed: AtomicU64,
    last_watermark: AtomicU64,
}

impl PruneCoordinator {
    pub fn new(strategy: PruningStrategy) -> Self {
        Self {
            strategy,
            cycles: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            snapshots_requested: AtomicU64::new(0),
            segments_removed: AtomicU64::new(0),
            last_watermark: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> PruningStrategy {
        self.strategy
    }

    /// Decide what may be pruned given a consistent membership view, the
    /// newest durable snapshot and the local log layout.
    pub fn plan(
        &self,
        view: &MembershipView,
        newest_snapshot_index: Option<u64>,
        layout: &LogLayout,
    ) -> PrunePlan {
        let Some(watermark) = view.retention_watermark() else {
            return PrunePlan::Skip {
                reason: "no admitted members",
            };
        };
        self.last_watermark.store(watermark, Ordering::Release);

        let Some(bound) = self.strategy.prune_bound(layout) else {
            return PrunePlan::Skip {
                reason: "strategy retains the whole log",
            };
        };

        if removable_segments(layout, bound) == 0 {
            return PrunePlan::Skip {
                reason: "no sealed segment below the prune bound",
            };
        }

        let snapshot_index = newest_snapshot_index.unwrap_or(0);
        if removable_segments(layout, bound.min(snapshot_index)) < removable_segments(layout, bound)
        {
            self.snapshots_requested.fetch_add(1, Ordering::Relaxed);
            return PrunePlan::SnapshotFirst { watermark };
        }

        let decision = PruneDecision {
            watermark,
            snapshot_index,
            prune_through: bound.min(snapshot_index),
        };
        if decision.prune_through < watermark {
            tracing::trace!(
                watermark,
                prune_through = decision.prune_through,
                "prune stays below watermark"
            );
        }
        PrunePlan::Prune(decision)
    }

    /// Run a planned prune against the log.
    ///
    /// Storage failures are logged and counted, never returned.
    pub fn execute(
        &self,
        decision: &PruneDecision,
        log: &mut dyn PrunableLog,
    ) -> Option<PruneReport> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match log.prune_through(decision.prune_through) {
            Ok(report) => {
                self.segments_removed
                    .fetch_add(report.segments_removed as u64, Ordering::Relaxed);
                tracing::info!(
                    watermark = decision.watermark,
                    snapshot_index = decision.snapshot_index,
                    prune_through = decision.prune_through,
                    segments_removed = report.segments_removed,
                    first_index = report.first_index,
                    "log pruned"
                );
                Some(report)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    prune_through = decision.prune_through,
                    "log prune failed, will retry next cycle"
                );
                None
            }
        }
    }

    pub fn stats(&self) -> PruneStats {
        PruneStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            snapshots_requested: self.snapshots_requested.load(Ordering::Relaxed),
            segments_removed: self.segments_removed.load(Ordering::Relaxed),
            last_watermark: self.last_watermark.load(Ordering::Acquire),
        }
    }
}
