//! Consensus seam.
//!
//! Leader election and log replication are provided by an external
//! consensus engine. Lineage consumes it through [`ConsensusEngine`]: an
//! ordered, majority-committed command log plus the roster, the current
//! leader and per-member applied progress.
//!
//! # Modules
//!
//! - [`memory`] - In-process engine shared by simulated members

pub mod memory;

pub use memory::InMemoryConsensus;

use crate::core::error::ConsensusError;
use crate::identity::IdentityPair;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Member identifier, unique within a roster.
pub type MemberId = u64;

/// Position in the replicated log.
///
/// Ordered by index, then term.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Log index (1-based; 0 means nothing applied).
    pub index: u64,
    /// Term the entry was committed in.
    pub term: u64,
}

impl LogPosition {
    /// The position before the first entry.
    pub const ZERO: Self = Self { index: 0, term: 0 };

    pub const fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }

    /// Check if this position is at or after the given index.
    pub const fn covers(&self, index: u64) -> bool {
        self.index >= index
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

/// Replicated commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Establish the cluster identity. Must be the first committed command.
    SeedIdentity {
        pair: IdentityPair,
        initial_members: Vec<MemberId>,
    },
    /// Admit a member to the roster.
    AddMember { member_id: MemberId },
    /// Remove a member from the roster.
    RemoveMember { member_id: MemberId },
    /// A state-machine write.
    Data { key: Vec<u8>, value: Vec<u8> },
    /// No-op (leader change marker).
    Noop,
}

impl Command {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SeedIdentity { .. } => "seed_identity",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::Data { .. } => "data",
            Self::Noop => "noop",
        }
    }

    /// Create a data command.
    pub fn data(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A committed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: LogPosition,
    pub command: Command,
}

impl LogEntry {
    pub fn new(position: LogPosition, command: Command) -> Self {
        Self { position, command }
    }

    /// Entry index.
    pub fn index(&self) -> u64 {
        self.position.index
    }
}

/// Operations consumed from the consensus engine.
pub trait ConsensusEngine: Send + Sync {
    /// Propose a command and wait up to `timeout` for majority commit.
    fn propose(
        &self,
        proposer: MemberId,
        command: Command,
        timeout: Duration,
    ) -> Result<LogPosition, ConsensusError>;

    /// Committed entries starting at `from_index`.
    ///
    /// Fails with [`ConsensusError::Compacted`] when `from_index` was pruned.
    fn committed_entries(
        &self,
        from_index: u64,
        max_entries: usize,
    ) -> Result<Vec<LogEntry>, ConsensusError>;

    /// Oldest index still held in the log.
    fn first_retained_index(&self) -> u64;

    /// Position of the newest committed entry.
    fn last_position(&self) -> LogPosition;

    /// Current leader, if a majority is reachable.
    fn leader(&self) -> Option<MemberId>;

    /// Voting members.
    fn roster(&self) -> Vec<MemberId>;

    /// Record a member's applied position.
    fn report_applied(&self, member: MemberId, position: LogPosition);

    /// Last reported applied position per member.
    fn applied_positions(&self) -> BTreeMap<MemberId, LogPosition>;

    /// Discard committed entries up to and including `index`.
    fn compact_to(&self, index: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_position_ordering() {
        assert!(LogPosition::new(2, 1) > LogPosition::new(1, 5));
        assert!(LogPosition::new(2, 2) > LogPosition::new(2, 1));
        assert_eq!(LogPosition::default(), LogPosition::ZERO);
        assert!(LogPosition::new(5, 1).covers(5));
        assert!(!LogPosition::new(4, 1).covers(5));
    }

    #[test]
    fn test_command_kind() {
        assert_eq!(Command::data("k", "v").kind(), "data");
        assert_eq!(Command::AddMember { member_id: 1 }.kind(), "add_member");
    }
}
