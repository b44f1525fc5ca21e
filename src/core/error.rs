//! Error types and failure classification.
//!
//! Every failure a member can observe falls into one of three classes:
//!
//! - **Transient**: awaiting bootstrap, snapshot transfer failures, commit
//!   timeouts. Callers retry with backoff.
//! - **FatalToMember**: identity mismatch on join, snapshot identity mismatch,
//!   local persistence failure. The member stops participating and the
//!   operator has to intervene.
//! - **ProtocolViolation**: conflicting committed seeds, pruning past an
//!   uncovered position. The member stops and logs enough state to diagnose.

use crate::consensus::{LogPosition, MemberId};
use crate::identity::StoreIdentity;
use thiserror::Error;

/// Which half of the identity pair diverged from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchField {
    /// The persisted cluster identity belongs to a different cluster.
    Cluster,
    /// The persisted store identity belongs to a different storage lineage.
    Store,
}

impl std::fmt::Display for MismatchField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster_identity"),
            Self::Store => write!(f, "store_identity"),
        }
    }
}

/// Failure class used by callers to pick retry vs. abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Stop this member; requires operator action.
    FatalToMember,
    /// Internal invariant breach; stop this member.
    ProtocolViolation,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::FatalToMember => write!(f, "fatal"),
            Self::ProtocolViolation => write!(f, "protocol_violation"),
        }
    }
}

/// Identity record persistence failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying I/O failure.
    #[error("identity store I/O failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The record on disk is not a complete, valid identity record.
    #[error("identity record at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// Payload encoding failure.
    #[error("identity record encoding failed: {0}")]
    Encoding(String),
}

/// Local storage failures (command log, snapshots, engine).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("storage I/O failure ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding failure.
    #[error("storage codec failure ({context}): {message}")]
    Codec { context: String, message: String },

    /// Appended entry does not follow the previous one.
    #[error("non-contiguous append: expected index {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },

    /// Snapshot not found locally.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// Snapshot payload failed its checksum.
    #[error("snapshot {id} checksum mismatch: expected {expected:016x}, computed {actual:016x}")]
    ChecksumMismatch { id: String, expected: u64, actual: u64 },

    /// The storage engine has no lineage yet.
    #[error("storage engine has no lineage")]
    NoLineage,
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn codec(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Codec {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

/// Consensus collaborator failures.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No majority commit before the deadline.
    #[error("commit timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Requested entries were pruned from the log.
    #[error("log compacted: first retained index is {first_retained}")]
    Compacted { first_retained: u64 },

    /// No leader is currently reachable.
    #[error("no leader available")]
    NoLeader,
}

/// Peer transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer is not reachable.
    #[error("peer {0} unreachable")]
    Unreachable(MemberId),

    /// Connection dropped mid-stream.
    #[error("transfer from peer {peer} interrupted at offset {offset}")]
    Interrupted { peer: MemberId, offset: u64 },

    /// The peer could not serve the request.
    #[error("peer {peer} failed: {message}")]
    Remote { peer: MemberId, message: String },
}

/// Top-level error for member operations.
#[derive(Debug, Error)]
pub enum LineageError {
    /// Identity record could not be persisted or read.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Local storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Consensus collaborator failure.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The cluster has not established an identity yet.
    #[error("AwaitingBootstrap: cluster identity not yet established")]
    AwaitingBootstrap,

    /// Join rejected because the candidate holds foreign or stale data.
    ///
    /// Remedy: remove the member's local state before rejoining.
    #[error("IdentityMismatch: persisted {field} differs from the cluster; remove local state before rejoining")]
    IdentityMismatch { field: MismatchField },

    /// A snapshot carried a different store lineage than the cluster.
    #[error("snapshot store identity {found} does not match cluster store identity {expected}")]
    SnapshotIdentityMismatch {
        expected: StoreIdentity,
        found: StoreIdentity,
    },

    /// A seeding attempt after a seed was already committed.
    #[error("seeding rejected: {reason}")]
    SeedRejected { reason: String },

    /// An internal invariant was breached.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// The member stopped earlier and refuses further work.
    #[error("member {member_id} stopped: {reason}")]
    MemberStopped { member_id: MemberId, reason: String },

    /// Snapshot catch-up could not obtain a snapshot covering the position.
    #[error("no snapshot covering index {required} available after {attempts} attempts")]
    SnapshotUnavailable { required: u64, attempts: u32 },

    /// The member's applied position moved backwards.
    #[error("applied position regressed from {current} to {proposed}")]
    PositionRegressed {
        current: LogPosition,
        proposed: LogPosition,
    },
}

impl LineageError {
    /// Create a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AwaitingBootstrap
            | Self::Consensus(_)
            | Self::Transport(_)
            | Self::SnapshotUnavailable { .. } => ErrorClass::Transient,
            Self::Persistence(_)
            | Self::Storage(_)
            | Self::IdentityMismatch { .. }
            | Self::SnapshotIdentityMismatch { .. }
            | Self::SeedRejected { .. }
            | Self::MemberStopped { .. } => ErrorClass::FatalToMember,
            Self::ProtocolViolation { .. } | Self::PositionRegressed { .. } => {
                ErrorClass::ProtocolViolation
            }
        }
    }

    /// Check if the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error must stop the member.
    pub fn stops_member(&self) -> bool {
        !self.is_retriable()
    }
}

/// Result type using LineageError.
pub type LineageResult<T> = Result<T, LineageError>;

/// Why a member failed to start or join.
///
/// Identity mismatches are surfaced on their own so operators can tell
/// "wipe this member" apart from "try again later".
#[derive(Debug, Error)]
pub enum StartupError {
    /// The member's persisted identity does not match the cluster.
    #[error("IdentityMismatch: persisted {field} differs from the cluster; remove local state before rejoining")]
    IdentityMismatch { field: MismatchField },

    /// Startup could not complete yet; retry with backoff.
    #[error("startup incomplete: {0}")]
    Transient(#[source] LineageError),

    /// The member cannot start without operator action.
    #[error("member cannot start: {0}")]
    Fatal(#[source] LineageError),
}

impl StartupError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_identity_mismatch(&self) -> bool {
        matches!(self, Self::IdentityMismatch { .. })
    }
}

impl From<LineageError> for StartupError {
    fn from(err: LineageError) -> Self {
        match err {
            LineageError::IdentityMismatch { field } => Self::IdentityMismatch { field },
            err if err.is_retriable() => Self::Transient(err),
            err => Self::Fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LineageError::AwaitingBootstrap.is_retriable());
        assert!(LineageError::from(ConsensusError::Timeout { timeout_ms: 10 }).is_retriable());
        assert!(LineageError::from(TransportError::Unreachable(3)).is_retriable());
    }

    #[test]
    fn test_fatal_classification() {
        let err = LineageError::IdentityMismatch {
            field: MismatchField::Store,
        };
        assert_eq!(err.class(), ErrorClass::FatalToMember);
        assert!(err.stops_member());
        assert!(err.to_string().starts_with("IdentityMismatch"));

        let err = LineageError::from(PersistenceError::Encoding("bad".into()));
        assert_eq!(err.class(), ErrorClass::FatalToMember);
    }

    #[test]
    fn test_startup_error_mapping() {
        let err = StartupError::from(LineageError::IdentityMismatch {
            field: MismatchField::Cluster,
        });
        assert!(err.is_identity_mismatch());
        assert!(!err.is_retriable());

        let err = StartupError::from(LineageError::AwaitingBootstrap);
        assert!(err.is_retriable());

        let err = StartupError::from(LineageError::protocol_violation("bad"));
        assert!(matches!(err, StartupError::Fatal(_)));
    }

    #[test]
    fn test_protocol_violation_classification() {
        let err = LineageError::protocol_violation("two seeds");
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
        assert!(!err.is_retriable());
    }
}
