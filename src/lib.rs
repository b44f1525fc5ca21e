//! Lineage - cluster identity, join admission and snapshot catch-up.
//!
//! Lineage is the identity-and-recovery layer of a consensus-replicated
//! store. It guarantees that every member that believes it belongs to a
//! cluster also holds data of that cluster's storage lineage, and lets
//! lagging or brand-new members catch up by installing a snapshot instead
//! of replaying the whole log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Member                               │
//! │   start │ request_join │ request_remove │ tick │ prune_now      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Bootstrap   │   Admission gate   │   Catch-up   │   Pruning   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  IdentityStore │ CommandLog │ SnapshotStore │ StoreIdentityAuth │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     ConsensusEngine   │   StorageEngine   │   Transports        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Member runtime orchestration
//! - [`core::error`] - Error types and classification
//!
//! ## Identity
//! - [`identity::types`] - Cluster and store identities, bootstrap phase
//! - [`identity::store`] - Crash-safe identity persistence
//! - [`identity::authority`] - Store identity derivation and comparison
//!
//! ## Cluster
//! - [`cluster::bootstrap`] - One-time identity seeding
//! - [`cluster::admission`] - Join admission decisions
//! - [`cluster::catchup`] - Snapshot transfer and installation
//! - [`cluster::prune`] - Snapshot-bounded log pruning
//! - [`cluster::member`] - A member wiring everything together
//!
//! ## Collaborators
//! - [`consensus`] - Consensus seam and in-process engine
//! - [`storage`] - Storage engine seam, command log and snapshots
//! - [`net`] - Admission and snapshot transports
//!
//! # Key Invariants
//!
//! - A committed cluster identity never changes.
//! - Members of one cluster hold bit-identical store identities.
//! - A member with a divergent identity is never admitted.
//! - Log entries are pruned only behind a durable snapshot.

// Core infrastructure
pub mod core;

// Identity model and persistence
pub mod identity;

// Bootstrap, admission, catch-up and pruning
pub mod cluster;

// Consensus seam
pub mod consensus;

// Storage seam, command log and snapshots
pub mod storage;

// Transports
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use cluster::{Member, MemberDeps, MemberSettings, StartOutcome};
pub use identity::{ClusterIdentity, IdentityPair, StoreIdentity};
