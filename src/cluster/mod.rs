//! Cluster identity, admission and recovery.
//!
//! # Modules
//!
//! - [`bootstrap`] - Seeds the cluster identity exactly once
//! - [`admission`] - Decides whether a joining member may enter
//! - [`catchup`] - Chunked snapshot transfer for lagging members
//! - [`prune`] - Log pruning bounded by snapshot coverage
//! - [`membership`] - Roster and applied-progress view
//! - [`member`] - One member wiring the above together
//!
//! # Invariants
//!
//! - The committed cluster identity never changes once bootstrapped.
//! - A member holding a different identity is never admitted.
//! - Log entries are pruned only once a durable snapshot covers them.

pub mod admission;
pub mod bootstrap;
pub mod catchup;
pub mod member;
pub mod membership;
pub mod prune;

pub use admission::{AdmissionResponse, JoinAdmissionGate, JoinCandidate, JoinDecision};
pub use bootstrap::{BootstrapOutcome, ClusterBootstrapCoordinator, SeedApplication};
pub use catchup::{CatchupOutcome, CatchupSettings, CatchupStats, SnapshotCatchupService};
pub use member::{
    JoinOutcome, Member, MemberDeps, MemberSettings, StartOutcome, SyncOutcome,
};
pub use membership::MembershipView;
pub use prune::{
    PruneCoordinator, PruneDecision, PrunePlan, PruneStats, PruningStrategy,
};
