//! Local storage.
//!
//! # Modules
//!
//! - [`engine`] - Storage engine seam and in-memory engine
//! - [`log`] - Segmented command log with prefix pruning
//! - [`snapshot`] - Durable, immutable snapshots
//!
//! # Invariants
//!
//! - The command log is contiguous: each entry directly follows the previous one
//! - Pruning never removes the active segment
//! - Snapshots are superseded, never rewritten

pub mod engine;
pub mod log;
pub mod snapshot;

pub use engine::{LineageMarker, MemoryStorageEngine, StorageEngine};
pub use log::{CommandLog, LogLayout, PrunableLog, PruneReport, SegmentSummary};
pub use snapshot::{SnapshotHandle, SnapshotId, SnapshotMeta, SnapshotOffer, SnapshotStore};
