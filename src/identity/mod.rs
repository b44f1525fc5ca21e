//! Cluster and store identity.
//!
//! # Modules
//!
//! - [`types`] - Identity value types and the persisted record
//! - [`store`] - Durable identity record storage
//! - [`authority`] - Store identity derivation and comparison

pub mod authority;
pub mod store;
pub mod types;

pub use authority::StoreIdentityAuthority;
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore, IDENTITY_FILE_NAME};
pub use types::{BootstrapPhase, ClusterIdentity, IdentityPair, IdentityRecord, StoreIdentity};
