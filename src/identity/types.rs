//! Identity value types.
//!
//! A member carries two independent identities:
//!
//! - [`ClusterIdentity`] names the logical cluster it belongs to.
//! - [`StoreIdentity`] names the storage lineage its data derives from.
//!
//! Both are written together as one [`IdentityRecord`], along with the
//! member's [`BootstrapPhase`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit identifier of one logical cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterIdentity(Uuid);

impl ClusterIdentity {
    /// Generate a fresh random cluster identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Underlying UUID.
    pub fn uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClusterIdentity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of one storage lineage.
///
/// Members holding data copied from the same origin have bit-identical
/// values. Comparison is exact: any field difference means a different
/// lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreIdentity {
    /// Store creation time in milliseconds since the Unix epoch.
    pub creation_timestamp: u64,
    /// Random value drawn when the store was created.
    pub random_seed: u64,
    /// Lineage marker reported by the storage engine.
    pub lineage_marker: u64,
}

impl StoreIdentity {
    /// Create a store identity from its parts.
    pub const fn new(creation_timestamp: u64, random_seed: u64, lineage_marker: u64) -> Self {
        Self {
            creation_timestamp,
            random_seed,
            lineage_marker,
        }
    }

    /// A random identity unrelated to any store. Used to simulate tampering.
    pub fn random() -> Self {
        Self {
            creation_timestamp: now_ms(),
            random_seed: rand::random(),
            lineage_marker: rand::random(),
        }
    }
}

impl std::fmt::Display for StoreIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:x}-{:016x}-{:016x}",
            self.creation_timestamp, self.random_seed, self.lineage_marker
        )
    }
}

/// The cluster identity together with the store identity it was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPair {
    pub cluster_id: ClusterIdentity,
    pub store_id: StoreIdentity,
}

impl IdentityPair {
    pub const fn new(cluster_id: ClusterIdentity, store_id: StoreIdentity) -> Self {
        Self {
            cluster_id,
            store_id,
        }
    }
}

impl std::fmt::Display for IdentityPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster={} store={}", self.cluster_id, self.store_id)
    }
}

/// Per-member bootstrap progress.
///
/// `Unbootstrapped → Seeding → Bootstrapped` on the seeding member,
/// `Unbootstrapped → Bootstrapped` everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// No identity known.
    #[default]
    Unbootstrapped,
    /// Identity generated and persisted locally but not yet committed.
    Seeding,
    /// Identity committed by a majority.
    Bootstrapped,
}

impl BootstrapPhase {
    /// Whether data commands may be accepted.
    pub fn is_bootstrapped(&self) -> bool {
        matches!(self, Self::Bootstrapped)
    }
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbootstrapped => write!(f, "UNBOOTSTRAPPED"),
            Self::Seeding => write!(f, "SEEDING"),
            Self::Bootstrapped => write!(f, "BOOTSTRAPPED"),
        }
    }
}

/// The unit written atomically by an identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub cluster_id: ClusterIdentity,
    pub store_id: StoreIdentity,
    pub phase: BootstrapPhase,
    /// Wall-clock time of the write, for diagnostics only.
    pub written_at_ms: u64,
}

impl IdentityRecord {
    /// Create a record for the given pair and phase.
    pub fn new(pair: IdentityPair, phase: BootstrapPhase) -> Self {
        Self {
            cluster_id: pair.cluster_id,
            store_id: pair.store_id,
            phase,
            written_at_ms: now_ms(),
        }
    }

    /// Create a bootstrapped record.
    pub fn bootstrapped(cluster_id: ClusterIdentity, store_id: StoreIdentity) -> Self {
        Self::new(IdentityPair::new(cluster_id, store_id), BootstrapPhase::Bootstrapped)
    }

    /// The identity pair held by this record.
    pub fn pair(&self) -> IdentityPair {
        IdentityPair::new(self.cluster_id, self.store_id)
    }

    /// Same record with a different phase.
    pub fn with_phase(&self, phase: BootstrapPhase) -> Self {
        Self::new(self.pair(), phase)
    }
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
