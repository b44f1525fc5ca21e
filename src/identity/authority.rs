//! Store identity derivation.

use super::types::StoreIdentity;
use crate::core::error::StorageError;
use crate::storage::{LineageMarker, SnapshotHandle, StorageEngine};
use std::sync::Arc;

/// Derives [`StoreIdentity`] values from the storage engine.
///
/// The authority only derives and compares identities. Whether a member may
/// join is decided by the admission gate.
pub struct StoreIdentityAuthority {
    engine: Arc<dyn StorageEngine>,
}

impl StoreIdentityAuthority {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Create a brand-new store and derive its identity. Bootstrap only.
    pub fn derive_from_fresh_store(&self) -> Result<StoreIdentity, StorageError> {
        let marker = self.engine.create_fresh_store()?;
        let identity = StoreIdentity::new(marker.created_at_ms, rand::random(), marker.value);
        tracing::info!(store_id = %identity, "derived store identity from fresh store");
        Ok(identity)
    }

    /// The identity a snapshot carries, adopted verbatim.
    pub fn derive_from_snapshot(&self, handle: &SnapshotHandle) -> StoreIdentity {
        handle.store_identity()
    }

    /// Exact structural equality.
    pub fn identities_equal(&self, a: &StoreIdentity, b: &StoreIdentity) -> bool {
        a == b
    }

    /// Point the storage engine at the lineage named by `identity`.
    pub fn adopt(&self, identity: &StoreIdentity) -> Result<(), StorageError> {
        self.engine.adopt_lineage(lineage_marker(identity))
    }

    /// Whether the engine currently holds data of the lineage `identity` names.
    pub fn engine_matches(&self, identity: &StoreIdentity) -> bool {
        self.engine
            .current_lineage_marker()
            .is_some_and(|marker| marker == lineage_marker(identity))
    }
}

impl std::fmt::Debug for StoreIdentityAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreIdentityAuthority").finish_non_exhaustive()
    }
}

/// The engine marker a store identity was derived from.
pub fn lineage_marker(identity: &StoreIdentity) -> LineageMarker {
    LineageMarker {
        created_at_ms: identity.creation_timestamp,
        value: identity.lineage_marker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::LogPosition;
    use crate::identity::{ClusterIdentity, IdentityPair};
    use crate::storage::MemoryStorageEngine;

    #[test]
    fn test_fresh_identity_tracks_engine_marker() {
        let engine = Arc::new(MemoryStorageEngine::new());
        let authority = StoreIdentityAuthority::new(engine.clone());

        let identity = authority.derive_from_fresh_store().unwrap();
        let marker = engine.current_lineage_marker().unwrap();
        assert_eq!(identity.lineage_marker, marker.value);
        assert_eq!(identity.creation_timestamp, marker.created_at_ms);
        assert!(authority.engine_matches(&identity));
    }

    #[test]
    fn test_fresh_identities_differ() {
        let authority = StoreIdentityAuthority::new(Arc::new(MemoryStorageEngine::new()));
        let a = authority.derive_from_fresh_store().unwrap();
        let b = authority.derive_from_fresh_store().unwrap();
        assert!(!authority.identities_equal(&a, &b));
        assert!(authority.identities_equal(&a, &a.clone()));
    }

    #[test]
    fn test_snapshot_identity_adopted_verbatim() {
        let authority = StoreIdentityAuthority::new(Arc::new(MemoryStorageEngine::new()));
        let store_id = StoreIdentity::new(10, 20, 30);
        let handle = SnapshotHandle::new(
            LogPosition::new(5, 1),
            IdentityPair::new(ClusterIdentity::generate(), store_id),
            vec![1],
            Vec::new(),
        );
        assert_eq!(authority.derive_from_snapshot(&handle), store_id);
    }

    #[test]
    fn test_adopt_sets_engine_lineage() {
        let engine = Arc::new(MemoryStorageEngine::new());
        let authority = StoreIdentityAuthority::new(engine.clone());
        let identity = StoreIdentity::new(7, 8, 9);

        assert!(!authority.engine_matches(&identity));
        authority.adopt(&identity).unwrap();
        assert!(authority.engine_matches(&identity));
    }
}
