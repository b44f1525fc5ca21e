//! Storage engine seam.
//!
//! The transactional store itself lives outside this crate. Lineage only
//! needs it to report its lineage marker, create a fresh store, apply
//! replicated data commands, and take or install whole-state snapshots.
//! [`MemoryStorageEngine`] is a small key/value implementation used by the
//! standalone runtime and the tests.

use crate::consensus::LogPosition;
use crate::core::error::StorageError;
use crate::identity::types::now_ms;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lineage marker written by the storage engine when a store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageMarker {
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Random marker value.
    pub value: u64,
}

impl LineageMarker {
    /// Draw a new marker.
    pub fn fresh() -> Self {
        Self {
            created_at_ms: now_ms(),
            value: rand::random(),
        }
    }
}

/// Operations consumed from the storage engine.
pub trait StorageEngine: Send + Sync {
    /// Marker of the lineage the current data belongs to.
    fn current_lineage_marker(&self) -> Option<LineageMarker>;

    /// Discard all data and start a brand-new lineage.
    fn create_fresh_store(&self) -> Result<LineageMarker, StorageError>;

    /// Discard all data and start an empty store on an existing lineage.
    fn adopt_lineage(&self, marker: LineageMarker) -> Result<(), StorageError>;

    /// Apply one replicated data command.
    fn apply(&self, position: LogPosition, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Serialize the whole state.
    fn take_snapshot(&self) -> Result<Vec<u8>, StorageError>;

    /// Replace the whole state with a serialized snapshot.
    fn install_snapshot(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EngineState {
    lineage: Option<LineageMarker>,
    records: BTreeMap<Vec<u8>, Vec<u8>>,
    last_applied: LogPosition,
}

/// In-memory key/value storage engine.
#[derive(Debug, Default)]
pub struct MemoryStorageEngine {
    state: RwLock<EngineState>,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.read().records.get(key).cloned()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the last applied data command.
    pub fn last_applied(&self) -> LogPosition {
        self.state.read().last_applied
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn current_lineage_marker(&self) -> Option<LineageMarker> {
        self.state.read().lineage
    }

    fn create_fresh_store(&self) -> Result<LineageMarker, StorageError> {
        let marker = LineageMarker::fresh();
        *self.state.write() = EngineState {
            lineage: Some(marker),
            ..Default::default()
        };
        Ok(marker)
    }

    fn adopt_lineage(&self, marker: LineageMarker) -> Result<(), StorageError> {
        *self.state.write() = EngineState {
            lineage: Some(marker),
            ..Default::default()
        };
        Ok(())
    }

    fn apply(&self, position: LogPosition, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if state.lineage.is_none() {
            return Err(StorageError::NoLineage);
        }
        state.records.insert(key.to_vec(), value.to_vec());
        state.last_applied = position;
        Ok(())
    }

    fn take_snapshot(&self) -> Result<Vec<u8>, StorageError> {
        let state = self.state.read();
        bincode::serialize(&*state).map_err(|e| StorageError::codec("engine snapshot", e))
    }

    fn install_snapshot(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let installed: EngineState =
            bincode::deserialize(bytes).map_err(|e| StorageError::codec("engine snapshot", e))?;
        *self.state.write() = installed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_requires_lineage() {
        let engine = MemoryStorageEngine::new();
        let err = engine
            .apply(LogPosition::new(1, 1), b"k", b"v")
            .unwrap_err();
        assert!(matches!(err, StorageError::NoLineage));
    }

    #[test]
    fn test_fresh_store_resets_data() {
        let engine = MemoryStorageEngine::new();
        let first = engine.create_fresh_store().unwrap();
        engine.apply(LogPosition::new(1, 1), b"k", b"v").unwrap();
        assert_eq!(engine.len(), 1);

        let second = engine.create_fresh_store().unwrap();
        assert_ne!(first, second);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_snapshot_carries_lineage_and_data() {
        let source = MemoryStorageEngine::new();
        let marker = source.create_fresh_store().unwrap();
        source.apply(LogPosition::new(2, 1), b"a", b"1").unwrap();
        let bytes = source.take_snapshot().unwrap();

        let target = MemoryStorageEngine::new();
        target.create_fresh_store().unwrap();
        target.install_snapshot(&bytes).unwrap();

        assert_eq!(target.current_lineage_marker(), Some(marker));
        assert_eq!(target.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(target.last_applied(), LogPosition::new(2, 1));
    }
}
