//! Durable snapshots.
//!
//! A snapshot is a self-contained copy of the state machine at a log
//! position, together with the identity pair of the cluster that produced it
//! and the admitted roster at that point. Snapshots are immutable: a newer
//! snapshot supersedes an older one, nothing is ever rewritten in place.
//!
//! Files are named `snapshot_{index:016}_{term:016}.snap` and hold the
//! bincode-encoded [`SnapshotHandle`]. Writes go to a temporary sibling and
//! are renamed into place after an fsync.

use crate::consensus::{LogPosition, MemberId};
use crate::core::error::StorageError;
use crate::identity::types::now_ms;
use crate::identity::{ClusterIdentity, IdentityPair, StoreIdentity};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};
use twox_hash::XxHash64;

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_EXTENSION: &str = "snap";

/// Snapshot identifier, derived from its position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn for_position(position: LogPosition) -> Self {
        Self(format!(
            "{SNAPSHOT_PREFIX}{:016}_{:016}",
            position.index, position.term
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the position encoded in the identifier.
    pub fn position(&self) -> Option<LogPosition> {
        let rest = self.0.strip_prefix(SNAPSHOT_PREFIX)?;
        let (index, term) = rest.split_once('_')?;
        Some(LogPosition::new(index.parse().ok()?, term.parse().ok()?))
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SnapshotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        match id.position() {
            Some(_) => Ok(id),
            None => Err(format!("invalid snapshot id: {s}")),
        }
    }
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    /// Last log position included in the snapshot.
    pub position: LogPosition,
    pub cluster_id: ClusterIdentity,
    /// Storage lineage the state belongs to.
    pub store_id: StoreIdentity,
    pub created_at_ms: u64,
    /// State payload size in bytes.
    pub size_bytes: u64,
    /// XxHash64 of the state payload.
    pub checksum: u64,
}

impl SnapshotMeta {
    pub fn pair(&self) -> IdentityPair {
        IdentityPair::new(self.cluster_id, self.store_id)
    }
}

/// A complete snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub meta: SnapshotMeta,
    /// Admitted roster at the snapshot position.
    pub membership: Vec<MemberId>,
    /// Serialized state machine.
    pub state: Vec<u8>,
}

impl SnapshotHandle {
    /// Build a snapshot of `state` taken at `position`.
    pub fn new(
        position: LogPosition,
        pair: IdentityPair,
        membership: Vec<MemberId>,
        state: Vec<u8>,
    ) -> Self {
        Self {
            meta: SnapshotMeta {
                id: SnapshotId::for_position(position),
                position,
                cluster_id: pair.cluster_id,
                store_id: pair.store_id,
                created_at_ms: now_ms(),
                size_bytes: state.len() as u64,
                checksum: checksum(&state),
            },
            membership,
            state,
        }
    }

    pub fn position(&self) -> LogPosition {
        self.meta.position
    }

    pub fn store_identity(&self) -> StoreIdentity {
        self.meta.store_id
    }

    /// Check the state payload against the recorded checksum.
    pub fn verify(&self) -> Result<(), StorageError> {
        let actual = checksum(&self.state);
        if actual != self.meta.checksum {
            return Err(StorageError::ChecksumMismatch {
                id: self.meta.id.to_string(),
                expected: self.meta.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::codec("snapshot", e))
    }

    /// Decode and verify a snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let handle: Self =
            bincode::deserialize(bytes).map_err(|e| StorageError::codec("snapshot", e))?;
        handle.verify()?;
        Ok(handle)
    }
}

/// What a peer advertises when asked for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOffer {
    pub meta: SnapshotMeta,
    /// Length of the encoded snapshot, the unit transferred in chunks.
    pub encoded_len: u64,
}

/// Directory of snapshots with an in-memory index.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    index: RwLock<BTreeMap<LogPosition, (SnapshotMeta, u64)>>,
}

impl SnapshotStore {
    /// Open (or create) the store, indexing existing snapshots.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(format!("create snapshot dir {}", dir.display()), e))?;

        let mut index = BTreeMap::new();
        let entries =
            std::fs::read_dir(&dir).map_err(|e| StorageError::io("list snapshot dir", e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(SNAPSHOT_EXTENSION) => {}
                Some("tmp") => {
                    tracing::warn!(path = %path.display(), "removing partial snapshot");
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                _ => continue,
            }

            let bytes = std::fs::read(&path).map_err(|e| StorageError::io("read snapshot", e))?;
            match SnapshotHandle::decode(&bytes) {
                Ok(handle) => {
                    index.insert(handle.meta.position, (handle.meta, bytes.len() as u64));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), snapshots = index.len(), "snapshot store opened");
        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
    }

    /// Durably write a snapshot. Saving an already-present snapshot is a no-op.
    pub fn save(&self, handle: &SnapshotHandle) -> Result<SnapshotMeta, StorageError> {
        if let Some((meta, _)) = self.index.read().get(&handle.meta.position) {
            if meta.checksum == handle.meta.checksum {
                return Ok(meta.clone());
            }
        }

        let bytes = handle.encode()?;
        let path = self.path_for(&handle.meta.id);
        let tmp = path.with_extension("tmp");

        let mut file = File::create(&tmp).map_err(|e| StorageError::io("create snapshot", e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io("write snapshot", e))?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::io("rename snapshot", e))?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        tracing::info!(
            snapshot = %handle.meta.id,
            position = %handle.meta.position,
            bytes = bytes.len(),
            "snapshot saved"
        );
        self.index.write().insert(
            handle.meta.position,
            (handle.meta.clone(), bytes.len() as u64),
        );
        Ok(handle.meta.clone())
    }

    /// Newest snapshot.
    pub fn latest(&self) -> Option<SnapshotMeta> {
        self.index
            .read()
            .values()
            .next_back()
            .map(|(meta, _)| meta.clone())
    }

    /// All snapshots, newest first.
    pub fn list(&self) -> Vec<SnapshotMeta> {
        self.index
            .read()
            .values()
            .rev()
            .map(|(meta, _)| meta.clone())
            .collect()
    }

    /// Offer the newest snapshot to a peer.
    pub fn offer(&self) -> Option<SnapshotOffer> {
        self.index
            .read()
            .values()
            .next_back()
            .map(|(meta, len)| SnapshotOffer {
                meta: meta.clone(),
                encoded_len: *len,
            })
    }

    /// Load and verify a snapshot.
    pub fn load(&self, id: &SnapshotId) -> Result<SnapshotHandle, StorageError> {
        let bytes = self.read_encoded(id)?;
        SnapshotHandle::decode(&bytes)
    }

    fn read_encoded(&self, id: &SnapshotId) -> Result<Vec<u8>, StorageError> {
        let known = id
            .position()
            .is_some_and(|pos| self.index.read().contains_key(&pos));
        if !known {
            return Err(StorageError::SnapshotNotFound(id.to_string()));
        }
        std::fs::read(self.path_for(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::SnapshotNotFound(id.to_string()),
            _ => StorageError::io("read snapshot", e),
        })
    }

    /// Read up to `len` bytes of the encoded snapshot starting at `offset`.
    pub fn read_chunk(&self, id: &SnapshotId, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let bytes = Bytes::from(self.read_encoded(id)?);
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes.slice(start..end))
    }

    /// Delete all but the newest `keep` snapshots. At least one is kept.
    pub fn cleanup(&self, keep: usize) -> Result<usize, StorageError> {
        let keep = keep.max(1);
        let mut index = self.index.write();
        let excess = index.len().saturating_sub(keep);
        let doomed: Vec<LogPosition> = index.keys().take(excess).copied().collect();

        let mut deleted = 0;
        for position in doomed {
            let id = SnapshotId::for_position(position);
            match std::fs::remove_file(self.path_for(&id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io("remove snapshot", e)),
            }
            index.remove(&position);
            deleted += 1;
        }

        if deleted > 0 {
            tracing::debug!(deleted, kept = index.len(), "old snapshots removed");
        }
        Ok(deleted)
    }
}

pub(crate) fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair() -> IdentityPair {
        IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(1, 2, 3))
    }

    fn handle(index: u64, pair: IdentityPair) -> SnapshotHandle {
        SnapshotHandle::new(
            LogPosition::new(index, 1),
            pair,
            vec![1, 2, 3],
            format!("state-{index}").into_bytes(),
        )
    }

    #[test]
    fn test_snapshot_id_round_trip() {
        let id = SnapshotId::for_position(LogPosition::new(42, 3));
        assert_eq!(id.as_str(), "snapshot_0000000000000042_0000000000000003");
        assert_eq!(id.position(), Some(LogPosition::new(42, 3)));
        assert!("bogus".parse::<SnapshotId>().is_err());
    }

    #[test]
    fn test_save_load_and_reopen() {
        let dir = TempDir::new().unwrap();
        let pair = pair();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let meta = store.save(&handle(10, pair)).unwrap();

        let loaded = store.load(&meta.id).unwrap();
        assert_eq!(loaded.meta.pair(), pair);
        assert_eq!(loaded.membership, vec![1, 2, 3]);

        let reopened = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(reopened.latest().map(|m| m.position.index), Some(10));
    }

    #[test]
    fn test_list_newest_first_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let pair = pair();
        let store = SnapshotStore::open(dir.path()).unwrap();
        for index in [5, 15, 10] {
            store.save(&handle(index, pair)).unwrap();
        }

        let indexes: Vec<u64> = store.list().iter().map(|m| m.position.index).collect();
        assert_eq!(indexes, vec![15, 10, 5]);

        assert_eq!(store.cleanup(2).unwrap(), 1);
        let indexes: Vec<u64> = store.list().iter().map(|m| m.position.index).collect();
        assert_eq!(indexes, vec![15, 10]);

        assert_eq!(store.cleanup(0).unwrap(), 1);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_read_chunks_reassemble() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save(&handle(3, pair())).unwrap();
        let offer = store.offer().unwrap();

        let mut buf = Vec::new();
        let mut offset = 0;
        while offset < offer.encoded_len {
            let chunk = store.read_chunk(&offer.meta.id, offset, 7).unwrap();
            offset += chunk.len() as u64;
            buf.extend_from_slice(&chunk);
        }
        let decoded = SnapshotHandle::decode(&buf).unwrap();
        assert_eq!(decoded.meta, offer.meta);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut snapshot = handle(1, pair());
        snapshot.state[0] ^= 0xff;
        assert!(matches!(
            snapshot.verify(),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let id = SnapshotId::for_position(LogPosition::new(9, 9));
        assert!(matches!(
            store.load(&id),
            Err(StorageError::SnapshotNotFound(_))
        ));
    }
}
