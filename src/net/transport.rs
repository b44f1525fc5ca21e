//! Member-to-member transport.
//!
//! Two request kinds travel between members: join admission requests sent to
//! the leader, and snapshot transfer (offer, then chunked reads). Snapshot
//! chunks are addressed by byte offset into the encoded snapshot, so a
//! transfer interrupted at offset `n` resumes from `n` against the same
//! snapshot on any peer.
//!
//! [`InMemoryTransport`] connects members living in one process and can
//! simulate disconnects and dropped chunks.

use crate::cluster::admission::{AdmissionResponse, JoinCandidate};
use crate::consensus::MemberId;
use crate::core::error::{StorageError, TransportError};
use crate::storage::{SnapshotId, SnapshotOffer};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// What a member serves to its peers.
pub trait PeerEndpoint: Send + Sync {
    /// Evaluate a join request against this member's view of the cluster.
    fn evaluate_join(&self, candidate: &JoinCandidate) -> AdmissionResponse;

    /// Newest snapshot this member can serve.
    fn snapshot_offer(&self) -> Option<SnapshotOffer>;

    /// Read part of an encoded snapshot.
    fn read_snapshot_chunk(
        &self,
        id: &SnapshotId,
        offset: u64,
        max_len: usize,
    ) -> Result<Bytes, StorageError>;
}

/// Sends join requests.
pub trait AdmissionTransport: Send + Sync {
    fn request_admission(
        &self,
        peer: MemberId,
        candidate: &JoinCandidate,
    ) -> Result<AdmissionResponse, TransportError>;
}

/// Chunked, resumable snapshot fetch.
pub trait SnapshotTransport: Send + Sync {
    /// Ask a peer which snapshot it holds.
    fn snapshot_offer(&self, peer: MemberId) -> Result<Option<SnapshotOffer>, TransportError>;

    /// Fetch up to `max_len` bytes of snapshot `id` starting at `offset`.
    fn fetch_snapshot_chunk(
        &self,
        peer: MemberId,
        id: &SnapshotId,
        offset: u64,
        max_len: usize,
    ) -> Result<Bytes, TransportError>;
}

/// In-process transport between registered members.
#[derive(Default)]
pub struct InMemoryTransport {
    peers: RwLock<HashMap<MemberId, Weak<dyn PeerEndpoint>>>,
    disconnected: RwLock<HashSet<MemberId>>,
    chunk_failures: Mutex<HashMap<MemberId, u32>>,
    chunks_served: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` reachable as `id`. Re-registering replaces the old endpoint.
    pub fn register<E: PeerEndpoint + 'static>(&self, id: MemberId, endpoint: &Arc<E>) {
        let weak: Weak<dyn PeerEndpoint> = Arc::downgrade(endpoint) as Weak<E>;
        self.peers.write().insert(id, weak);
    }

    pub fn unregister(&self, id: MemberId) {
        self.peers.write().remove(&id);
    }

    /// Simulate a network partition around `id`.
    pub fn disconnect(&self, id: MemberId) {
        self.disconnected.write().insert(id);
    }

    pub fn reconnect(&self, id: MemberId) {
        self.disconnected.write().remove(&id);
    }

    /// Drop the next `count` chunk reads served by `peer`.
    pub fn fail_next_chunks(&self, peer: MemberId, count: u32) {
        self.chunk_failures.lock().insert(peer, count);
    }

    /// Total chunks delivered.
    pub fn chunks_served(&self) -> u64 {
        self.chunks_served.load(Ordering::Relaxed)
    }

    fn endpoint(&self, peer: MemberId) -> Result<Arc<dyn PeerEndpoint>, TransportError> {
        if self.disconnected.read().contains(&peer) {
            return Err(TransportError::Unreachable(peer));
        }
        self.peers
            .read()
            .get(&peer)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Unreachable(peer))
    }

    fn take_chunk_failure(&self, peer: MemberId) -> bool {
        let mut failures = self.chunk_failures.lock();
        match failures.get_mut(&peer) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("peers", &self.peers.read().len())
            .field("disconnected", &*self.disconnected.read())
            .finish()
    }
}

impl AdmissionTransport for InMemoryTransport {
    fn request_admission(
        &self,
        peer: MemberId,
        candidate: &JoinCandidate,
    ) -> Result<AdmissionResponse, TransportError> {
        if self.disconnected.read().contains(&candidate.member_id) {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(self.endpoint(peer)?.evaluate_join(candidate))
    }
}

impl SnapshotTransport for InMemoryTransport {
    fn snapshot_offer(&self, peer: MemberId) -> Result<Option<SnapshotOffer>, TransportError> {
        Ok(self.endpoint(peer)?.snapshot_offer())
    }

    fn fetch_snapshot_chunk(
        &self,
        peer: MemberId,
        id: &SnapshotId,
        offset: u64,
        max_len: usize,
    ) -> Result<Bytes, TransportError> {
        let endpoint = self.endpoint(peer)?;
        if self.take_chunk_failure(peer) {
            tracing::debug!(peer, offset, "dropping snapshot chunk");
            return Err(TransportError::Interrupted { peer, offset });
        }

        let chunk = endpoint
            .read_snapshot_chunk(id, offset, max_len)
            .map_err(|e| TransportError::Remote {
                peer,
                message: e.to_string(),
            })?;
        self.chunks_served.fetch_add(1, Ordering::Relaxed);
        Ok(chunk)
    }
}
