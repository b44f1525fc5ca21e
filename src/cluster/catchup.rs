//! Snapshot catch-up.
//!
//! A member whose applied position lies below the cluster's first retained
//! log index cannot replay the log and must install a snapshot instead. The
//! service finds a peer offering a snapshot that covers the required index,
//! transfers it in chunks, validates it and hands it to the member for
//! installation.
//!
//! Transfers are resumable: bytes already received for a snapshot are kept
//! across retries and the next fetch continues from that offset, on the same
//! peer or another one offering the same snapshot. Nothing is applied until
//! the whole snapshot has arrived and its checksum verifies.
//!
//! At most one run is in flight per member. A run can be cancelled from
//! another thread, in which case the partial buffer is dropped.

use crate::consensus::{LogPosition, MemberId};
use crate::core::error::{LineageError, LineageResult};
use crate::identity::IdentityPair;
use crate::net::SnapshotTransport;
use crate::storage::{SnapshotHandle, SnapshotId, SnapshotOffer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound on the buffer reserved up front for a transfer.
const MAX_RESERVE: usize = 1024 * 1024;

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct CatchupSettings {
    /// Bytes requested per chunk.
    pub chunk_size: usize,
    /// Rounds over the peer list before giving up.
    pub transfer_retries: u32,
    /// Pause between rounds.
    pub retry_backoff: Duration,
}

impl Default for CatchupSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            transfer_retries: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Result of a catch-up run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchupOutcome {
    /// A snapshot was installed.
    Installed {
        position: LogPosition,
        source: MemberId,
    },
    /// The member can continue from the log.
    NotNeeded,
    /// Another run is already in flight for this member.
    AlreadyInProgress,
    /// The run was cancelled and its partial transfer discarded.
    Cancelled,
}

/// Catch-up statistics.
#[derive(Debug, Clone, Default)]
pub struct CatchupStats {
    pub runs: u64,
    pub installs: u64,
    pub chunk_failures: u64,
    pub bytes_received: u64,
    pub cancelled: u64,
}

/// Bytes received so far for one snapshot.
#[derive(Debug)]
struct PartialTransfer {
    id: SnapshotId,
    checksum: u64,
    encoded_len: u64,
    buf: Vec<u8>,
}

impl PartialTransfer {
    fn matches(&self, offer: &SnapshotOffer) -> bool {
        self.id == offer.meta.id
            && self.checksum == offer.meta.checksum
            && self.encoded_len == offer.encoded_len
    }

    fn is_complete(&self) -> bool {
        self.buf.len() as u64 >= self.encoded_len
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum PeerAttempt {
    Complete(SnapshotHandle),
    Failed,
    Cancelled,
}

/// Drives snapshot transfer and installation for one member.
pub struct SnapshotCatchupService {
    member_id: MemberId,
    settings: CatchupSettings,
    transport: Arc<dyn SnapshotTransport>,
    in_flight: AtomicBool,
    cancel: Mutex<CancellationToken>,
    runs: AtomicU64,
    installs: AtomicU64,
    chunk_failures: AtomicU64,
    bytes_received: AtomicU64,
    cancelled: AtomicU64,
}

impl SnapshotCatchupService {
    pub fn new(
        member_id: MemberId,
        settings: CatchupSettings,
        transport: Arc<dyn SnapshotTransport>,
    ) -> Self {
        Self {
            member_id,
            settings,
            transport,
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            runs: AtomicU64::new(0),
            installs: AtomicU64::new(0),
            chunk_failures: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Whether `applied` lies below the first retained log index.
    pub fn needs_catchup(applied: LogPosition, first_retained: u64) -> bool {
        applied.index + 1 < first_retained
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Token that cancels the current run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel the current run, if any.
    pub fn cancel(&self) {
        if self.is_in_flight() {
            tracing::info!(member_id = self.member_id, "cancelling snapshot catch-up");
        }
        self.cancel.lock().cancel();
    }

    /// Fetch a snapshot covering `required_index` from one of `peers` and
    /// install it through `install`.
    ///
    /// `expected` is the cluster identity the member already holds; a
    /// snapshot carrying a different store identity is rejected as fatal.
    /// With no expected identity the snapshot's pair is adopted.
    pub fn run<F>(
        &self,
        required_index: u64,
        peers: &[MemberId],
        expected: Option<&IdentityPair>,
        install: F,
    ) -> LineageResult<CatchupOutcome>
    where
        F: FnOnce(SnapshotHandle, MemberId) -> LineageResult<LogPosition>,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(member_id = self.member_id, "catch-up already in progress");
            return Ok(CatchupOutcome::AlreadyInProgress);
        }
        let _guard = InFlightGuard(&self.in_flight);
        let cancel = {
            let mut token = self.cancel.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        self.runs.fetch_add(1, Ordering::Relaxed);

        let peers: Vec<MemberId> = peers
            .iter()
            .copied()
            .filter(|p| *p != self.member_id)
            .collect();
        let rounds = self.settings.transfer_retries.max(1);
        let mut partial: Option<PartialTransfer> = None;

        tracing::info!(
            member_id = self.member_id,
            required_index,
            peers = ?peers,
            "starting snapshot catch-up"
        );

        for round in 0..rounds {
            for i in 0..peers.len() {
                let peer = peers[(i + round as usize) % peers.len()];
                match self.attempt_peer(peer, required_index, &cancel, &mut partial) {
                    PeerAttempt::Complete(handle) => {
                        self.validate(&handle, expected)?;
                        let position = install(handle, peer)?;
                        self.installs.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            member_id = self.member_id,
                            source = peer,
                            position = %position,
                            "snapshot installed"
                        );
                        return Ok(CatchupOutcome::Installed {
                            position,
                            source: peer,
                        });
                    }
                    PeerAttempt::Cancelled => return Ok(self.cancelled_outcome()),
                    PeerAttempt::Failed => {}
                }
            }

            if round + 1 < rounds && sleep_cancellable(&cancel, self.settings.retry_backoff) {
                return Ok(self.cancelled_outcome());
            }
        }

        tracing::warn!(
            member_id = self.member_id,
            required_index,
            rounds,
            "no peer could serve a covering snapshot"
        );
        Err(LineageError::SnapshotUnavailable {
            required: required_index,
            attempts: rounds,
        })
    }

    fn attempt_peer(
        &self,
        peer: MemberId,
        required_index: u64,
        cancel: &CancellationToken,
        partial: &mut Option<PartialTransfer>,
    ) -> PeerAttempt {
        if cancel.is_cancelled() {
            return PeerAttempt::Cancelled;
        }

        let offer = match self.transport.snapshot_offer(peer) {
            Ok(Some(offer)) if offer.meta.position.covers(required_index) => offer,
            Ok(_) => {
                tracing::debug!(peer, required_index, "peer has no covering snapshot");
                return PeerAttempt::Failed;
            }
            Err(e) => {
                tracing::debug!(peer, error = %e, "snapshot offer failed");
                return PeerAttempt::Failed;
            }
        };

        match partial.as_ref() {
            Some(existing) if existing.matches(&offer) => {
                tracing::debug!(peer, offset = existing.buf.len(), "resuming snapshot transfer");
            }
            _ => {
                *partial = Some(PartialTransfer {
                    id: offer.meta.id.clone(),
                    checksum: offer.meta.checksum,
                    encoded_len: offer.encoded_len,
                    buf: Vec::with_capacity((offer.encoded_len as usize).min(MAX_RESERVE)),
                });
            }
        }
        let Some(transfer) = partial.as_mut() else {
            return PeerAttempt::Failed;
        };

        while !transfer.is_complete() {
            if cancel.is_cancelled() {
                return PeerAttempt::Cancelled;
            }

            let offset = transfer.buf.len() as u64;
            let remaining = (transfer.encoded_len - offset) as usize;
            let max_len = self.settings.chunk_size.max(1).min(remaining);
            match self
                .transport
                .fetch_snapshot_chunk(peer, &transfer.id, offset, max_len)
            {
                Ok(chunk) if !chunk.is_empty() => {
                    self.bytes_received
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    transfer.buf.extend_from_slice(&chunk);
                }
                Ok(_) => {
                    self.chunk_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(peer, offset, "peer returned an empty chunk");
                    return PeerAttempt::Failed;
                }
                Err(e) => {
                    self.chunk_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(peer, offset, error = %e, "snapshot chunk failed");
                    return PeerAttempt::Failed;
                }
            }
        }

        let Some(done) = partial.take() else {
            return PeerAttempt::Failed;
        };
        match SnapshotHandle::decode(&done.buf[..done.encoded_len as usize]) {
            Ok(handle) => PeerAttempt::Complete(handle),
            Err(e) => {
                tracing::warn!(peer, snapshot = %done.id, error = %e, "discarding corrupt snapshot transfer");
                PeerAttempt::Failed
            }
        }
    }

    fn validate(
        &self,
        handle: &SnapshotHandle,
        expected: Option<&IdentityPair>,
    ) -> LineageResult<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        if handle.meta.store_id != expected.store_id {
            tracing::error!(
                member_id = self.member_id,
                expected = %expected.store_id,
                found = %handle.meta.store_id,
                "snapshot belongs to a different store lineage"
            );
            return Err(LineageError::SnapshotIdentityMismatch {
                expected: expected.store_id,
                found: handle.meta.store_id,
            });
        }
        if handle.meta.cluster_id != expected.cluster_id {
            return Err(LineageError::protocol_violation(format!(
                "snapshot {} carries cluster identity {}, expected {}",
                handle.meta.id, handle.meta.cluster_id, expected.cluster_id
            )));
        }
        Ok(())
    }

    fn cancelled_outcome(&self) -> CatchupOutcome {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(member_id = self.member_id, "snapshot catch-up cancelled");
        CatchupOutcome::Cancelled
    }

    pub fn stats(&self) -> CatchupStats {
        CatchupStats {
            runs: self.runs.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            chunk_failures: self.chunk_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Sleep for `duration`, returning early with `true` when `cancel` fires.
fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

impl std::fmt::Debug for SnapshotCatchupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCatchupService")
            .field("member_id", &self.member_id)
            .field("settings", &self.settings)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::admission::{AdmissionResponse, JoinCandidate};
    use crate::core::error::StorageError;
    use crate::identity::{ClusterIdentity, StoreIdentity};
    use crate::net::{InMemoryTransport, PeerEndpoint};
    use bytes::Bytes;

    struct SnapshotPeer {
        handle: SnapshotHandle,
        encoded: Vec<u8>,
        claimed_len: u64,
    }

    impl SnapshotPeer {
        fn new(index: u64, pair: IdentityPair) -> Arc<Self> {
            let handle = SnapshotHandle::new(
                LogPosition::new(index, 1),
                pair,
                vec![1, 2],
                vec![42u8; 300],
            );
            let encoded = handle.encode().unwrap();
            let claimed_len = encoded.len() as u64;
            Arc::new(Self {
                handle,
                encoded,
                claimed_len,
            })
        }
    }

    impl PeerEndpoint for SnapshotPeer {
        fn evaluate_join(&self, _candidate: &JoinCandidate) -> AdmissionResponse {
            unreachable!("not used")
        }

        fn snapshot_offer(&self) -> Option<SnapshotOffer> {
            Some(SnapshotOffer {
                meta: self.handle.meta.clone(),
                encoded_len: self.claimed_len,
            })
        }

        fn read_snapshot_chunk(
            &self,
            _id: &SnapshotId,
            offset: u64,
            max_len: usize,
        ) -> Result<Bytes, StorageError> {
            let start = (offset as usize).min(self.encoded.len());
            let end = (start + max_len).min(self.encoded.len());
            Ok(Bytes::copy_from_slice(&self.encoded[start..end]))
        }
    }

    fn pair() -> IdentityPair {
        IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(1, 2, 3))
    }

    fn settings() -> CatchupSettings {
        CatchupSettings {
            chunk_size: 32,
            transfer_retries: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn service(transport: &Arc<InMemoryTransport>) -> SnapshotCatchupService {
        SnapshotCatchupService::new(9, settings(), transport.clone())
    }

    #[test]
    fn test_needs_catchup() {
        assert!(!SnapshotCatchupService::needs_catchup(LogPosition::new(10, 1), 11));
        assert!(SnapshotCatchupService::needs_catchup(LogPosition::new(9, 1), 11));
        assert!(!SnapshotCatchupService::needs_catchup(LogPosition::ZERO, 1));
    }

    #[test]
    fn test_installs_covering_snapshot() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let stale = SnapshotPeer::new(5, pair);
        let fresh = SnapshotPeer::new(50, pair);
        transport.register(1, &stale);
        transport.register(2, &fresh);

        let outcome = service(&transport)
            .run(40, &[1, 2], Some(&pair), |handle, _| Ok(handle.position()))
            .unwrap();
        assert_eq!(
            outcome,
            CatchupOutcome::Installed {
                position: LogPosition::new(50, 1),
                source: 2
            }
        );
    }

    #[test]
    fn test_transfer_resumes_after_failures() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let peer = SnapshotPeer::new(50, pair);
        transport.register(1, &peer);
        transport.fail_next_chunks(1, 2);

        let service = service(&transport);
        let outcome = service
            .run(50, &[1], Some(&pair), |handle, _| Ok(handle.position()))
            .unwrap();
        assert!(matches!(outcome, CatchupOutcome::Installed { .. }));

        let stats = service.stats();
        assert_eq!(stats.chunk_failures, 2);
        assert_eq!(stats.bytes_received, peer.encoded.len() as u64);
    }

    #[test]
    fn test_unavailable_after_retries() {
        let transport = Arc::new(InMemoryTransport::new());
        let err = service(&transport)
            .run(10, &[1, 2], None, |handle, _| Ok(handle.position()))
            .unwrap_err();
        assert!(matches!(
            err,
            LineageError::SnapshotUnavailable {
                required: 10,
                attempts: 3
            }
        ));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_inflated_offer_length_fails_transfer() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let handle = SnapshotHandle::new(LogPosition::new(50, 1), pair, vec![1], vec![7u8; 64]);
        let encoded = handle.encode().unwrap();
        let liar = Arc::new(SnapshotPeer {
            handle,
            encoded,
            claimed_len: 1 << 40,
        });
        transport.register(1, &liar);

        let service = service(&transport);
        let err = service
            .run(10, &[1], Some(&pair), |handle, _| Ok(handle.position()))
            .unwrap_err();
        assert!(matches!(err, LineageError::SnapshotUnavailable { .. }));
        assert_eq!(service.stats().chunk_failures, 3);
    }

    #[test]
    fn test_cancel_before_run_does_not_stick() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let peer = SnapshotPeer::new(50, pair);
        transport.register(1, &peer);

        let service = service(&transport);
        service.cancel();
        let outcome = service
            .run(10, &[1], Some(&pair), |handle, _| Ok(handle.position()))
            .unwrap();
        assert!(matches!(outcome, CatchupOutcome::Installed { .. }));
        assert!(!service.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_foreign_lineage_is_fatal() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let foreign = SnapshotPeer::new(
            50,
            IdentityPair::new(pair.cluster_id, StoreIdentity::new(7, 7, 7)),
        );
        transport.register(1, &foreign);

        let mut installed = false;
        let err = service(&transport)
            .run(10, &[1], Some(&pair), |handle, _| {
                installed = true;
                Ok(handle.position())
            })
            .unwrap_err();
        assert!(matches!(err, LineageError::SnapshotIdentityMismatch { .. }));
        assert!(err.stops_member());
        assert!(!installed);
    }

    #[test]
    fn test_cancel_during_backoff() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let peer = SnapshotPeer::new(50, pair);
        transport.register(1, &peer);
        transport.fail_next_chunks(1, u32::MAX);

        let service = Arc::new(SnapshotCatchupService::new(
            9,
            CatchupSettings {
                retry_backoff: Duration::from_secs(5),
                ..settings()
            },
            transport.clone(),
        ));
        let token = service.cancellation_token();
        let runner = {
            let service = service.clone();
            std::thread::spawn(move || {
                service.run(10, &[1], Some(&pair), |handle, _| Ok(handle.position()))
            })
        };

        while !service.is_in_flight() && !runner.is_finished() {
            std::thread::yield_now();
        }
        token.cancel();

        match runner.join().unwrap() {
            Ok(CatchupOutcome::Cancelled) => assert_eq!(service.stats().cancelled, 1),
            Err(LineageError::SnapshotUnavailable { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!service.is_in_flight());
    }

    #[test]
    fn test_concurrent_run_is_noop() {
        let pair = pair();
        let transport = Arc::new(InMemoryTransport::new());
        let peer = SnapshotPeer::new(50, pair);
        transport.register(1, &peer);
        let service = service(&transport);

        let outcome = service
            .run(10, &[1], Some(&pair), |handle, _| {
                let nested = service
                    .run(10, &[1], Some(&pair), |h, _| Ok(h.position()))
                    .unwrap();
                assert_eq!(nested, CatchupOutcome::AlreadyInProgress);
                Ok(handle.position())
            })
            .unwrap();
        assert!(matches!(outcome, CatchupOutcome::Installed { .. }));
    }
}
