//! One cluster member.
//!
//! A [`Member`] owns a member's collaborators and its local state: the
//! persisted identity record, the applied log position, the admitted roster
//! and the local command log. Every state transition (applying committed
//! entries, installing a snapshot, persisting identity) happens under the
//! member's single state lock. The lock is never held across a consensus
//! proposal or a transport call.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► start ──► (tick / prune_now)* ──► stop
//!            │
//!            ├─ bootstrapped: verify identity with peers, rejoin if removed
//!            ├─ initial member: seed or adopt the committed seed
//!            └─ otherwise: request_join, then catch up
//! ```
//!
//! A persisted identity is only trusted once `start` has verified it: by
//! seeding, by adopting the committed seed or a snapshot, or by an explicit
//! admit from a verified peer. When every member restarts at once there is
//! no verified peer, and a majority of the roster presenting the identical
//! pair verifies it instead. Until then the member neither writes nor
//! judges other candidates.
//!
//! A member that hits a fatal or protocol-violation error stops: it keeps
//! its on-disk state for diagnosis and refuses further work.

use super::admission::{AdmissionResponse, JoinAdmissionGate, JoinCandidate, JoinDecision};
use super::bootstrap::{BootstrapOutcome, ClusterBootstrapCoordinator};
use super::catchup::{CatchupOutcome, CatchupSettings, CatchupStats, SnapshotCatchupService};
use super::membership::MembershipView;
use super::prune::{PruneCoordinator, PrunePlan, PruneStats, PruningStrategy};
use crate::consensus::{Command, ConsensusEngine, LogEntry, LogPosition, MemberId};
use crate::core::error::{ConsensusError, LineageError, LineageResult, StartupError, StorageError};
use crate::identity::{
    BootstrapPhase, ClusterIdentity, IdentityPair, IdentityRecord, IdentityStore, StoreIdentity,
    StoreIdentityAuthority,
};
use crate::net::{AdmissionTransport, PeerEndpoint, SnapshotTransport};
use crate::storage::log::DEFAULT_ROTATION_SIZE;
use crate::storage::{
    CommandLog, LogLayout, PrunableLog, PruneReport, SnapshotHandle, SnapshotId, SnapshotMeta,
    SnapshotOffer, SnapshotStore, StorageEngine,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SYNC_BATCH: usize = 512;
const MAX_CATCHUP_ROUNDS: usize = 3;

/// Per-member settings.
#[derive(Debug, Clone)]
pub struct MemberSettings {
    pub member_id: MemberId,
    pub data_dir: PathBuf,
    /// Members that bootstrap the cluster together.
    pub initial_members: Vec<MemberId>,
    pub commit_timeout: Duration,
    pub join_retry_backoff: Duration,
    pub pruning_strategy: PruningStrategy,
    pub log_rotation_size: u64,
    pub keep_snapshots: usize,
    pub catchup: CatchupSettings,
}

impl MemberSettings {
    pub fn new(
        member_id: MemberId,
        data_dir: impl Into<PathBuf>,
        initial_members: Vec<MemberId>,
    ) -> Self {
        Self {
            member_id,
            data_dir: data_dir.into(),
            initial_members,
            commit_timeout: Duration::from_secs(5),
            join_retry_backoff: Duration::from_millis(500),
            pruning_strategy: PruningStrategy::default(),
            log_rotation_size: DEFAULT_ROTATION_SIZE,
            keep_snapshots: 2,
            catchup: CatchupSettings::default(),
        }
    }

    /// Directory holding the identity record.
    pub fn cluster_state_dir(&self) -> PathBuf {
        self.data_dir.join("cluster-state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn is_initial_member(&self) -> bool {
        self.initial_members.contains(&self.member_id)
    }
}

/// External collaborators of one member.
#[derive(Clone)]
pub struct MemberDeps {
    pub consensus: Arc<dyn ConsensusEngine>,
    pub engine: Arc<dyn StorageEngine>,
    pub identity_store: Arc<dyn IdentityStore>,
    pub admission: Arc<dyn AdmissionTransport>,
    pub snapshots: Arc<dyn SnapshotTransport>,
}

/// How `start` brought the member up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// This member seeded the cluster identity.
    Seeded(IdentityPair),
    /// The member adopted a seed committed by another initial member.
    Adopted(IdentityPair),
    /// A bootstrapped member came back with its identity verified.
    Rejoined(IdentityPair),
    /// The member joined through admission.
    Joined(JoinOutcome),
}

impl StartOutcome {
    pub fn identity(&self) -> IdentityPair {
        match self {
            Self::Seeded(pair) | Self::Adopted(pair) | Self::Rejoined(pair) => *pair,
            Self::Joined(join) => join.identity,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub identity: IdentityPair,
    pub applied: LogPosition,
    /// Whether a snapshot had to be installed to catch up.
    pub via_snapshot: bool,
}

/// Result of reading committed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate { applied: LogPosition },
    /// The next needed entry has been pruned; a snapshot is required.
    Compacted { first_retained: u64 },
}

struct MemberState {
    record: Option<IdentityRecord>,
    /// The record has been checked against the cluster.
    verified: bool,
    /// Pair reported by the peer that admitted this member.
    admitted_into: Option<IdentityPair>,
    applied: LogPosition,
    membership: BTreeSet<MemberId>,
    log: CommandLog,
    stopped: Option<String>,
}

impl MemberState {
    fn bootstrapped_pair(&self) -> Option<IdentityPair> {
        self.record
            .as_ref()
            .filter(|r| r.phase.is_bootstrapped())
            .map(IdentityRecord::pair)
    }

    /// The pair a snapshot must carry to be installed.
    fn expected_pair(&self) -> Option<IdentityPair> {
        self.bootstrapped_pair().or(self.admitted_into)
    }
}

/// Answers collected from one pass over the peers.
#[derive(Debug, Default)]
struct AdmissionRound {
    /// First admit or reject from a verified peer.
    answer: Option<AdmissionResponse>,
    /// Unverified peers holding exactly the presented pair.
    corroborated_by: Vec<MemberId>,
}

/// A cluster member.
pub struct Member {
    id: MemberId,
    settings: MemberSettings,
    consensus: Arc<dyn ConsensusEngine>,
    engine: Arc<dyn StorageEngine>,
    identity_store: Arc<dyn IdentityStore>,
    admission: Arc<dyn AdmissionTransport>,
    authority: Arc<StoreIdentityAuthority>,
    bootstrap: ClusterBootstrapCoordinator,
    catchup: SnapshotCatchupService,
    pruner: PruneCoordinator,
    snapshots: SnapshotStore,
    state: Mutex<MemberState>,
}

impl Member {
    /// Open a member's local state and restore its state machine.
    ///
    /// The newest local snapshot is installed first, then the local log is
    /// replayed on top of it.
    pub fn open(settings: MemberSettings, deps: MemberDeps) -> LineageResult<Arc<Self>> {
        let id = settings.member_id;
        let authority = Arc::new(StoreIdentityAuthority::new(deps.engine.clone()));
        let snapshots = SnapshotStore::open(settings.snapshot_dir())?;
        let mut log = CommandLog::open(settings.log_dir(), settings.log_rotation_size)?;
        let record = deps.identity_store.load()?;

        let mut applied = LogPosition::ZERO;
        let mut membership = BTreeSet::new();

        if let Some(latest) = snapshots.latest() {
            let handle = snapshots.load(&latest.id)?;
            deps.engine.install_snapshot(&handle.state)?;
            applied = handle.position();
            membership = handle.membership.iter().copied().collect();
            tracing::debug!(member_id = id, snapshot = %latest.id, "restored local snapshot");
        } else if let Some(record) = &record {
            authority.adopt(&record.store_id)?;
        }

        if log.last_position().index < applied.index || log.first_index() > applied.index + 1 {
            log.reset(applied)?;
        }

        let bootstrap = ClusterBootstrapCoordinator::new(
            id,
            settings.initial_members.clone(),
            deps.identity_store.clone(),
            authority.clone(),
            deps.consensus.clone(),
            settings.commit_timeout,
        );
        let catchup = SnapshotCatchupService::new(id, settings.catchup.clone(), deps.snapshots);
        let pruner = PruneCoordinator::new(settings.pruning_strategy);

        let replay = log.read_entries(applied.index + 1, u64::MAX)?;
        let replayed = replay.len();
        let member = Self {
            id,
            settings,
            consensus: deps.consensus,
            engine: deps.engine,
            identity_store: deps.identity_store,
            admission: deps.admission,
            authority,
            bootstrap,
            catchup,
            pruner,
            snapshots,
            state: Mutex::new(MemberState {
                record,
                verified: false,
                admitted_into: None,
                applied,
                membership,
                log,
                stopped: None,
            }),
        };
        {
            let mut state = member.state.lock();
            for entry in replay {
                member.apply_entry(&mut state, entry, true)?;
            }
        }

        let member = Arc::new(member);
        let applied = member.applied_position();
        member.consensus.report_applied(id, applied);
        tracing::info!(
            member_id = id,
            applied = %applied,
            replayed,
            phase = %member.phase(),
            "member opened"
        );
        Ok(member)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn settings(&self) -> &MemberSettings {
        &self.settings
    }

    /// Committed cluster identity, once bootstrapped.
    pub fn cluster_identity(&self) -> Option<ClusterIdentity> {
        self.identity().map(|pair| pair.cluster_id)
    }

    /// Committed store identity, once bootstrapped.
    pub fn store_identity(&self) -> Option<StoreIdentity> {
        self.identity().map(|pair| pair.store_id)
    }

    pub fn identity(&self) -> Option<IdentityPair> {
        self.state.lock().bootstrapped_pair()
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.state
            .lock()
            .record
            .as_ref()
            .map_or(BootstrapPhase::Unbootstrapped, |r| r.phase)
    }

    pub fn applied_position(&self) -> LogPosition {
        self.state.lock().applied
    }

    /// Roster as of the last applied entry.
    pub fn membership(&self) -> BTreeSet<MemberId> {
        self.state.lock().membership.clone()
    }

    /// Whether the consensus roster currently includes this member.
    pub fn is_admitted(&self) -> bool {
        self.consensus.roster().contains(&self.id)
    }

    /// Whether the persisted identity has been checked against the cluster.
    pub fn is_verified(&self) -> bool {
        self.state.lock().verified
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped.is_some()
    }

    pub fn stopped_reason(&self) -> Option<String> {
        self.state.lock().stopped.clone()
    }

    pub fn log_layout(&self) -> LogLayout {
        self.state.lock().log.layout()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn catchup_stats(&self) -> CatchupStats {
        self.catchup.stats()
    }

    pub fn prune_stats(&self) -> PruneStats {
        self.pruner.stats()
    }

    // ========================================================================
    // Startup and admission
    // ========================================================================

    /// Bring the member into the cluster, waiting up to `timeout`.
    pub fn start(&self, timeout: Duration) -> Result<StartOutcome, StartupError> {
        let deadline = Instant::now() + timeout;
        let result = self.start_inner(deadline);
        self.guard(result).map_err(StartupError::from)
    }

    fn start_inner(&self, deadline: Instant) -> LineageResult<StartOutcome> {
        loop {
            self.ensure_running()?;
            let record = self.state.lock().record.clone();

            match record {
                Some(record) if record.phase.is_bootstrapped() => {
                    if self.verify_identity_with_peers(&record)? {
                        self.mark_verified("confirmed by peers");
                        if !self.is_admitted() {
                            return self.join_inner(deadline).map(StartOutcome::Joined);
                        }
                        self.sync_and_catch_up()?;
                        return Ok(StartOutcome::Rejoined(record.pair()));
                    }
                    tracing::debug!(member_id = self.id, "identity not yet confirmed by peers");
                }
                record => {
                    if !self.settings.is_initial_member() {
                        return self.join_inner(deadline).map(StartOutcome::Joined);
                    }

                    self.sync_and_catch_up()?;
                    if let Some(pair) = self.identity() {
                        self.mark_verified("adopted committed seed");
                        return Ok(StartOutcome::Adopted(pair));
                    }

                    match self.bootstrap.try_seed(record.as_ref()) {
                        Ok(BootstrapOutcome::Seeded { pair, .. }) => {
                            self.reload_record()?;
                            self.mark_verified("seeded");
                            self.sync_and_catch_up()?;
                            return Ok(StartOutcome::Seeded(pair));
                        }
                        Ok(BootstrapOutcome::AlreadyBootstrapped(_)) => continue,
                        Ok(BootstrapOutcome::NotDesignated) | Ok(BootstrapOutcome::TimedOut) => {
                            self.reload_record()?;
                        }
                        Err(LineageError::SeedRejected { reason }) => {
                            tracing::debug!(member_id = self.id, reason, "seed lost, adopting committed seed");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if !self.wait_for_retry(deadline) {
                tracing::warn!(member_id = self.id, "cluster identity not established before deadline");
                return Err(LineageError::AwaitingBootstrap);
            }
        }
    }

    /// Ask the cluster to admit this member, waiting up to `timeout`.
    ///
    /// An identity mismatch stops the member.
    pub fn request_join(&self, timeout: Duration) -> Result<JoinOutcome, StartupError> {
        let deadline = Instant::now() + timeout;
        let result = self.join_inner(deadline);
        self.guard(result).map_err(StartupError::from)
    }

    fn join_inner(&self, deadline: Instant) -> LineageResult<JoinOutcome> {
        loop {
            self.ensure_running()?;
            let candidate = JoinCandidate::from_record(self.id, self.state.lock().record.as_ref());

            match self.request_admission(&candidate).answer {
                Some(response) => match response.decision {
                    JoinDecision::Admit => return self.complete_join(response),
                    JoinDecision::RejectIdentityMismatch(field) => {
                        return Err(LineageError::IdentityMismatch { field });
                    }
                    JoinDecision::RejectAwaitingBootstrap => {
                        tracing::debug!(member_id = self.id, "cluster awaiting bootstrap");
                    }
                },
                None => tracing::debug!(member_id = self.id, "no verified peer answered join request"),
            }

            if !self.wait_for_retry(deadline) {
                return Err(LineageError::AwaitingBootstrap);
            }
        }
    }

    fn complete_join(&self, response: AdmissionResponse) -> LineageResult<JoinOutcome> {
        if let Some(established) = response.established {
            self.state.lock().admitted_into = Some(established);
        }
        if !self.is_admitted() {
            let position = self.consensus.propose(
                self.id,
                Command::AddMember { member_id: self.id },
                self.settings.commit_timeout,
            )?;
            tracing::info!(member_id = self.id, position = %position, "member admitted");
        }

        let installs_before = self.catchup.stats().installs;
        self.sync_and_catch_up()?;
        let via_snapshot = self.catchup.stats().installs > installs_before;

        let identity = self
            .identity()
            .or(response.established)
            .ok_or(LineageError::AwaitingBootstrap)?;
        if let Some(established) = response.established.filter(|e| *e != identity) {
            return Err(LineageError::protocol_violation(format!(
                "joined with identity {identity} but was admitted into {established}"
            )));
        }
        self.mark_verified("admitted");
        Ok(JoinOutcome {
            identity,
            applied: self.applied_position(),
            via_snapshot,
        })
    }

    /// Send a join request to the leader first, then to other known members.
    ///
    /// Stops at the first verified peer's answer. Peers that are unreachable
    /// or not yet verified are skipped, noting those that corroborate.
    fn request_admission(&self, candidate: &JoinCandidate) -> AdmissionRound {
        let mut round = AdmissionRound::default();
        for peer in self.peer_order() {
            match self.admission.request_admission(peer, candidate) {
                Ok(response) if response.decision == JoinDecision::RejectAwaitingBootstrap => {
                    if response.corroborates {
                        round.corroborated_by.push(peer);
                    }
                }
                Ok(response) => {
                    tracing::debug!(member_id = self.id, peer, decision = %response.decision, "admission answered");
                    round.answer = Some(response);
                    break;
                }
                Err(e) => tracing::debug!(member_id = self.id, peer, error = %e, "admission request failed"),
            }
        }
        round
    }

    /// Check a bootstrapped member's identity against the running cluster.
    ///
    /// Returns `true` on an admit from a verified peer, or when a majority
    /// of the roster, this member included, holds the identical pair.
    fn verify_identity_with_peers(&self, record: &IdentityRecord) -> LineageResult<bool> {
        let candidate = JoinCandidate::with_identity(self.id, record.pair());
        let round = self.request_admission(&candidate);
        match round.answer.map(|r| r.decision) {
            Some(JoinDecision::Admit) => return Ok(true),
            Some(JoinDecision::RejectIdentityMismatch(field)) => {
                return Err(LineageError::IdentityMismatch { field });
            }
            Some(JoinDecision::RejectAwaitingBootstrap) | None => {}
        }

        let roster = self.consensus.roster();
        let agreeing = roster
            .iter()
            .filter(|m| **m == self.id || round.corroborated_by.contains(m))
            .count();
        tracing::debug!(
            member_id = self.id,
            agreeing,
            voters = roster.len(),
            "no verified peer reachable, counting identical identities"
        );
        Ok(agreeing * 2 > roster.len())
    }

    fn mark_verified(&self, how: &'static str) {
        let mut state = self.state.lock();
        if !state.verified {
            state.verified = true;
            tracing::info!(member_id = self.id, how, "identity verified");
        }
    }

    /// Peers to contact, leader first.
    fn peer_order(&self) -> Vec<MemberId> {
        let mut peers: Vec<MemberId> = Vec::new();
        if let Some(leader) = self.consensus.leader() {
            peers.push(leader);
        }
        let known = self
            .consensus
            .roster()
            .into_iter()
            .chain(self.settings.initial_members.iter().copied());
        for peer in known {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        peers.retain(|peer| *peer != self.id);
        peers
    }

    /// Remove a member from the roster.
    ///
    /// Removing this member cancels any in-flight catch-up.
    pub fn request_remove(&self, member_id: MemberId, timeout: Duration) -> LineageResult<LogPosition> {
        if member_id == self.id {
            self.catchup.cancel();
        }
        let position = self
            .consensus
            .propose(self.id, Command::RemoveMember { member_id }, timeout)?;
        tracing::info!(member_id = self.id, removed = member_id, position = %position, "member removed");
        if member_id != self.id {
            let result = self.sync_log().map(|_| ());
            self.guard(result)?;
        }
        Ok(position)
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Propose a state-machine write and apply it locally once committed.
    pub fn propose_data(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> LineageResult<LogPosition> {
        self.ensure_running()?;
        {
            let state = self.state.lock();
            if state.bootstrapped_pair().is_none() || !state.verified {
                return Err(LineageError::AwaitingBootstrap);
            }
        }
        let position = self.consensus.propose(
            self.id,
            Command::data(key, value),
            self.settings.commit_timeout,
        )?;
        let result = self.sync_log().map(|_| position);
        self.guard(result)
    }

    /// Apply newly committed entries.
    pub fn sync_log(&self) -> LineageResult<SyncOutcome> {
        self.ensure_running()?;
        let mut state = self.state.lock();
        let result = self.sync_locked(&mut state);
        self.consensus.report_applied(self.id, state.applied);
        drop(state);
        self.guard(result)
    }

    fn sync_locked(&self, state: &mut MemberState) -> LineageResult<SyncOutcome> {
        loop {
            let from = state.applied.index + 1;
            let entries = match self.consensus.committed_entries(from, SYNC_BATCH) {
                Ok(entries) => entries,
                Err(ConsensusError::Compacted { first_retained }) => {
                    tracing::info!(
                        member_id = self.id,
                        applied = %state.applied,
                        first_retained,
                        "required log entries were pruned"
                    );
                    return Ok(SyncOutcome::Compacted { first_retained });
                }
                Err(e) => return Err(e.into()),
            };
            if entries.is_empty() {
                return Ok(SyncOutcome::UpToDate {
                    applied: state.applied,
                });
            }
            for entry in entries {
                self.apply_entry(state, entry, false)?;
            }
        }
    }

    /// Apply newly committed entries, installing a snapshot when the log
    /// no longer reaches back to the applied position.
    pub fn tick(&self) -> LineageResult<()> {
        self.sync_and_catch_up()
    }

    fn sync_and_catch_up(&self) -> LineageResult<()> {
        for _ in 0..MAX_CATCHUP_ROUNDS {
            match self.sync_log()? {
                SyncOutcome::UpToDate { .. } => return Ok(()),
                SyncOutcome::Compacted { .. } => match self.catch_up()? {
                    CatchupOutcome::Installed { .. } | CatchupOutcome::NotNeeded => {}
                    CatchupOutcome::AlreadyInProgress => return Ok(()),
                    CatchupOutcome::Cancelled => {
                        return Err(LineageError::MemberStopped {
                            member_id: self.id,
                            reason: "catch-up cancelled".to_string(),
                        });
                    }
                },
            }
        }
        Ok(())
    }

    fn apply_entry(
        &self,
        state: &mut MemberState,
        entry: LogEntry,
        replay: bool,
    ) -> LineageResult<()> {
        let position = entry.position;
        if position.index <= state.applied.index {
            return Ok(());
        }
        if position.index != state.applied.index + 1 {
            return Err(LineageError::protocol_violation(format!(
                "entry {position} does not follow applied position {}",
                state.applied
            )));
        }

        match &entry.command {
            Command::SeedIdentity {
                pair,
                initial_members,
            } => {
                if !replay {
                    let application = self.bootstrap.apply_seed(state.record.as_ref(), *pair)?;
                    state.record = Some(application.record().clone());
                }
                state.membership = initial_members.iter().copied().collect();
            }
            Command::AddMember { member_id } => {
                state.membership.insert(*member_id);
            }
            Command::RemoveMember { member_id } => {
                state.membership.remove(member_id);
            }
            Command::Data { key, value } => {
                if !replay && state.bootstrapped_pair().is_none() {
                    return Err(LineageError::protocol_violation(format!(
                        "data command at {position} before cluster identity was committed"
                    )));
                }
                self.engine.apply(position, key, value)?;
            }
            Command::Noop => {}
        }

        if !replay && state.log.last_position().index < position.index {
            state.log.append(&entry)?;
        }
        state.applied = position;
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Install a snapshot from a peer if the log no longer reaches back to
    /// this member's applied position.
    pub fn catch_up(&self) -> LineageResult<CatchupOutcome> {
        self.ensure_running()?;
        let (applied, expected) = {
            let state = self.state.lock();
            (state.applied, state.expected_pair())
        };
        let first_retained = self.consensus.first_retained_index();
        if !SnapshotCatchupService::needs_catchup(applied, first_retained) {
            return Ok(CatchupOutcome::NotNeeded);
        }

        let peers = self.peer_order();
        let result = self.catchup.run(
            first_retained - 1,
            &peers,
            expected.as_ref(),
            |handle, _source| self.install_snapshot(handle),
        );
        self.guard(result)
    }

    /// Install a snapshot atomically: state machine, identity, log base and
    /// applied position change together under the state lock.
    ///
    /// Installing the snapshot the member already sits at is a no-op.
    pub fn install_snapshot(&self, handle: SnapshotHandle) -> LineageResult<LogPosition> {
        let mut state = self.state.lock();
        let position = handle.position();

        if position < state.applied {
            return Err(LineageError::PositionRegressed {
                current: state.applied,
                proposed: position,
            });
        }
        if position == state.applied && state.bootstrapped_pair().is_some() {
            return Ok(position);
        }
        if let Some(expected) = state.bootstrapped_pair() {
            if !self
                .authority
                .identities_equal(&expected.store_id, &handle.meta.store_id)
            {
                return Err(LineageError::SnapshotIdentityMismatch {
                    expected: expected.store_id,
                    found: self.authority.derive_from_snapshot(&handle),
                });
            }
        }

        self.snapshots.save(&handle)?;
        self.engine.install_snapshot(&handle.state)?;

        if state.bootstrapped_pair().is_none() {
            let record = IdentityRecord::new(handle.meta.pair(), BootstrapPhase::Bootstrapped);
            self.identity_store.save_record(&record)?;
            tracing::info!(
                member_id = self.id,
                cluster_id = %record.cluster_id,
                store_id = %record.store_id,
                "adopted identity from snapshot"
            );
            state.record = Some(record);
        }

        if state.log.last_position().index != position.index {
            state.log.reset(position)?;
        }
        state.membership = handle.membership.iter().copied().collect();
        state.applied = position;
        self.consensus.report_applied(self.id, position);
        Ok(position)
    }

    /// Take a snapshot of the current state.
    pub fn take_snapshot(&self) -> LineageResult<SnapshotMeta> {
        self.ensure_running()?;
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &MemberState) -> LineageResult<SnapshotMeta> {
        let pair = state
            .bootstrapped_pair()
            .ok_or(LineageError::AwaitingBootstrap)?;
        let bytes = self.engine.take_snapshot()?;
        let handle = SnapshotHandle::new(
            state.applied,
            pair,
            state.membership.iter().copied().collect(),
            bytes,
        );
        Ok(self.snapshots.save(&handle)?)
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Run one prune cycle now.
    ///
    /// Returns what was removed, or `None` when nothing was pruned. Storage
    /// failures are logged and reported as `None`.
    pub fn prune_now(&self) -> LineageResult<Option<PruneReport>> {
        self.ensure_running()?;
        let result = self.prune_cycle();
        self.guard(result)
    }

    fn prune_cycle(&self) -> LineageResult<Option<PruneReport>> {
        let view = MembershipView::capture(self.consensus.as_ref());
        let mut state = self.state.lock();

        let mut plan = self.plan_prune(&view, &state);
        if let PrunePlan::SnapshotFirst { watermark } = plan {
            let meta = self.snapshot_locked(&state)?;
            tracing::debug!(
                member_id = self.id,
                watermark,
                snapshot = %meta.id,
                "snapshot taken ahead of prune"
            );
            plan = self.plan_prune(&view, &state);
        }

        let decision = match plan {
            PrunePlan::Prune(decision) => decision,
            PrunePlan::Skip { reason } => {
                tracing::trace!(member_id = self.id, reason, "prune skipped");
                return Ok(None);
            }
            PrunePlan::SnapshotFirst { .. } => return Ok(None),
        };

        if !decision.is_safe(&view) {
            return Err(LineageError::protocol_violation(format!(
                "prune through {} is not covered by snapshot {}",
                decision.prune_through, decision.snapshot_index
            )));
        }

        let Some(report) = self.pruner.execute(&decision, &mut state.log) else {
            return Ok(None);
        };
        drop(state);

        self.consensus
            .compact_to(report.first_index.saturating_sub(1));
        if let Err(e) = self.snapshots.cleanup(self.settings.keep_snapshots) {
            tracing::warn!(member_id = self.id, error = %e, "snapshot cleanup failed");
        }
        Ok(Some(report))
    }

    fn plan_prune(&self, view: &MembershipView, state: &MemberState) -> PrunePlan {
        let newest = self.snapshots.latest().map(|meta| meta.position.index);
        self.pruner.plan(view, newest, &state.log.layout())
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// Stop participating. The first reason sticks.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        if state.stopped.is_none() {
            tracing::error!(
                member_id = self.id,
                reason = %reason,
                applied = %state.applied,
                phase = %state.record.as_ref().map_or(BootstrapPhase::Unbootstrapped, |r| r.phase),
                "member stopped"
            );
            state.stopped = Some(reason);
        }
        drop(state);
        self.catchup.cancel();
    }

    fn ensure_running(&self) -> LineageResult<()> {
        match &self.state.lock().stopped {
            Some(reason) => Err(LineageError::MemberStopped {
                member_id: self.id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Stop the member when `result` carries an error that requires it.
    fn guard<T>(&self, result: LineageResult<T>) -> LineageResult<T> {
        if let Err(e) = &result {
            if e.stops_member() && !matches!(e, LineageError::MemberStopped { .. }) {
                self.stop(e.to_string());
            }
        }
        result
    }

    fn reload_record(&self) -> LineageResult<()> {
        let record = self.identity_store.load()?;
        self.state.lock().record = record;
        Ok(())
    }

    /// Sleep before the next attempt. Returns `false` once past `deadline`.
    fn wait_for_retry(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(self.settings.join_retry_backoff.min(deadline - now));
        true
    }
}

impl PeerEndpoint for Member {
    fn evaluate_join(&self, candidate: &JoinCandidate) -> AdmissionResponse {
        let state = self.state.lock();
        if state.stopped.is_some() {
            return AdmissionResponse::awaiting_bootstrap();
        }
        let phase = state
            .record
            .as_ref()
            .map_or(BootstrapPhase::Unbootstrapped, |r| r.phase);
        let gate = JoinAdmissionGate::for_cluster(phase, state.record.as_ref().map(IdentityRecord::pair));
        let verified = state.verified;
        drop(state);
        if verified {
            gate.respond(candidate)
        } else {
            gate.respond_unverified(candidate)
        }
    }

    fn snapshot_offer(&self) -> Option<SnapshotOffer> {
        if self.is_stopped() {
            return None;
        }
        self.snapshots.offer()
    }

    fn read_snapshot_chunk(
        &self,
        id: &SnapshotId,
        offset: u64,
        max_len: usize,
    ) -> Result<Bytes, StorageError> {
        self.snapshots.read_chunk(id, offset, max_len)
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("data_dir", &self.settings.data_dir)
            .finish_non_exhaustive()
    }
}
