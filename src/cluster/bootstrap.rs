//! Cluster identity bootstrap.
//!
//! A brand-new cluster has no identity. Exactly one member, the one the
//! consensus engine currently designates as leader, seeds it:
//!
//! 1. derive a fresh store identity and generate a cluster identity,
//! 2. persist both in the `Seeding` phase,
//! 3. propose `SeedIdentity` as the first command and wait for commit,
//! 4. persist the pair again in the `Bootstrapped` phase.
//!
//! Every other member adopts the committed pair when it applies the seed
//! entry from the log. A seeder that crashed before its seed committed keeps
//! its `Seeding` record and re-proposes the same pair on restart; if another
//! member's seed won in the meantime, the committed pair replaces the local
//! one. Once a seed has committed no member may seed again.

use crate::consensus::{Command, ConsensusEngine, LogPosition, MemberId};
use crate::core::error::{ConsensusError, LineageError, LineageResult};
use crate::identity::{
    BootstrapPhase, ClusterIdentity, IdentityPair, IdentityRecord, IdentityStore,
    StoreIdentityAuthority,
};
use std::sync::Arc;
use std::time::Duration;

/// Result of a seeding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This member's seed committed.
    Seeded {
        pair: IdentityPair,
        position: LogPosition,
    },
    /// The member was already bootstrapped.
    AlreadyBootstrapped(IdentityPair),
    /// Another member is designated to seed; wait for the seed entry.
    NotDesignated,
    /// The seed did not commit in time. The record stays `Seeding`; retry.
    TimedOut,
}

/// How an applied seed entry changed the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedApplication {
    /// The member had no identity and adopted the committed pair.
    Adopted(IdentityRecord),
    /// The committed pair equals the local one.
    Confirmed(IdentityRecord),
    /// A stale `Seeding` pair lost to another member's seed and was replaced.
    Replaced(IdentityRecord),
}

impl SeedApplication {
    pub fn record(&self) -> &IdentityRecord {
        match self {
            Self::Adopted(r) | Self::Confirmed(r) | Self::Replaced(r) => r,
        }
    }

    /// Whether the storage engine must switch to the committed lineage.
    pub fn changes_lineage(&self) -> bool {
        !matches!(self, Self::Confirmed(_))
    }
}

/// Seeds a new cluster identity and applies committed seeds.
pub struct ClusterBootstrapCoordinator {
    member_id: MemberId,
    initial_members: Vec<MemberId>,
    identity_store: Arc<dyn IdentityStore>,
    authority: Arc<StoreIdentityAuthority>,
    consensus: Arc<dyn ConsensusEngine>,
    commit_timeout: Duration,
}

impl ClusterBootstrapCoordinator {
    pub fn new(
        member_id: MemberId,
        initial_members: Vec<MemberId>,
        identity_store: Arc<dyn IdentityStore>,
        authority: Arc<StoreIdentityAuthority>,
        consensus: Arc<dyn ConsensusEngine>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            member_id,
            initial_members,
            identity_store,
            authority,
            consensus,
            commit_timeout,
        }
    }

    /// Whether this member is the one allowed to seed.
    pub fn is_designated(&self) -> bool {
        self.consensus.leader() == Some(self.member_id)
    }

    /// Whether a seed has already been committed.
    pub fn seed_committed(&self) -> bool {
        self.consensus.last_position().index > 0
    }

    /// Attempt to seed the cluster identity.
    pub fn try_seed(&self, current: Option<&IdentityRecord>) -> LineageResult<BootstrapOutcome> {
        if let Some(record) = current.filter(|r| r.phase.is_bootstrapped()) {
            return Ok(BootstrapOutcome::AlreadyBootstrapped(record.pair()));
        }
        if !self.is_designated() {
            return Ok(BootstrapOutcome::NotDesignated);
        }
        if self.seed_committed() {
            tracing::warn!(member_id = self.member_id, "refusing to seed: a seed is already committed");
            return Err(LineageError::SeedRejected {
                reason: "cluster identity already committed".to_string(),
            });
        }

        let pair = match current {
            Some(record) => {
                tracing::info!(
                    member_id = self.member_id,
                    identity = %record.pair(),
                    "re-proposing seed from interrupted bootstrap"
                );
                record.pair()
            }
            None => {
                let store_id = self.authority.derive_from_fresh_store()?;
                IdentityPair::new(ClusterIdentity::generate(), store_id)
            }
        };

        self.identity_store
            .save_record(&IdentityRecord::new(pair, BootstrapPhase::Seeding))?;
        tracing::info!(member_id = self.member_id, identity = %pair, "seeding cluster identity");

        let command = Command::SeedIdentity {
            pair,
            initial_members: self.initial_members.clone(),
        };
        match self
            .consensus
            .propose(self.member_id, command, self.commit_timeout)
        {
            Ok(position) => {
                self.identity_store
                    .save_record(&IdentityRecord::new(pair, BootstrapPhase::Bootstrapped))?;
                tracing::info!(
                    member_id = self.member_id,
                    cluster_id = %pair.cluster_id,
                    store_id = %pair.store_id,
                    position = %position,
                    "cluster identity committed"
                );
                Ok(BootstrapOutcome::Seeded { pair, position })
            }
            Err(ConsensusError::Timeout { timeout_ms }) => {
                tracing::warn!(
                    member_id = self.member_id,
                    timeout_ms,
                    "seed did not commit in time"
                );
                Ok(BootstrapOutcome::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a committed seed entry to the local identity.
    pub fn apply_seed(
        &self,
        current: Option<&IdentityRecord>,
        committed: IdentityPair,
    ) -> LineageResult<SeedApplication> {
        let application = match current {
            None => SeedApplication::Adopted(self.persist(committed)?),
            Some(record) if record.phase == BootstrapPhase::Unbootstrapped => {
                SeedApplication::Adopted(self.persist(committed)?)
            }
            Some(record) if record.pair() == committed => {
                if record.phase.is_bootstrapped() {
                    SeedApplication::Confirmed(record.clone())
                } else {
                    SeedApplication::Confirmed(self.persist(committed)?)
                }
            }
            Some(record) if record.phase == BootstrapPhase::Seeding => {
                tracing::warn!(
                    member_id = self.member_id,
                    local = %record.pair(),
                    committed = %committed,
                    "another member's seed won; adopting committed identity"
                );
                SeedApplication::Replaced(self.persist(committed)?)
            }
            Some(record) => {
                tracing::error!(
                    member_id = self.member_id,
                    local = %record.pair(),
                    committed = %committed,
                    "conflicting committed seed"
                );
                return Err(LineageError::protocol_violation(format!(
                    "committed seed {committed} conflicts with established identity {}",
                    record.pair()
                )));
            }
        };

        if application.changes_lineage() {
            self.authority.adopt(&committed.store_id)?;
            tracing::info!(
                member_id = self.member_id,
                cluster_id = %committed.cluster_id,
                store_id = %committed.store_id,
                "adopted committed cluster identity"
            );
        }
        Ok(application)
    }

    fn persist(&self, pair: IdentityPair) -> LineageResult<IdentityRecord> {
        let record = IdentityRecord::new(pair, BootstrapPhase::Bootstrapped);
        self.identity_store.save_record(&record)?;
        Ok(record)
    }
}

impl std::fmt::Debug for ClusterBootstrapCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBootstrapCoordinator")
            .field("member_id", &self.member_id)
            .field("initial_members", &self.initial_members)
            .field("commit_timeout", &self.commit_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::InMemoryConsensus;
    use crate::identity::{MemoryIdentityStore, StoreIdentity};
    use crate::storage::{MemoryStorageEngine, StorageEngine};

    const TIMEOUT: Duration = Duration::from_millis(50);

    struct Fixture {
        store: Arc<MemoryIdentityStore>,
        engine: Arc<MemoryStorageEngine>,
        coordinator: ClusterBootstrapCoordinator,
    }

    fn fixture(member_id: MemberId, consensus: &Arc<InMemoryConsensus>) -> Fixture {
        let store = Arc::new(MemoryIdentityStore::new());
        let engine = Arc::new(MemoryStorageEngine::new());
        let coordinator = ClusterBootstrapCoordinator::new(
            member_id,
            vec![1, 2, 3],
            store.clone(),
            Arc::new(StoreIdentityAuthority::new(engine.clone())),
            consensus.clone(),
            TIMEOUT,
        );
        Fixture {
            store,
            engine,
            coordinator,
        }
    }

    #[test]
    fn test_designated_member_seeds() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(1, &consensus);

        let outcome = f.coordinator.try_seed(None).unwrap();
        let BootstrapOutcome::Seeded { pair, position } = outcome else {
            panic!("expected seed, got {outcome:?}");
        };
        assert_eq!(position.index, 1);

        let record = f.store.load().unwrap().unwrap();
        assert_eq!(record.phase, BootstrapPhase::Bootstrapped);
        assert_eq!(record.pair(), pair);
        assert!(f
            .coordinator
            .authority
            .engine_matches(&pair.store_id));
    }

    #[test]
    fn test_non_designated_member_waits() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(2, &consensus);
        assert_eq!(
            f.coordinator.try_seed(None).unwrap(),
            BootstrapOutcome::NotDesignated
        );
        assert!(f.store.load().unwrap().is_none());
    }

    /// Designates member 1 but never commits anything.
    struct StalledConsensus;

    impl ConsensusEngine for StalledConsensus {
        fn propose(
            &self,
            _proposer: MemberId,
            _command: Command,
            timeout: Duration,
        ) -> Result<LogPosition, ConsensusError> {
            Err(ConsensusError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }

        fn committed_entries(
            &self,
            _from_index: u64,
            _max_entries: usize,
        ) -> Result<Vec<crate::consensus::LogEntry>, ConsensusError> {
            Ok(Vec::new())
        }

        fn first_retained_index(&self) -> u64 {
            1
        }

        fn last_position(&self) -> LogPosition {
            LogPosition::ZERO
        }

        fn leader(&self) -> Option<MemberId> {
            Some(1)
        }

        fn roster(&self) -> Vec<MemberId> {
            vec![1, 2, 3]
        }

        fn report_applied(&self, _member: MemberId, _position: LogPosition) {}

        fn applied_positions(&self) -> std::collections::BTreeMap<MemberId, LogPosition> {
            Default::default()
        }

        fn compact_to(&self, _index: u64) {}
    }

    #[test]
    fn test_timeout_leaves_seeding_record() {
        let store = Arc::new(MemoryIdentityStore::new());
        let coordinator = ClusterBootstrapCoordinator::new(
            1,
            vec![1, 2, 3],
            store.clone(),
            Arc::new(StoreIdentityAuthority::new(Arc::new(MemoryStorageEngine::new()))),
            Arc::new(StalledConsensus),
            TIMEOUT,
        );

        assert_eq!(coordinator.try_seed(None).unwrap(), BootstrapOutcome::TimedOut);
        let record = store.load().unwrap().unwrap();
        assert_eq!(record.phase, BootstrapPhase::Seeding);

        // A retry re-proposes the same pair instead of generating a new one.
        assert_eq!(
            coordinator.try_seed(Some(&record)).unwrap(),
            BootstrapOutcome::TimedOut
        );
        assert_eq!(store.load().unwrap().unwrap().pair(), record.pair());
    }

    #[test]
    fn test_no_leader_means_not_designated() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        consensus.set_online(2, false);
        consensus.set_online(3, false);
        let f = fixture(1, &consensus);
        assert_eq!(
            f.coordinator.try_seed(None).unwrap(),
            BootstrapOutcome::NotDesignated
        );
    }

    #[test]
    fn test_second_seed_rejected() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let first = fixture(1, &consensus);
        first.coordinator.try_seed(None).unwrap();

        let again = fixture(1, &consensus);
        let err = again.coordinator.try_seed(None).unwrap_err();
        assert!(matches!(err, LineageError::SeedRejected { .. }));
    }

    #[test]
    fn test_apply_seed_adopts_on_fresh_member() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(2, &consensus);
        let pair = IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(5, 6, 7));

        let applied = f.coordinator.apply_seed(None, pair).unwrap();
        assert!(matches!(applied, SeedApplication::Adopted(_)));
        assert_eq!(f.store.load().unwrap().unwrap().pair(), pair);
        assert_eq!(f.engine.current_lineage_marker().map(|m| m.value), Some(7));
    }

    #[test]
    fn test_apply_seed_replaces_losing_seeding_pair() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(2, &consensus);
        let local = IdentityRecord::new(
            IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(1, 1, 1)),
            BootstrapPhase::Seeding,
        );
        let committed =
            IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(2, 2, 2));

        let applied = f.coordinator.apply_seed(Some(&local), committed).unwrap();
        assert!(matches!(applied, SeedApplication::Replaced(_)));
        assert_eq!(applied.record().pair(), committed);
    }

    #[test]
    fn test_conflicting_seed_is_protocol_violation() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(2, &consensus);
        let local = IdentityRecord::bootstrapped(ClusterIdentity::generate(), StoreIdentity::new(1, 1, 1));
        let committed =
            IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(2, 2, 2));

        let err = f.coordinator.apply_seed(Some(&local), committed).unwrap_err();
        assert!(matches!(err, LineageError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_apply_seed_confirms_own_pair() {
        let consensus = Arc::new(InMemoryConsensus::new([1, 2, 3]));
        let f = fixture(1, &consensus);
        let pair = IdentityPair::new(ClusterIdentity::generate(), StoreIdentity::new(3, 3, 3));
        let seeding = IdentityRecord::new(pair, BootstrapPhase::Seeding);

        let applied = f.coordinator.apply_seed(Some(&seeding), pair).unwrap();
        assert!(!applied.changes_lineage());
        assert!(applied.record().phase.is_bootstrapped());
        assert!(f.store.load().unwrap().unwrap().phase.is_bootstrapped());
    }
}
