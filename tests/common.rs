//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use lineage::cluster::{Member, MemberDeps, MemberSettings, PruningStrategy, StartOutcome};
use lineage::consensus::{InMemoryConsensus, MemberId};
use lineage::core::config::Config;
use lineage::core::error::{LineageResult, StartupError};
use lineage::identity::{FileIdentityStore, IdentityRecord, IdentityStore};
use lineage::storage::MemoryStorageEngine;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// Upper bound for any single start or join in tests.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[member]
member_id = 1
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration for a member of a three-member cluster.
pub fn create_cluster_config(member_id: MemberId, data_dir: &str, log_level: &str) -> NamedTempFile {
    let config_content = format!(
        r#"
[member]
member_id = {}
data_dir = "{}"

[cluster]
initial_members = [1, 2, 3]
commit_timeout_ms = 1000

[pruning]
strategy = "100 entries"
log_rotation_size = "4K"

[telemetry]
log_level = "{}"
"#,
        member_id, data_dir, log_level
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Create a temporary directory for test data.
pub fn temp_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Key used by [`TestCluster::write_entries`].
pub fn test_key(i: usize) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

/// Value used by [`TestCluster::write_entries`].
pub fn test_value(i: usize) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}

/// One running member and the handles tests inspect.
pub struct TestMember {
    pub member: Arc<Member>,
    pub engine: Arc<MemoryStorageEngine>,
}

/// Several members sharing one in-memory consensus group and transport.
///
/// Each member keeps its data directory across restarts; the storage engine
/// is recreated on every open, the way a process restart would lose it.
pub struct TestCluster {
    pub consensus: Arc<InMemoryConsensus>,
    pub transport: Arc<lineage::net::InMemoryTransport>,
    pub initial_members: Vec<MemberId>,
    root: TempDir,
    members: BTreeMap<MemberId, TestMember>,
}

impl TestCluster {
    pub fn new(initial_members: &[MemberId]) -> Self {
        Self {
            consensus: Arc::new(InMemoryConsensus::new(initial_members.iter().copied())),
            transport: Arc::new(lineage::net::InMemoryTransport::new()),
            initial_members: initial_members.to_vec(),
            root: temp_test_dir(),
            members: BTreeMap::new(),
        }
    }

    /// Open and start every initial member in order.
    pub fn bootstrap(initial_members: &[MemberId]) -> Self {
        let mut cluster = Self::new(initial_members);
        for &id in initial_members {
            cluster.open(id);
            assert_ok(cluster.start(id));
        }
        cluster
    }

    pub fn data_dir(&self, id: MemberId) -> PathBuf {
        self.root.path().join(format!("member-{}", id))
    }

    /// Settings tuned for fast tests: tiny segments, short timeouts.
    pub fn settings(&self, id: MemberId) -> MemberSettings {
        let mut settings = MemberSettings::new(id, self.data_dir(id), self.initial_members.clone());
        settings.commit_timeout = Duration::from_millis(500);
        settings.join_retry_backoff = Duration::from_millis(20);
        settings.pruning_strategy = PruningStrategy::KeepNone;
        settings.log_rotation_size = 256;
        settings.keep_snapshots = 2;
        settings.catchup.chunk_size = 128;
        settings.catchup.transfer_retries = 3;
        settings.catchup.retry_backoff = Duration::from_millis(10);
        settings
    }

    pub fn identity_store(&self, id: MemberId) -> FileIdentityStore {
        FileIdentityStore::in_dir(self.settings(id).cluster_state_dir())
    }

    /// Overwrite a member's persisted identity record.
    pub fn write_record(&self, id: MemberId, record: &IdentityRecord) {
        let store = self.identity_store(id);
        std::fs::create_dir_all(self.settings(id).cluster_state_dir())
            .expect("Failed to create cluster-state dir");
        assert_ok(store.save_record(record));
    }

    /// Open a member with a fresh engine and register it on the transport.
    pub fn open(&mut self, id: MemberId) -> Arc<Member> {
        self.open_with(self.settings(id))
    }

    pub fn open_with(&mut self, settings: MemberSettings) -> Arc<Member> {
        self.try_open_with(settings).expect("Failed to open member")
    }

    pub fn try_open(&mut self, id: MemberId) -> LineageResult<Arc<Member>> {
        self.try_open_with(self.settings(id))
    }

    pub fn try_open_with(&mut self, settings: MemberSettings) -> LineageResult<Arc<Member>> {
        let id = settings.member_id;
        let engine = Arc::new(MemoryStorageEngine::new());
        let deps = MemberDeps {
            consensus: self.consensus.clone(),
            engine: engine.clone(),
            identity_store: Arc::new(FileIdentityStore::in_dir(settings.cluster_state_dir())),
            admission: self.transport.clone(),
            snapshots: self.transport.clone(),
        };
        let member = Member::open(settings, deps)?;
        self.transport.register(id, &member);
        self.members.insert(
            id,
            TestMember {
                member: member.clone(),
                engine,
            },
        );
        Ok(member)
    }

    pub fn start(&self, id: MemberId) -> Result<StartOutcome, StartupError> {
        self.member(id).start(START_TIMEOUT)
    }

    /// Delete a member's data directory.
    pub fn wipe(&mut self, id: MemberId) {
        self.crash(id);
        let dir = self.data_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).expect("Failed to wipe data dir");
        }
    }

    /// Drop a member's in-memory state; its data directory survives.
    pub fn crash(&mut self, id: MemberId) {
        self.transport.unregister(id);
        self.members.remove(&id);
    }

    pub fn restart(&mut self, id: MemberId) -> Arc<Member> {
        self.crash(id);
        self.open(id)
    }

    pub fn member(&self, id: MemberId) -> &Arc<Member> {
        &self
            .members
            .get(&id)
            .unwrap_or_else(|| panic!("member {} is not open", id))
            .member
    }

    pub fn engine(&self, id: MemberId) -> &Arc<MemoryStorageEngine> {
        &self
            .members
            .get(&id)
            .unwrap_or_else(|| panic!("member {} is not open", id))
            .engine
    }

    pub fn open_members(&self) -> Vec<MemberId> {
        self.members.keys().copied().collect()
    }

    /// Propose `count` data commands through `via`, starting at key `from`.
    pub fn write_entries(&self, via: MemberId, from: usize, count: usize) {
        let member = self.member(via);
        for i in from..from + count {
            assert_ok(member.propose_data(test_key(i), test_value(i)));
        }
    }

    /// Let every open member apply what has been committed.
    pub fn tick_all(&self) {
        for entry in self.members.values() {
            assert_ok(entry.member.tick());
        }
    }

    /// Prune on every open member.
    pub fn prune_all(&self) {
        for entry in self.members.values() {
            assert_ok(entry.member.prune_now());
        }
    }

    #[track_caller]
    pub fn assert_has_entries(&self, id: MemberId, from: usize, count: usize) {
        let engine = self.engine(id);
        for i in from..from + count {
            assert_eq!(
                engine.get(&test_key(i)),
                Some(test_value(i)),
                "member {} is missing key {}",
                id,
                i
            );
        }
    }
}
