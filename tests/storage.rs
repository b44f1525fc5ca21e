//! Local log and snapshot recovery tests.

mod common;

use common::{assert_ok, TestCluster};
use lineage::consensus::ConsensusEngine;
use lineage::storage::{CommandLog, PrunableLog, SnapshotStore};
use lineage::StartOutcome;
use std::io::Write;

fn newest_segment(cluster: &TestCluster, id: u64) -> std::path::PathBuf {
    let mut segments: Vec<_> = std::fs::read_dir(cluster.settings(id).log_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    segments.sort();
    segments.pop().expect("log has segments")
}

// ============================================================================
// Log recovery
// ============================================================================

#[test]
fn torn_log_tail_is_truncated_on_open() {
    let mut cluster = TestCluster::bootstrap(&[1]);
    let pair = cluster.member(1).identity().expect("bootstrapped");
    cluster.write_entries(1, 0, 10);
    let applied = cluster.member(1).applied_position();
    cluster.crash(1);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(newest_segment(&cluster, 1))
        .unwrap();
    file.write_all(&[0xff, 0x01]).unwrap();
    drop(file);

    let member = cluster.open(1);
    assert_eq!(member.applied_position(), applied);
    cluster.assert_has_entries(1, 0, 10);
    assert_eq!(assert_ok(cluster.start(1)), StartOutcome::Rejoined(pair));

    // The truncated log accepts new entries.
    cluster.write_entries(1, 10, 3);
    assert_eq!(member.log_layout().last_index, cluster.consensus.last_position().index);
}

#[test]
fn lost_log_is_rebuilt_from_snapshot_and_cluster() {
    let mut cluster = TestCluster::bootstrap(&[1]);
    let pair = cluster.member(1).identity().expect("bootstrapped");
    cluster.write_entries(1, 0, 20);
    let snapshot = assert_ok(cluster.member(1).take_snapshot());
    cluster.write_entries(1, 20, 5);
    cluster.crash(1);

    std::fs::remove_dir_all(cluster.settings(1).log_dir()).unwrap();

    let member = cluster.open(1);
    assert_eq!(member.applied_position(), snapshot.position);
    assert_eq!(member.log_layout().first_index, snapshot.position.index + 1);
    cluster.assert_has_entries(1, 0, 20);

    assert_eq!(assert_ok(cluster.start(1)), StartOutcome::Rejoined(pair));
    cluster.assert_has_entries(1, 0, 25);
    assert_eq!(member.applied_position(), cluster.consensus.last_position());
    assert_eq!(member.log_layout().last_index, cluster.consensus.last_position().index);
}

#[test]
fn member_log_is_readable_offline() {
    let mut cluster = TestCluster::bootstrap(&[1]);
    cluster.write_entries(1, 0, 12);
    let last = cluster.member(1).applied_position();
    cluster.crash(1);

    let settings = cluster.settings(1);
    let log = assert_ok(CommandLog::open(settings.log_dir(), settings.log_rotation_size));
    assert_eq!(log.last_position(), last);
    assert_eq!(log.layout().entry_count(), last.index);
    assert!(log.layout().segments.len() > 1);
}

// ============================================================================
// Snapshot retention
// ============================================================================

#[test]
fn repeated_prunes_keep_bounded_snapshots() {
    let cluster = TestCluster::bootstrap(&[1]);
    for round in 0..4 {
        cluster.write_entries(1, round * 20, 20);
        assert!(assert_ok(cluster.member(1).prune_now()).is_some());
    }

    let member = cluster.member(1);
    let snapshots = member.snapshots().list();
    assert_eq!(snapshots.len(), member.settings().keep_snapshots);
    assert_eq!(
        snapshots[0].position.index,
        member.applied_position().index,
        "newest snapshot sits at the last prune point"
    );
    assert!(member.prune_stats().segments_removed > 0);

    // A fresh handle on the directory sees the same newest snapshot.
    let settings = cluster.settings(1);
    let store = assert_ok(SnapshotStore::open(settings.snapshot_dir()));
    assert_eq!(store.latest().map(|m| m.id), Some(snapshots[0].id.clone()));
    cluster.assert_has_entries(1, 0, 80);
}

#[test]
fn restart_reinstalls_newest_local_snapshot() {
    let mut cluster = TestCluster::bootstrap(&[1]);
    cluster.write_entries(1, 0, 30);
    assert_ok(cluster.member(1).prune_now());
    let newest = cluster
        .member(1)
        .snapshots()
        .latest()
        .expect("prune took a snapshot");

    let member = cluster.restart(1);
    assert!(member.applied_position() >= newest.position);
    assert_eq!(cluster.engine(1).len(), 30);
    assert!(member.log_layout().first_index <= newest.position.index + 1);
}
