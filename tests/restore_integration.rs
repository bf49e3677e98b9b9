//! End-to-end restore of a lagging member

mod common;

use common::{log_covering, store_with_snapshot, InProcessRestoreClient, RecordingReplicator};
use quorum::raft::{InMemoryRaftCluster, RaftConfig, Role};
use quorum::restore::{
    restore_source_provider, RaftClusterView, ReplicationTarget, RestoreController, RestoreError,
    RestoreInfoRequest, RestoreInfoResponder,
};
use quorum::snapshot::{SnapshotId, SnapshotStore};
use quorum_config::{RestoreSection, RestoreSourceKind};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CHUNK_SIZE: usize = 4;

#[tokio::test]
async fn test_restore_from_snapshot_then_events() {
    let source_dir = TempDir::new().unwrap();
    let snapshot_id = SnapshotId::new(10, 1, 10, 0);
    let source_store = store_with_snapshot(source_dir.path(), snapshot_id, b"0123456789").await;
    let responder = RestoreInfoResponder::new(source_store, CHUNK_SIZE);

    let request = RestoreInfoRequest { latest_local_position: 5, backup_position: 20 };
    let response = responder.respond(&request, &log_covering(1, 4, 5)).await.unwrap();
    assert_eq!(response.replication_target, ReplicationTarget::Snapshot);
    assert_eq!(response.snapshot_restore_info.as_ref().unwrap().number_of_chunks, 3);

    let client = Arc::new(InProcessRestoreClient::default().with_source(2, responder, log_covering(1, 4, 5)));
    let replicator = Arc::new(RecordingReplicator::default());
    let cluster = Arc::new(StaticLeader(2));
    let local_dir = TempDir::new().unwrap();
    let local_store = SnapshotStore::open(local_dir.path()).await.unwrap();

    let controller = RestoreController::new(
        restore_source_provider(RestoreSourceKind::Leader, cluster),
        client,
        replicator.clone(),
        local_store.clone(),
    );
    let outcome = controller.restore(5, 20).await.unwrap();

    assert_eq!(outcome.target, ReplicationTarget::Snapshot);
    assert_eq!(outcome.last_position, 20);
    let installed = local_store.latest_snapshot().await.unwrap();
    assert_eq!(installed.id(), snapshot_id);
    installed.verify().await.unwrap();
    let content = tokio::fs::read(installed.path().join("state")).await.unwrap();
    assert_eq!(content, b"0123456789");

    // Events resume at the snapshot's processed position
    assert_eq!(*replicator.calls.lock().unwrap(), vec![(2, 10, 20)]);
}

#[tokio::test]
async fn test_restore_replaces_older_local_snapshot() {
    let source_dir = TempDir::new().unwrap();
    let snapshot_id = SnapshotId::new(10, 1, 10, 0);
    let source_store = store_with_snapshot(source_dir.path(), snapshot_id, b"0123456789").await;
    let responder = RestoreInfoResponder::new(source_store, CHUNK_SIZE);
    let client = Arc::new(InProcessRestoreClient::default().with_source(2, responder, log_covering(1, 4, 5)));
    let replicator = Arc::new(RecordingReplicator::default());

    let local_dir = TempDir::new().unwrap();
    let older_id = SnapshotId::new(3, 1, 3, 0);
    let local_store = store_with_snapshot(local_dir.path(), older_id, b"old").await;

    let controller = RestoreController::new(
        restore_source_provider(RestoreSourceKind::Leader, Arc::new(StaticLeader(2))),
        client,
        replicator.clone(),
        local_store.clone(),
    );
    let outcome = controller.restore(3, 20).await.unwrap();

    assert_eq!(outcome.snapshot.as_ref().map(|snapshot| snapshot.id()), Some(snapshot_id));
    assert_eq!(local_store.list_snapshots().await.unwrap(), vec![snapshot_id]);
    assert!(!local_dir.path().join("snapshots").join(older_id.to_string()).exists());
    assert_eq!(*replicator.calls.lock().unwrap(), vec![(2, 10, 20)]);
}

#[tokio::test]
async fn test_restore_events_only_and_unsupported_target() {
    let source_dir = TempDir::new().unwrap();
    let source_store = SnapshotStore::open(source_dir.path()).await.unwrap();
    let responder = RestoreInfoResponder::new(source_store, CHUNK_SIZE);
    let client = Arc::new(InProcessRestoreClient::default().with_source(3, responder, log_covering(1, 4, 5)));
    let replicator = Arc::new(RecordingReplicator::default());
    let local_dir = TempDir::new().unwrap();
    let local_store = SnapshotStore::open(local_dir.path()).await.unwrap();

    let controller = RestoreController::new(
        restore_source_provider(RestoreSourceKind::Registry, Arc::new(StaticLeader(3))),
        client,
        replicator.clone(),
        local_store.clone(),
    )
    .with_poll_interval(Duration::from_millis(RestoreSection::default().source_poll_interval_ms));

    let outcome = controller.restore(8, 19).await.unwrap();
    assert_eq!(outcome.target, ReplicationTarget::Events);
    assert_eq!(*replicator.calls.lock().unwrap(), vec![(3, 8, 19)]);

    let result = controller.restore(100, 120).await;
    assert!(matches!(result, Err(RestoreError::NoReplicationTarget(3))));
    assert!(local_store.latest_snapshot().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_leader_provider_over_running_cluster() {
    let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();
    let leader = cluster.wait_for_leader(Duration::from_secs(30)).await.unwrap();
    let leader_id = leader.id();

    // A restoring leader gives up leadership and restores from its successor
    let view = Arc::new(RaftClusterView::new(leader.clone(), vec![1, 2, 3]));
    let provider = restore_source_provider(RestoreSourceKind::Leader, view);

    let source = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(source) = provider.find_restore_source().await {
                return source;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();

    assert_ne!(source, leader_id);
    assert_ne!(leader.current_status().role, Role::Leader);

    cluster.shutdown().await;
}

/// Cluster view with a fixed remote leader
struct StaticLeader(quorum::NodeId);

#[async_trait::async_trait]
impl quorum::restore::ClusterView for StaticLeader {
    fn local_id(&self) -> quorum::NodeId {
        1
    }

    async fn leader(&self) -> Option<quorum::NodeId> {
        Some(self.0)
    }

    async fn peers(&self) -> Vec<quorum::NodeId> {
        vec![self.0]
    }

    async fn step_down(&self) {}
}
