//! RestoreController - drives a lagging member back up to date

use quorum_core::{NodeId, Position};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    EventReplicator, RestoreClient, RestoreInfoRequest, RestoreOutcome, RestoreSourceProvider,
    RestoreStrategy, Result,
};
use crate::snapshot::SnapshotStore;

pub const DEFAULT_SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RestoreController {
    provider: Arc<dyn RestoreSourceProvider>,
    client: Arc<dyn RestoreClient>,
    replicator: Arc<dyn EventReplicator>,
    store: SnapshotStore,
    poll_interval: Duration,
}

impl RestoreController {
    pub fn new(
        provider: Arc<dyn RestoreSourceProvider>,
        client: Arc<dyn RestoreClient>,
        replicator: Arc<dyn EventReplicator>,
        store: SnapshotStore,
    ) -> Self {
        Self {
            provider,
            client,
            replicator,
            store,
            poll_interval: DEFAULT_SOURCE_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wait until the provider names a source
    pub async fn find_restore_source(&self) -> NodeId {
        let mut attempts: u64 = 0;
        loop {
            if let Some(source) = self.provider.find_restore_source().await {
                debug!("Found restore source {} after {} attempts", source, attempts + 1);
                return source;
            }
            attempts += 1;
            if attempts % 50 == 0 {
                info!("Still looking for a restore source after {} attempts", attempts);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Bring the local member from `latest_local_position` up to at least
    /// `backup_position`.
    ///
    /// Nothing is written locally before the strategy starts transferring
    /// data. On error the caller restarts with a fresh source.
    pub async fn restore(
        &self,
        latest_local_position: Position,
        backup_position: Position,
    ) -> Result<RestoreOutcome> {
        let source = self.find_restore_source().await;

        let request = RestoreInfoRequest { latest_local_position, backup_position };
        let response = self.client.request_restore_info(source, request).await?;
        debug!("Node {} answered restore info with {}", source, response.replication_target);

        let strategy = RestoreStrategy::pick(source, &request, &response)?;
        let outcome = strategy
            .execute(source, self.client.as_ref(), self.replicator.as_ref(), &self.store)
            .await?;

        info!(
            "Restored from node {} via {} up to position {}",
            source, outcome.target, outcome.last_position
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{LogEntry, MemoryLog, ReplicatedLog};
    use crate::restore::{
        ReplicationTarget, RestoreError, RestoreInfoResponder, RestoreInfoResponse,
        SnapshotChunkRequest,
    };
    use crate::snapshot::SnapshotChunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves restore requests from one in-process source
    struct SourceClient {
        responder: RestoreInfoResponder,
        log: MemoryLog,
        fail_chunk: Option<u32>,
    }

    #[async_trait]
    impl RestoreClient for SourceClient {
        async fn request_restore_info(
            &self,
            _source: NodeId,
            request: RestoreInfoRequest,
        ) -> Result<RestoreInfoResponse> {
            self.responder.respond(&request, &self.log).await
        }

        async fn request_snapshot_chunk(
            &self,
            source: NodeId,
            request: SnapshotChunkRequest,
        ) -> Result<SnapshotChunk> {
            if self.fail_chunk == Some(request.chunk_index) {
                return Err(RestoreError::Transport { node: source, message: "connection reset".to_string() });
            }
            self.responder.read_chunk(&request).await
        }
    }

    #[derive(Default)]
    struct RecordingReplicator {
        calls: Mutex<Vec<(NodeId, Position, Position)>>,
    }

    #[async_trait]
    impl EventReplicator for RecordingReplicator {
        async fn replicate(&self, source: NodeId, from: Position, to: Position) -> Result<Position> {
            self.calls.lock().unwrap().push((source, from, to));
            Ok(to)
        }
    }

    /// Finds no source for the first `misses` attempts
    struct EventuallyAvailable {
        misses: u32,
        attempts: AtomicU32,
        source: NodeId,
    }

    #[async_trait]
    impl RestoreSourceProvider for EventuallyAvailable {
        async fn find_restore_source(&self) -> Option<NodeId> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            (attempt >= self.misses).then_some(self.source)
        }
    }

    fn source_log() -> MemoryLog {
        let mut log = MemoryLog::new();
        for (index, low) in (1..=4u64).zip([1u64, 6, 11, 16]) {
            log.append(LogEntry::application(1, index, low, low + 4, Vec::new())).unwrap();
        }
        log
    }

    async fn source_store(temp_dir: &TempDir) -> SnapshotStore {
        let store = SnapshotStore::open(temp_dir.path()).await.unwrap();
        let mut transient = store.new_transient_snapshot(10, 1, 10, 0).await.unwrap();
        transient
            .take(|dir| async move { tokio::fs::write(dir.join("state"), b"012345678").await })
            .await
            .unwrap();
        transient.persist().await.unwrap();
        store
    }

    struct Fixture {
        _source_dir: TempDir,
        _local_dir: TempDir,
        local_store: SnapshotStore,
        replicator: Arc<RecordingReplicator>,
        controller: RestoreController,
    }

    async fn fixture(with_snapshot: bool, fail_chunk: Option<u32>, misses: u32) -> Fixture {
        let source_dir = TempDir::new().unwrap();
        let store = if with_snapshot {
            source_store(&source_dir).await
        } else {
            SnapshotStore::open(source_dir.path()).await.unwrap()
        };
        let client = Arc::new(SourceClient {
            responder: RestoreInfoResponder::new(store, 3),
            log: source_log(),
            fail_chunk,
        });

        let local_dir = TempDir::new().unwrap();
        let local_store = SnapshotStore::open(local_dir.path()).await.unwrap();
        let replicator = Arc::new(RecordingReplicator::default());
        let provider = Arc::new(EventuallyAvailable { misses, attempts: AtomicU32::new(0), source: 2 });

        let controller = RestoreController::new(provider, client, replicator.clone(), local_store.clone());
        Fixture { _source_dir: source_dir, _local_dir: local_dir, local_store, replicator, controller }
    }

    #[tokio::test]
    async fn test_restore_via_snapshot() {
        let fixture = fixture(true, None, 0).await;

        let outcome = fixture.controller.restore(5, 15).await.unwrap();

        assert_eq!(outcome.target, ReplicationTarget::Snapshot);
        assert_eq!(outcome.last_position, 15);
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.id().to_string(), "10-1-10-0");
        snapshot.verify().await.unwrap();
        assert_eq!(fixture.local_store.latest_snapshot().await, Some(snapshot));
        assert_eq!(*fixture.replicator.calls.lock().unwrap(), vec![(2, 10, 15)]);
    }

    #[tokio::test]
    async fn test_restore_via_events() {
        let fixture = fixture(false, None, 0).await;

        let outcome = fixture.controller.restore(7, 18).await.unwrap();

        assert_eq!(outcome.target, ReplicationTarget::Events);
        assert!(outcome.snapshot.is_none());
        assert_eq!(*fixture.replicator.calls.lock().unwrap(), vec![(2, 7, 18)]);
    }

    #[tokio::test]
    async fn test_restore_without_target_fails() {
        let fixture = fixture(false, None, 0).await;

        let result = fixture.controller.restore(40, 50).await;

        assert!(matches!(result, Err(RestoreError::NoReplicationTarget(2))));
        assert!(fixture.replicator.calls.lock().unwrap().is_empty());
        assert!(fixture.local_store.latest_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_chunk_transfer_leaves_nothing_behind() {
        let fixture = fixture(true, Some(1), 0).await;

        let result = fixture.controller.restore(5, 15).await;

        assert!(matches!(result, Err(RestoreError::Transport { node: 2, .. })));
        assert!(fixture.local_store.latest_snapshot().await.is_none());
        assert!(fixture.replicator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_source_available() {
        let fixture = fixture(false, None, 5).await;
        let started = tokio::time::Instant::now();

        fixture.controller.restore(7, 18).await.unwrap();

        assert_eq!(started.elapsed(), DEFAULT_SOURCE_POLL_INTERVAL * 5);
    }

    #[test]
    fn test_source_log_positions() {
        let log = source_log();
        assert_eq!(log.seek_position(7), Some(2));
        assert_eq!(log.seek_position(21), None);
    }
}
