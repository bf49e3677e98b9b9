//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use quorum::raft::{LogEntry, MemoryLog, ReplicatedLog};
use quorum::restore::{
    EventReplicator, RestoreClient, RestoreError, RestoreInfoRequest, RestoreInfoResponder,
    RestoreInfoResponse, Result, SnapshotChunkRequest,
};
use quorum::snapshot::{SnapshotChunk, SnapshotId, SnapshotStore};
use quorum::{NodeId, Position};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Open a store under `root` holding one snapshot with a single `state` file
pub async fn store_with_snapshot(root: &Path, id: SnapshotId, content: &[u8]) -> SnapshotStore {
    let store = SnapshotStore::open(root).await.unwrap();
    let mut transient = store
        .new_transient_snapshot(id.index, id.term, id.processed_position, id.exporter_position)
        .await
        .unwrap();
    let content = content.to_vec();
    transient
        .take(|dir| async move { tokio::fs::write(dir.join("state"), content).await })
        .await
        .unwrap();
    transient.persist().await.unwrap();
    store
}

/// Log whose application entries cover consecutive position ranges of `width`
pub fn log_covering(first_position: Position, entries: u64, width: u64) -> MemoryLog {
    let mut log = MemoryLog::new();
    for index in 1..=entries {
        let low = first_position + (index - 1) * width;
        log.append(LogEntry::application(1, index, low, low + width - 1, Vec::new())).unwrap();
    }
    log
}

/// Routes restore requests to in-process sources by node id
#[derive(Default)]
pub struct InProcessRestoreClient {
    sources: HashMap<NodeId, (RestoreInfoResponder, MemoryLog)>,
}

impl InProcessRestoreClient {
    pub fn with_source(mut self, id: NodeId, responder: RestoreInfoResponder, log: MemoryLog) -> Self {
        self.sources.insert(id, (responder, log));
        self
    }

    fn source(&self, id: NodeId) -> Result<&(RestoreInfoResponder, MemoryLog)> {
        self.sources.get(&id).ok_or_else(|| RestoreError::Transport {
            node: id,
            message: "unknown node".to_string(),
        })
    }
}

#[async_trait]
impl RestoreClient for InProcessRestoreClient {
    async fn request_restore_info(
        &self,
        source: NodeId,
        request: RestoreInfoRequest,
    ) -> Result<RestoreInfoResponse> {
        let (responder, log) = self.source(source)?;
        responder.respond(&request, log).await
    }

    async fn request_snapshot_chunk(
        &self,
        source: NodeId,
        request: SnapshotChunkRequest,
    ) -> Result<SnapshotChunk> {
        let (responder, _) = self.source(source)?;
        responder.read_chunk(&request).await
    }
}

/// Records every replication request and reports it as fully replicated
#[derive(Default)]
pub struct RecordingReplicator {
    pub calls: Mutex<Vec<(NodeId, Position, Position)>>,
}

#[async_trait]
impl EventReplicator for RecordingReplicator {
    async fn replicate(&self, source: NodeId, from: Position, to: Position) -> Result<Position> {
        self.calls.lock().unwrap().push((source, from, to));
        Ok(to)
    }
}
