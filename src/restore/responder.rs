//! Source side of a restore: answering info and chunk requests

use quorum_core::Position;
use tracing::debug;

use super::{RestoreInfoRequest, RestoreInfoResponse, Result, SnapshotChunkRequest};
use crate::raft::ReplicatedLog;
use crate::snapshot::{SnapshotChunk, SnapshotError, SnapshotStore};

/// Answers restore requests from the local snapshot store and log
#[derive(Clone)]
pub struct RestoreInfoResponder {
    store: SnapshotStore,
    max_chunk_size: usize,
}

impl RestoreInfoResponder {
    pub fn new(store: SnapshotStore, max_chunk_size: usize) -> Self {
        Self { store, max_chunk_size }
    }

    /// Pick the catch-up path for a requester.
    ///
    /// The latest snapshot is offered when it covers the requester's position
    /// and has at least one chunk; otherwise events are offered when the log
    /// can be read from the requester's exact position.
    pub async fn respond<L>(&self, request: &RestoreInfoRequest, log: &L) -> Result<RestoreInfoResponse>
    where
        L: ReplicatedLog + Sync + ?Sized,
    {
        let local = request.latest_local_position;

        if let Some(snapshot) = self.store.latest_snapshot().await {
            if snapshot.processed_position() >= local {
                let chunks = snapshot.chunk_count(self.max_chunk_size).await?;
                if chunks > 0 {
                    debug!("Offering snapshot {} with {} chunks for position {}", snapshot.id(), chunks, local);
                    return Ok(RestoreInfoResponse::snapshot(snapshot.id().to_string(), chunks));
                }
            }
        }

        if can_read_from(log, local) {
            debug!("Offering events from position {}", local);
            return Ok(RestoreInfoResponse::events());
        }

        debug!("No restore path for position {}", local);
        Ok(RestoreInfoResponse::none())
    }

    /// Serve one chunk of the latest snapshot
    pub async fn read_chunk(&self, request: &SnapshotChunkRequest) -> Result<SnapshotChunk> {
        let snapshot = self
            .store
            .latest_snapshot()
            .await
            .filter(|snapshot| snapshot.id().to_string() == request.snapshot_id)
            .ok_or_else(|| SnapshotError::NotFound(request.snapshot_id.clone()))?;

        let reader = snapshot.chunk_reader(self.max_chunk_size).await?;
        reader.chunk_at(request.chunk_index as usize).await?.ok_or_else(|| {
            SnapshotError::NotFound(format!(
                "chunk {} of snapshot {}",
                request.chunk_index, request.snapshot_id
            ))
            .into()
        })
    }
}

fn can_read_from<L: ReplicatedLog + ?Sized>(log: &L, position: Position) -> bool {
    log.seek_position(position).is_some()
}
