//! Choosing and executing a catch-up path

use quorum_core::{NodeId, Position};
use tracing::{debug, info, warn};

use super::{
    EventReplicator, ReplicationTarget, RestoreClient, RestoreError, RestoreInfoRequest,
    RestoreInfoResponse, Result, SnapshotChunkRequest,
};
use crate::snapshot::{PersistedSnapshot, SnapshotId, SnapshotStore};

/// The catch-up path picked from a source's restore info
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStrategy {
    /// Copy events from the requester's position up to the backup position
    Events { from: Position, to: Position },
    /// Copy the source's snapshot, then the events following it
    Snapshot {
        snapshot_id: SnapshotId,
        chunk_count: u32,
        from: Position,
        to: Position,
    },
}

impl RestoreStrategy {
    /// Turn a source's answer into a strategy.
    ///
    /// A `None` target has no catch-up path and fails.
    pub fn pick(
        source: NodeId,
        request: &RestoreInfoRequest,
        response: &RestoreInfoResponse,
    ) -> Result<Self> {
        match response.replication_target {
            ReplicationTarget::None => Err(RestoreError::NoReplicationTarget(source)),
            ReplicationTarget::Events => Ok(Self::Events {
                from: request.latest_local_position,
                to: request.backup_position,
            }),
            ReplicationTarget::Snapshot => {
                let info = response
                    .snapshot_restore_info
                    .as_ref()
                    .ok_or(RestoreError::MissingSnapshotInfo(source))?;
                let snapshot_id: SnapshotId = info.snapshot_id.parse()?;
                let (from, to) = events_after_snapshot(&snapshot_id, request);
                Ok(Self::Snapshot { snapshot_id, chunk_count: info.number_of_chunks, from, to })
            }
        }
    }

    pub fn target(&self) -> ReplicationTarget {
        match self {
            Self::Events { .. } => ReplicationTarget::Events,
            Self::Snapshot { .. } => ReplicationTarget::Snapshot,
        }
    }

    /// Run the strategy against `source`
    pub async fn execute(
        &self,
        source: NodeId,
        client: &dyn RestoreClient,
        replicator: &dyn EventReplicator,
        store: &SnapshotStore,
    ) -> Result<RestoreOutcome> {
        match self {
            Self::Events { from, to } => {
                info!("Restoring events {}..={} from node {}", from, to, source);
                let last_position = replicator.replicate(source, *from, *to).await?;
                Ok(RestoreOutcome { target: self.target(), snapshot: None, last_position })
            }
            Self::Snapshot { snapshot_id, chunk_count, from, to } => {
                info!(
                    "Restoring snapshot {} ({} chunks) and events {}..={} from node {}",
                    snapshot_id, chunk_count, from, to, source
                );
                let snapshot = transfer_snapshot(source, snapshot_id, *chunk_count, client, store).await?;
                let last_position = replicator.replicate(source, *from, *to).await?;
                Ok(RestoreOutcome { target: self.target(), snapshot: Some(snapshot), last_position })
            }
        }
    }
}

/// Range of events to copy after installing `snapshot_id`.
///
/// Starts at the exporter position when one is recorded, and never before what
/// the requester already holds.
fn events_after_snapshot(snapshot_id: &SnapshotId, request: &RestoreInfoRequest) -> (Position, Position) {
    let processed = snapshot_id.processed_position;
    let exported = if snapshot_id.exporter_position > 0 {
        snapshot_id.exporter_position
    } else {
        processed
    };
    let from = request.latest_local_position.max(processed.min(exported));
    let to = processed.max(request.backup_position);
    (from, to)
}

async fn transfer_snapshot(
    source: NodeId,
    snapshot_id: &SnapshotId,
    chunk_count: u32,
    client: &dyn RestoreClient,
    store: &SnapshotStore,
) -> Result<PersistedSnapshot> {
    if let Some(latest) = store.latest_snapshot().await {
        if latest.id() == *snapshot_id {
            debug!("Snapshot {} already present, skipping transfer", snapshot_id);
            return Ok(latest);
        }
    }

    let id = snapshot_id.to_string();
    let mut received = store.new_received_snapshot(&id).await?;

    for chunk_index in 0..chunk_count {
        let request = SnapshotChunkRequest { snapshot_id: id.clone(), chunk_index };
        let applied = match client.request_snapshot_chunk(source, request).await {
            Ok(chunk) => received.apply(&chunk).await.map_err(RestoreError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            warn!("Failed to receive chunk {} of snapshot {} from node {}: {}", chunk_index, id, source, e);
            if let Err(abort_error) = received.abort().await {
                warn!("Failed to clean up snapshot {}: {}", id, abort_error);
            }
            return Err(e);
        }
    }

    match received.persist().await {
        Ok(snapshot) => Ok(snapshot),
        Err(e) => {
            if let Err(abort_error) = received.abort().await {
                warn!("Failed to clean up snapshot {}: {}", id, abort_error);
            }
            Err(e.into())
        }
    }
}

/// Result of a completed restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub target: ReplicationTarget,
    /// Snapshot installed before replicating events, if any
    pub snapshot: Option<PersistedSnapshot>,
    /// Last position copied by event replication
    pub last_position: Position,
}
