//! Catch-up of a lagging member from another member of its partition
//!
//! The requesting side locates a source, asks it which catch-up path it can
//! serve, and then either copies a snapshot followed by the events after it,
//! or copies events only.

pub mod controller;
pub mod provider;
pub mod responder;
pub mod strategy;

pub use controller::*;
pub use provider::*;
pub use responder::*;
pub use strategy::*;

use async_trait::async_trait;
use quorum_core::{NodeId, Position};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::snapshot::{SnapshotChunk, SnapshotError};

/// Restore error types
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Node {0} has neither a usable snapshot nor the requested events")]
    NoReplicationTarget(NodeId),

    #[error("Snapshot restore info missing from response of node {0}")]
    MissingSnapshotInfo(NodeId),

    #[error("Request to node {node} failed: {message}")]
    Transport { node: NodeId, message: String },

    #[error("Event replication from node {node} failed: {message}")]
    Replication { node: NodeId, message: String },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, RestoreError>;

/// How the source will bring the requester up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationTarget {
    None,
    Events,
    Snapshot,
}

impl fmt::Display for ReplicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationTarget::None => write!(f, "NONE"),
            ReplicationTarget::Events => write!(f, "EVENTS"),
            ReplicationTarget::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInfoRequest {
    /// Position of the last event the requester holds
    pub latest_local_position: Position,
    /// Position the requester must reach
    pub backup_position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRestoreInfo {
    pub snapshot_id: String,
    pub number_of_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInfoResponse {
    pub replication_target: ReplicationTarget,
    /// Present when the target is a snapshot
    pub snapshot_restore_info: Option<SnapshotRestoreInfo>,
}

impl RestoreInfoResponse {
    pub fn none() -> Self {
        Self { replication_target: ReplicationTarget::None, snapshot_restore_info: None }
    }

    pub fn events() -> Self {
        Self { replication_target: ReplicationTarget::Events, snapshot_restore_info: None }
    }

    pub fn snapshot(snapshot_id: String, number_of_chunks: u32) -> Self {
        Self {
            replication_target: ReplicationTarget::Snapshot,
            snapshot_restore_info: Some(SnapshotRestoreInfo { snapshot_id, number_of_chunks }),
        }
    }
}

/// Request for one chunk of the source's latest snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunkRequest {
    pub snapshot_id: String,
    pub chunk_index: u32,
}

/// Requests sent to a restore source
#[async_trait]
pub trait RestoreClient: Send + Sync {
    async fn request_restore_info(
        &self,
        source: NodeId,
        request: RestoreInfoRequest,
    ) -> Result<RestoreInfoResponse>;

    async fn request_snapshot_chunk(
        &self,
        source: NodeId,
        request: SnapshotChunkRequest,
    ) -> Result<SnapshotChunk>;
}

/// Copies events in a position range from a source into the local log
#[async_trait]
pub trait EventReplicator: Send + Sync {
    /// Replicate events from `from` up to `to`, returning the last position copied
    async fn replicate(&self, source: NodeId, from: Position, to: Position) -> Result<Position>;
}
