//! RAFT Consensus Implementation
//!
//! A partition's replicated log is driven by a single [`RaftContext`], which
//! owns the journal, the persisted term/vote and the current role. The
//! [`RaftServer`] actor serializes every timer tick, inbound message and
//! append request through that context.

pub mod appender;
pub mod cluster;
pub mod config;
pub mod context;
pub mod log;
pub mod role;
pub mod rpc;
pub mod server;
pub mod state;
pub mod transport;

pub use appender::*;
pub use cluster::*;
pub use config::*;
pub use context::*;
pub use log::*;
pub use role::*;
pub use rpc::*;
pub use server::*;
pub use state::*;
pub use transport::*;

pub use quorum_core::{LogIndex, NodeId, Position, Term};

use serde::{Deserialize, Serialize};
use std::fmt;

/// RAFT node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Follower - accepts log entries from leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - coordinates log replication
    Leader,
    /// Passive - replicates the log but never votes or campaigns
    Passive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::Passive => write!(f, "Passive"),
        }
    }
}

/// RAFT error types
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No leader elected within {0:?}")]
    NoLeader(std::time::Duration),

    #[error("Server for node {0} has shut down")]
    Shutdown(NodeId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
