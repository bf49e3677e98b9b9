//! Configuration structures for quorum

use quorum_core::{Member, NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for a quorum node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Cluster membership and data location
    pub cluster: ClusterSection,
    /// Consensus timing and append behavior
    pub raft: RaftSection,
    /// Snapshot store configuration
    pub snapshot: SnapshotSection,
    /// Restore controller configuration
    pub restore: RestoreSection,
    /// Logging configuration
    pub logging: LoggingSection,
}

/// Cluster-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Cluster name
    pub name: String,
    /// Id of the local node
    pub node_id: NodeId,
    /// Partition replicated by this group
    pub partition_id: u32,
    /// Voting members (including the local node when it votes)
    pub members: Vec<NodeId>,
    /// Non-voting learners
    pub passive_members: Vec<NodeId>,
    /// Data directory
    pub data_directory: PathBuf,
}

impl ClusterSection {
    pub fn partition(&self) -> PartitionId {
        PartitionId::new(self.partition_id)
    }

    /// All members of the replication group, voting members first
    pub fn member_list(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|&id| Member::active(id))
            .chain(self.passive_members.iter().map(|&id| Member::passive(id)))
            .collect()
    }
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    /// Minimum election timeout in milliseconds
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds
    pub election_timeout_max_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Granularity of the role timers in milliseconds
    pub tick_interval_ms: u64,
    /// Maximum number of entries per append request
    pub max_append_entries: usize,
    /// Retries for transient journal failures on the leader
    pub max_append_retries: u32,
    /// Largest serialized entry the journal accepts, in bytes
    pub max_entry_size: usize,
    /// Send per-entry checksums with append requests
    pub checksums_enabled: bool,
    /// Vote rounds a candidate runs before falling back to follower
    pub max_candidate_rounds: u32,
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// Directory (relative to the data directory) holding snapshots
    pub directory: PathBuf,
    /// Maximum size of a single transferred chunk in bytes
    pub chunk_size: usize,
}

/// How a lagging node picks the node it restores from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreSourceKind {
    /// Restore from the current leader
    Leader,
    /// Restore from any other registered member
    Registry,
}

impl Default for RestoreSourceKind {
    fn default() -> Self {
        Self::Leader
    }
}

/// Restore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSection {
    /// Delay between attempts to find a restore source, in milliseconds
    pub source_poll_interval_ms: u64,
    /// Provider used to find a restore source
    pub source: RestoreSourceKind,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (structured)
    Json,
    /// Human-readable format
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "default-cluster".to_string(),
            node_id: 1,
            partition_id: 1,
            members: vec![1],
            passive_members: Vec::new(),
            data_directory: PathBuf::from("./data"),
        }
    }
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_interval_ms: 250,
            tick_interval_ms: 50,
            max_append_entries: 100,
            max_append_retries: 5,
            max_entry_size: 4 * 1024 * 1024,
            checksums_enabled: true,
            max_candidate_rounds: 3,
        }
    }
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("snapshots"),
            chunk_size: 1024 * 1024,
        }
    }
}

impl Default for RestoreSection {
    fn default() -> Self {
        Self {
            source_poll_interval_ms: 100,
            source: RestoreSourceKind::default(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
        }
    }
}
