//! RAFT node state management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{LogIndex, NodeId, RaftError, Result, Term};

/// Persistent state (must be saved to stable storage before it is acted on)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    /// Latest term server has seen (initialized to 0)
    pub term: Term,

    /// Candidate ID that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// Stable storage for the term and vote
pub trait MetaStore: Send {
    fn load(&self) -> Result<MetaState>;

    fn store(&mut self, state: &MetaState) -> Result<()>;
}

/// In-memory meta store (for testing)
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    state: MetaState,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn load(&self) -> Result<MetaState> {
        Ok(self.state.clone())
    }

    fn store(&mut self, state: &MetaState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }
}

/// Meta store backed by a single file, replaced atomically on every store
#[derive(Debug, Clone)]
pub struct FileMetaStore {
    path: PathBuf,
}

impl FileMetaStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl MetaStore for FileMetaStore {
    fn load(&self) -> Result<MetaState> {
        match fs::read(&self.path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(|e| {
                RaftError::StorageError(format!("Corrupt meta file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetaState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, state: &MetaState) -> Result<()> {
        let bytes = bincode::serialize(state)
            .map_err(|e| RaftError::StorageError(format!("Failed to encode meta state: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Leader-side replication progress for each member
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each member, index of next log entry to send
    pub next_index: HashMap<NodeId, LogIndex>,

    /// For each member, index of highest log entry known to be replicated
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    /// Create new leader state for the given members
    pub fn new(members: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for &member in members {
            next_index.insert(member, last_log_index + 1);
            match_index.insert(member, 0);
        }

        Self { next_index, match_index }
    }

    /// Resend from the entry after the member's reported last index.
    ///
    /// The hint may move `next_index` forward when the member appended part of
    /// a batch before failing. It is capped at the leader's log and never
    /// drops to or below what the member is known to hold.
    pub fn reject(&mut self, member: NodeId, last_log_index: LogIndex, leader_last: LogIndex) {
        let matched = self.match_index.get(&member).copied().unwrap_or(0);
        if let Some(next_idx) = self.next_index.get_mut(&member) {
            *next_idx = (last_log_index + 1).min(leader_last + 1).max(matched + 1);
        }
    }

    /// Update indices after successful replication
    pub fn update_progress(&mut self, member: NodeId, match_idx: LogIndex) {
        self.match_index.insert(member, match_idx);
        self.next_index.insert(member, match_idx + 1);
    }

    /// Highest index stored on a majority of `voters`, counting the leader's own log
    pub fn quorum_index(&self, voters: &[NodeId], leader_id: NodeId, leader_last: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = voters
            .iter()
            .map(|id| {
                if *id == leader_id {
                    leader_last
                } else {
                    self.match_index.get(id).copied().unwrap_or(0)
                }
            })
            .collect();

        if indices.is_empty() {
            return leader_last;
        }

        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[quorum_core::quorum_size(indices.len()) - 1]
    }
}
