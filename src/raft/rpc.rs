//! RAFT RPC message definitions

use serde::{Deserialize, Serialize};

use super::{LogEntry, LogIndex, NodeId, Term};

/// Vote request - sent by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True means candidate received vote
    pub vote_granted: bool,
}

/// Append request - used for log replication and heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term
    pub term: Term,

    /// So follower can redirect clients
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// CRC32 of each serialized entry, when the leader sends them
    pub checksums: Option<Vec<u32>>,

    /// Leader's commit index
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if every entry in the request was accepted
    pub succeeded: bool,

    /// Receiver's last log index; the leader resends from the entry after it
    pub last_log_index: LogIndex,
}

/// Message envelope exchanged between members of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    Vote(VoteRequest),
    VoteResponse(VoteResponse),
    Append(AppendRequest),
    AppendResponse(AppendResponse),
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::Vote(req) => req.term,
            RaftMessage::VoteResponse(resp) => resp.term,
            RaftMessage::Append(req) => req.term,
            RaftMessage::AppendResponse(resp) => resp.term,
        }
    }
}

impl AppendRequest {
    /// Create a heartbeat (empty append request)
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        commit_index: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            checksums: None,
            commit_index,
        }
    }

    /// Check if this is a heartbeat
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VoteRequest {
    /// Create a vote request
    pub fn new(term: Term, candidate_id: NodeId, last_log_index: LogIndex, last_log_term: Term) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}
