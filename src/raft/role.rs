//! Per-role state held by a partition's context

use std::collections::{HashSet, VecDeque};

use super::{AppendListener, Indexed, LeaderState, LogEntry, NodeId, PendingAppend, Role};

/// Follower state: election timer only
#[derive(Debug, Clone)]
pub struct FollowerRole {
    pub elapsed: u64,
    pub timeout: u64,
}

/// Candidate state for the current vote round
#[derive(Debug, Clone)]
pub struct CandidateRole {
    pub votes: HashSet<NodeId>,
    pub elapsed: u64,
    pub timeout: u64,
    /// 1-based round number; each round runs in a new term
    pub round: u32,
}

/// Leader state. Exists only for the duration of one leadership term.
pub struct LeaderRole {
    pub progress: LeaderState,
    pub heartbeat_elapsed: u64,

    /// Appends accepted but not yet written, in submission order
    pub pending: VecDeque<PendingAppend>,

    /// Written entries waiting for the commit index, in index order
    pub uncommitted: VecDeque<(Indexed, Box<dyn AppendListener>)>,

    /// Last application entry written, used to validate the next one
    pub last_application: Option<LogEntry>,

    /// Cleared once the role is closed; no further appends are taken
    pub open: bool,
}

impl LeaderRole {
    pub fn new(progress: LeaderState, last_application: Option<LogEntry>) -> Self {
        Self {
            progress,
            heartbeat_elapsed: 0,
            pending: VecDeque::new(),
            uncommitted: VecDeque::new(),
            last_application,
            open: true,
        }
    }
}

impl std::fmt::Debug for LeaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderRole")
            .field("progress", &self.progress)
            .field("heartbeat_elapsed", &self.heartbeat_elapsed)
            .field("pending", &self.pending.len())
            .field("uncommitted", &self.uncommitted.len())
            .field("open", &self.open)
            .finish()
    }
}

/// Passive members hold no timers
#[derive(Debug, Clone, Default)]
pub struct PassiveRole;

/// The active role of a partition; exactly one at a time
#[derive(Debug)]
pub enum RoleState {
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
    Passive(PassiveRole),
}

impl RoleState {
    pub fn role(&self) -> Role {
        match self {
            RoleState::Follower(_) => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
            RoleState::Passive(_) => Role::Passive,
        }
    }

    pub fn follower(timeout: u64) -> Self {
        RoleState::Follower(FollowerRole { elapsed: 0, timeout })
    }

    /// Restart the election timer after hearing from a leader or granting a vote
    pub fn reset_election_timer(&mut self) {
        match self {
            RoleState::Follower(follower) => follower.elapsed = 0,
            RoleState::Candidate(candidate) => candidate.elapsed = 0,
            RoleState::Leader(_) | RoleState::Passive(_) => {}
        }
    }

    pub fn as_leader_mut(&mut self) -> Option<&mut LeaderRole> {
        match self {
            RoleState::Leader(leader) => Some(leader),
            _ => None,
        }
    }
}
