//! Per-partition RAFT state machine
//!
//! `RaftContext` is fully synchronous and deterministic: time advances only
//! through [`RaftContext::tick`], and outbound messages are collected in an
//! outbox that the caller drains after every call. All role transitions,
//! appends and message handling for a partition go through one context, so
//! no two of them ever run concurrently.

use quorum_core::{quorum_size, Member, PartitionId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use super::{
    append_with_retry, AppendError, AppendListener, AppendRequest, AppendResponse,
    CandidateRole, ContiguousPositionValidator, EntryValidator, Indexed, LeaderRole, LeaderState,
    LogEntry, LogIndex, MetaState, MetaStore, NodeId, PassiveRole, PendingAppend, Position,
    RaftConfig, RaftError, RaftMessage, ReplicatedLog, Result, Role, RoleState, Term,
    ValidationResult, VoteRequest, VoteResponse,
};

/// Message queued for delivery to another member
pub type Envelope = (NodeId, RaftMessage);

pub struct RaftContext {
    id: NodeId,
    partition: PartitionId,
    members: Vec<Member>,
    config: RaftConfig,
    log: Box<dyn ReplicatedLog>,
    meta_store: Box<dyn MetaStore>,
    validator: Box<dyn EntryValidator>,
    meta: MetaState,
    leader_id: Option<NodeId>,
    role: RoleState,
    rng: StdRng,
    outbox: Vec<Envelope>,
}

impl RaftContext {
    /// Create the context for `id`, which must be one of `members`.
    ///
    /// Active members start as followers, passive members as passive.
    pub fn new(
        id: NodeId,
        partition: PartitionId,
        members: Vec<Member>,
        config: RaftConfig,
        log: Box<dyn ReplicatedLog>,
        meta_store: Box<dyn MetaStore>,
    ) -> Result<Self> {
        config.validate()?;

        let local = members
            .iter()
            .find(|member| member.id == id)
            .copied()
            .ok_or(RaftError::NodeNotFound(id))?;
        let meta = meta_store.load()?;

        let mut rng = StdRng::from_entropy();
        let role = if local.is_active() {
            RoleState::follower(config.election_timeout_ticks(&mut rng))
        } else {
            RoleState::Passive(PassiveRole)
        };

        info!(
            "Node {} joining {} as {} in term {}",
            id,
            partition,
            role.role(),
            meta.term
        );

        Ok(Self {
            id,
            partition,
            members,
            config,
            log,
            meta_store,
            validator: Box::new(ContiguousPositionValidator),
            meta,
            leader_id: None,
            role,
            rng,
            outbox: Vec::new(),
        })
    }

    /// Replace the validator applied to application entries
    pub fn with_validator(mut self, validator: Box<dyn EntryValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Seed the timer randomization, re-rolling the current election timeout
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        if let RoleState::Follower(follower) = &mut self.role {
            follower.timeout = self.config.election_timeout_ticks(&mut self.rng);
        }
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> Term {
        self.meta.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.meta.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log(&self) -> &dyn ReplicatedLog {
        self.log.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.log.commit_index()
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    /// Drain the messages produced since the last call
    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    fn local_is_active(&self) -> bool {
        self.members.iter().any(|member| member.id == self.id && member.is_active())
    }

    fn voters(&self) -> Vec<NodeId> {
        self.members.iter().filter(|member| member.is_active()).map(|member| member.id).collect()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.members.iter().map(|member| member.id).filter(|id| *id != self.id).collect()
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.log.entry(index).map(|indexed| indexed.term())
    }

    fn last_log_term(&self) -> Term {
        self.term_at(self.log.last_index()).unwrap_or(0)
    }

    fn persist_meta(&mut self) -> Result<()> {
        self.meta_store.store(&self.meta)
    }

    /// Adopt a higher term seen on any message; leaders and candidates step down
    fn observe_term(&mut self, term: Term) {
        if term <= self.meta.term {
            return;
        }

        debug!("Node {} moving from term {} to term {}", self.id, self.meta.term, term);
        self.meta.term = term;
        self.meta.voted_for = None;
        self.leader_id = None;
        if let Err(e) = self.persist_meta() {
            error!("Node {} failed to persist term {}: {}", self.id, term, e);
        }

        if matches!(self.role(), Role::Leader | Role::Candidate) {
            self.transition_with_reason(Role::Follower, &format!("observed higher term {}", term));
        }
    }

    /// Advance all role timers by one tick
    pub fn tick(&mut self) {
        let can_campaign = self.local_is_active();
        let max_rounds = self.config.max_candidate_rounds;
        let heartbeat_ticks = self.config.heartbeat_ticks();

        match &mut self.role {
            RoleState::Follower(follower) => {
                follower.elapsed += 1;
                if follower.elapsed >= follower.timeout && can_campaign {
                    debug!("Node {} election timeout expired", self.id);
                    self.transition(Role::Candidate);
                }
            }
            RoleState::Candidate(candidate) => {
                candidate.elapsed += 1;
                if candidate.elapsed >= candidate.timeout {
                    let round = candidate.round;
                    if round < max_rounds {
                        debug!("Node {} vote round {} timed out, retrying", self.id, round);
                        self.start_election(round + 1);
                    } else {
                        info!(
                            "Node {} failed to win an election after {} rounds",
                            self.id, round
                        );
                        self.transition_with_reason(Role::Follower, "election rounds exhausted");
                    }
                }
            }
            RoleState::Leader(leader) => {
                leader.heartbeat_elapsed += 1;
                if leader.heartbeat_elapsed >= heartbeat_ticks {
                    leader.heartbeat_elapsed = 0;
                    self.replicate_all();
                }
            }
            RoleState::Passive(_) => {}
        }
    }

    /// Request a role change
    pub fn transition(&mut self, target: Role) {
        let reason = format!("{} transitioned to {}", self.role(), target);
        self.transition_with_reason(target, &reason);
    }

    /// Demote a leader or candidate to follower
    pub fn step_down(&mut self) {
        if matches!(self.role(), Role::Leader | Role::Candidate) {
            self.transition_with_reason(Role::Follower, "leader stepped down");
        }
    }

    fn transition_with_reason(&mut self, target: Role, reason: &str) {
        let current = self.role();
        if current == target {
            return;
        }
        match target {
            Role::Candidate if !self.local_is_active() => {
                warn!("Node {} is a passive member and cannot become candidate", self.id);
                return;
            }
            Role::Leader if current != Role::Candidate => {
                warn!("Node {} can only become leader by winning an election", self.id);
                return;
            }
            _ => {}
        }

        info!(
            "Node {} transitioning from {} to {} in term {}",
            self.id, current, target, self.meta.term
        );

        let previous = std::mem::replace(&mut self.role, RoleState::Passive(PassiveRole));
        if let RoleState::Leader(leader) = previous {
            self.close_leader(leader, reason);
        }

        match target {
            Role::Follower => {
                let timeout = self.config.election_timeout_ticks(&mut self.rng);
                self.role = RoleState::follower(timeout);
            }
            Role::Passive => self.role = RoleState::Passive(PassiveRole),
            Role::Candidate => self.start_election(1),
            Role::Leader => self.become_leader(),
        }
    }

    /// Fail everything the closing leader still holds
    fn close_leader(&mut self, mut leader: LeaderRole, reason: &str) {
        leader.open = false;
        if self.leader_id == Some(self.id) {
            self.leader_id = None;
        }

        let error = AppendError::LeaderClosed(reason.to_string());
        for append in leader.pending.drain(..) {
            let mut listener = append.listener;
            listener.on_write_error(error.clone());
        }
        for (indexed, mut listener) in leader.uncommitted.drain(..) {
            listener.on_commit_error(&indexed, error.clone());
        }
    }

    fn start_election(&mut self, round: u32) {
        self.meta.term += 1;
        self.meta.voted_for = Some(self.id);
        self.leader_id = None;
        if let Err(e) = self.persist_meta() {
            error!("Node {} failed to persist vote for term {}: {}", self.id, self.meta.term, e);
            let timeout = self.config.election_timeout_ticks(&mut self.rng);
            self.role = RoleState::follower(timeout);
            return;
        }

        let mut votes = HashSet::new();
        votes.insert(self.id);
        let timeout = self.config.vote_round_ticks(&mut self.rng);
        self.role = RoleState::Candidate(CandidateRole { votes, elapsed: 0, timeout, round });

        info!("Node {} starting election round {} for term {}", self.id, round, self.meta.term);

        if self.has_vote_quorum() {
            self.become_leader();
            return;
        }

        let request =
            VoteRequest::new(self.meta.term, self.id, self.log.last_index(), self.last_log_term());
        for voter in self.voters().into_iter().filter(|voter| *voter != self.id) {
            self.outbox.push((voter, RaftMessage::Vote(request.clone())));
        }
    }

    fn has_vote_quorum(&self) -> bool {
        let voters = self.voters();
        match &self.role {
            RoleState::Candidate(candidate) => {
                let granted = candidate.votes.iter().filter(|id| voters.contains(*id)).count();
                granted >= quorum_size(voters.len())
            }
            _ => false,
        }
    }

    fn become_leader(&mut self) {
        let last_index = self.log.last_index();
        let last_application = self.log.last_application_entry().map(Indexed::into_entry);
        let progress = LeaderState::new(&self.peers(), last_index);

        self.leader_id = Some(self.id);
        self.role = RoleState::Leader(LeaderRole::new(progress, last_application));
        info!("Node {} became leader of {} for term {}", self.id, self.partition, self.meta.term);

        let initial = LogEntry::initial(self.meta.term, last_index + 1);
        if let Err(e) =
            append_with_retry(self.log.as_mut(), &initial, self.config.max_append_retries)
        {
            error!("Node {} failed to append initial entry: {}", self.id, e);
            self.transition_with_reason(Role::Follower, &e.to_string());
            return;
        }

        self.replicate_all();
        self.advance_commit();
    }

    /// Process one inbound message from `from`
    pub fn step(&mut self, from: NodeId, message: RaftMessage) {
        self.observe_term(message.term());

        match message {
            RaftMessage::Vote(request) => {
                let response = self.handle_vote(&request);
                self.outbox.push((from, RaftMessage::VoteResponse(response)));
            }
            RaftMessage::VoteResponse(response) => self.handle_vote_response(from, response),
            RaftMessage::Append(request) => {
                let response = self.handle_append(request);
                self.outbox.push((from, RaftMessage::AppendResponse(response)));
            }
            RaftMessage::AppendResponse(response) => self.handle_append_response(from, response),
        }
    }

    /// Handle a vote request. Passive members never grant votes.
    pub fn handle_vote(&mut self, request: &VoteRequest) -> VoteResponse {
        self.observe_term(request.term);
        let term = self.meta.term;
        let reject = VoteResponse { term, vote_granted: false };

        if self.role() == Role::Passive || !self.local_is_active() {
            debug!("Node {} is passive, rejecting vote for {}", self.id, request.candidate_id);
            return reject;
        }
        if request.term < term {
            return reject;
        }
        if !self.voters().contains(&request.candidate_id) {
            warn!("Node {} received vote request from non-voter {}", self.id, request.candidate_id);
            return reject;
        }

        let can_vote =
            self.meta.voted_for.is_none() || self.meta.voted_for == Some(request.candidate_id);

        let last_log_term = self.last_log_term();
        let last_log_index = self.log.last_index();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term && request.last_log_index >= last_log_index);

        if !(can_vote && log_ok) {
            return reject;
        }

        self.meta.voted_for = Some(request.candidate_id);
        if let Err(e) = self.persist_meta() {
            error!("Node {} failed to persist vote: {}", self.id, e);
            self.meta.voted_for = None;
            return reject;
        }
        self.role.reset_election_timer();

        info!("Node {} granted vote to {} for term {}", self.id, request.candidate_id, term);
        VoteResponse { term, vote_granted: true }
    }

    fn handle_vote_response(&mut self, from: NodeId, response: VoteResponse) {
        let term = self.meta.term;
        let RoleState::Candidate(candidate) = &mut self.role else {
            return;
        };
        if response.term != term || !response.vote_granted {
            return;
        }

        candidate.votes.insert(from);
        debug!("Node {} received vote from {} for term {}", self.id, from, term);

        if self.has_vote_quorum() {
            self.become_leader();
        }
    }

    fn append_failure(&self, last_log_index: LogIndex) -> AppendResponse {
        AppendResponse { term: self.meta.term, succeeded: false, last_log_index }
    }

    /// Handle an append request from a leader.
    ///
    /// Entries already present with the same term are skipped; a conflicting
    /// entry is truncated together with everything after it. When checksums
    /// are supplied every entry is verified before it is written, and the first
    /// failure at index `i` answers with `last_log_index = i - 1`.
    pub fn handle_append(&mut self, request: AppendRequest) -> AppendResponse {
        self.observe_term(request.term);

        debug!(
            "Node {} received append from {} for term {}, entries: {}",
            self.id,
            request.leader_id,
            request.term,
            request.entries.len()
        );

        if request.term < self.meta.term {
            return self.append_failure(self.log.last_index());
        }

        match self.role() {
            Role::Leader => {
                warn!(
                    "Node {} rejecting append from {}: already leader for term {}",
                    self.id, request.leader_id, self.meta.term
                );
                return self.append_failure(self.log.last_index());
            }
            Role::Candidate => {
                self.transition_with_reason(Role::Follower, "discovered leader for term");
            }
            Role::Follower | Role::Passive => {}
        }
        self.leader_id = Some(request.leader_id);
        self.role.reset_election_timer();

        if let Some(checksums) = &request.checksums {
            if checksums.len() != request.entries.len() {
                warn!(
                    "Node {} rejecting append with {} entries but {} checksums",
                    self.id,
                    request.entries.len(),
                    checksums.len()
                );
                return self.append_failure(self.log.last_index());
            }
        }

        let prev_index = request.prev_log_index;
        if prev_index > 0 {
            let last_index = self.log.last_index();
            if prev_index > last_index {
                debug!(
                    "Node {} missing previous entry {} (last index {})",
                    self.id, prev_index, last_index
                );
                return self.append_failure(last_index);
            }
            match self.term_at(prev_index) {
                Some(term) if term == request.prev_log_term => {}
                Some(term) => {
                    debug!(
                        "Node {} previous entry {} has term {}, leader expects {}",
                        self.id, prev_index, term, request.prev_log_term
                    );
                    return self.append_failure(prev_index - 1);
                }
                None => return self.append_failure(last_index),
            }
        }

        let AppendRequest { entries, checksums, commit_index, .. } = request;
        let last_appended = prev_index + entries.len() as LogIndex;

        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + offset as LogIndex;
            if entry.index != index {
                warn!("Node {} expected entry {} but got {}", self.id, index, entry.index);
                return self.append_failure(index - 1);
            }

            if let Some(existing) = self.log.entry(index) {
                if existing.term() == entry.term {
                    continue;
                }
                debug!(
                    "Node {} truncating conflicting entry {} (term {} vs {})",
                    self.id,
                    index,
                    existing.term(),
                    entry.term
                );
                if let Err(e) = self.log.truncate_after(index - 1) {
                    error!("Node {} failed to truncate log after {}: {}", self.id, index - 1, e);
                    return self.append_failure(index - 1);
                }
            }

            let appended = match &checksums {
                Some(checksums) => self.log.append_with_checksum(entry, checksums[offset]),
                None => self.log.append(entry),
            };
            if let Err(e) = appended {
                warn!("Node {} failed to append entry {}: {}", self.id, index, e);
                if let Err(e) = self.log.flush() {
                    error!("Node {} failed to flush log: {}", self.id, e);
                }
                return self.append_failure(index - 1);
            }
        }

        if let Err(e) = self.log.flush() {
            error!("Node {} failed to flush log: {}", self.id, e);
            return self.append_failure(prev_index);
        }

        let commit = commit_index.min(last_appended);
        if commit > self.log.commit_index() {
            self.log.set_commit_index(commit);
        }

        AppendResponse { term: self.meta.term, succeeded: true, last_log_index: last_appended }
    }

    fn handle_append_response(&mut self, from: NodeId, response: AppendResponse) {
        if response.term < self.meta.term {
            return;
        }
        let last_index = self.log.last_index();
        let Some(leader) = self.role.as_leader_mut() else {
            return;
        };

        if response.succeeded {
            let matched = leader.progress.match_index.get(&from).copied().unwrap_or(0);
            if response.last_log_index > matched {
                leader.progress.update_progress(from, response.last_log_index);
            }
            self.advance_commit();
            if response.last_log_index < last_index {
                self.send_append(from);
            }
        } else {
            let before = leader.progress.next_index.get(&from).copied();
            leader.progress.reject(from, response.last_log_index, last_index);
            if leader.progress.next_index.get(&from).copied() != before {
                self.send_append(from);
            }
        }
    }

    fn replicate_all(&mut self) {
        for peer in self.peers() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let next_default = self.log.last_index() + 1;
        let Some(leader) = self.role.as_leader_mut() else {
            return;
        };
        let next_index = leader.progress.next_index.get(&peer).copied().unwrap_or(next_default);

        let prev_log_index = next_index.saturating_sub(1);
        let Some(prev_log_term) = self.term_at(prev_log_index) else {
            warn!(
                "Node {} cannot replicate to {}: entry {} is no longer in the log",
                self.id, peer, prev_log_index
            );
            return;
        };

        let entries = self.log.entries(next_index, self.config.max_append_entries);
        let checksums = (self.config.checksums_enabled && !entries.is_empty())
            .then(|| entries.iter().map(Indexed::checksum).collect());

        let request = AppendRequest {
            term: self.meta.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: entries.into_iter().map(Indexed::into_entry).collect(),
            checksums,
            commit_index: self.log.commit_index(),
        };
        self.outbox.push((peer, RaftMessage::Append(request)));
    }

    /// Commit up to the voting quorum's index, counting only entries of the
    /// current term, and notify the listeners of newly committed entries
    fn advance_commit(&mut self) {
        let voters = self.voters();
        let last_index = self.log.last_index();
        let quorum_index = match &self.role {
            RoleState::Leader(leader) => leader.progress.quorum_index(&voters, self.id, last_index),
            _ => return,
        };

        if quorum_index <= self.log.commit_index() || self.term_at(quorum_index) != Some(self.meta.term)
        {
            return;
        }

        self.log.set_commit_index(quorum_index);
        debug!("Node {} committed up to index {}", self.id, quorum_index);

        if let Some(leader) = self.role.as_leader_mut() {
            while leader.uncommitted.front().is_some_and(|(indexed, _)| indexed.index() <= quorum_index) {
                if let Some((indexed, mut listener)) = leader.uncommitted.pop_front() {
                    listener.on_commit(&indexed);
                }
            }
        }
    }

    /// Queue an application entry and drain the leader's append queue.
    ///
    /// Fails the listener with [`AppendError::LeaderClosed`] when this node
    /// is not an open leader.
    pub fn append_entry(
        &mut self,
        lowest_position: Position,
        highest_position: Position,
        payload: Vec<u8>,
        listener: Box<dyn AppendListener>,
    ) {
        self.submit_append(PendingAppend { lowest_position, highest_position, payload, listener });
        self.process_pending_appends();
    }

    /// Queue an append without processing it
    pub fn submit_append(&mut self, append: PendingAppend) {
        let id = self.id;
        let term = self.meta.term;
        match self.role.as_leader_mut() {
            Some(leader) if leader.open => leader.pending.push_back(append),
            _ => {
                let mut listener = append.listener;
                listener.on_write_error(AppendError::LeaderClosed(format!(
                    "node {} is not leader in term {}",
                    id, term
                )));
            }
        }
    }

    /// Write queued appends in submission order until the queue is empty or
    /// the leader closes
    pub fn process_pending_appends(&mut self) {
        let mut written = false;
        loop {
            let next = match self.role.as_leader_mut() {
                Some(leader) if leader.open => leader.pending.pop_front(),
                _ => None,
            };
            let Some(append) = next else {
                break;
            };
            written |= self.safe_append(append);
        }

        if written && self.is_leader() {
            self.replicate_all();
            self.advance_commit();
        }
    }

    /// Validate and write one entry; any failure demotes the leader
    fn safe_append(&mut self, append: PendingAppend) -> bool {
        let PendingAppend { lowest_position, highest_position, payload, mut listener } = append;
        let entry = LogEntry::application(
            self.meta.term,
            self.log.last_index() + 1,
            lowest_position,
            highest_position,
            payload,
        );

        let last_application = match &self.role {
            RoleState::Leader(leader) => leader.last_application.as_ref(),
            _ => None,
        };
        if let ValidationResult::Failed(reason) = self.validator.validate(last_application, &entry) {
            warn!("Node {} rejected entry at index {}: {}", self.id, entry.index, reason);
            let error = AppendError::Validation(reason);
            listener.on_write_error(error.clone());
            self.transition_with_reason(Role::Follower, &error.to_string());
            return false;
        }

        match append_with_retry(self.log.as_mut(), &entry, self.config.max_append_retries) {
            Ok(indexed) => {
                listener.on_write(&indexed);
                if let Some(leader) = self.role.as_leader_mut() {
                    leader.last_application = Some(entry);
                    leader.uncommitted.push_back((indexed, listener));
                }
                true
            }
            Err(e) => {
                error!(
                    "Node {} failed to append entry at index {} in term {}: {}",
                    self.id, entry.index, entry.term, e
                );
                let error = AppendError::Journal(e);
                listener.on_write_error(error.clone());
                self.transition_with_reason(Role::Follower, &error.to_string());
                false
            }
        }
    }
}

impl std::fmt::Debug for RaftContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftContext")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("role", &self.role())
            .field("term", &self.meta.term)
            .field("leader_id", &self.leader_id)
            .field("last_log_index", &self.log.last_index())
            .field("commit_index", &self.log.commit_index())
            .finish()
    }
}
