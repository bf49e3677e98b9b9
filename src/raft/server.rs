//! RaftServer - runs one partition's context on its own task

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{
    AppendError, AppendEvent, AppendListener, ChannelAppendListener, LogIndex, NodeId,
    RaftContext, RaftError, RaftMessage, RaftTransport, Result, Role, Term,
};

/// Snapshot of a partition's replication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
}

impl RaftStatus {
    fn of(context: &RaftContext) -> Self {
        Self {
            id: context.id(),
            role: context.role(),
            term: context.term(),
            leader_id: context.leader_id(),
            last_log_index: context.last_log_index(),
            commit_index: context.commit_index(),
        }
    }
}

/// Work items processed by the server loop, one at a time
enum Command {
    Deliver {
        from: NodeId,
        message: RaftMessage,
    },
    Append {
        lowest_position: u64,
        highest_position: u64,
        payload: Vec<u8>,
        listener: Box<dyn AppendListener>,
    },
    Transition(Role),
    StepDown,
    Status(oneshot::Sender<RaftStatus>),
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<RaftStatus>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.command_tx.send(command).map_err(|_| RaftError::Shutdown(self.id))
    }

    /// Hand an inbound message to the server
    pub fn deliver(&self, from: NodeId, message: RaftMessage) -> Result<()> {
        self.send(Command::Deliver { from, message })
    }

    /// Submit an append; the outcome is reported to `listener`
    pub fn append_entry(
        &self,
        lowest_position: u64,
        highest_position: u64,
        payload: Vec<u8>,
        listener: Box<dyn AppendListener>,
    ) {
        let command = Command::Append { lowest_position, highest_position, payload, listener };
        if let Err(mpsc::error::SendError(Command::Append { mut listener, .. })) =
            self.command_tx.send(command)
        {
            listener.on_write_error(AppendError::LeaderClosed(format!(
                "server for node {} has shut down",
                self.id
            )));
        }
    }

    /// Submit an append and receive its outcome as a stream of events
    pub fn append(
        &self,
        lowest_position: u64,
        highest_position: u64,
        payload: Vec<u8>,
    ) -> mpsc::UnboundedReceiver<AppendEvent> {
        let (listener, events) = ChannelAppendListener::new();
        self.append_entry(lowest_position, highest_position, payload, Box::new(listener));
        events
    }

    pub fn transition(&self, role: Role) -> Result<()> {
        self.send(Command::Transition(role))
    }

    /// Ask a leader or candidate to return to follower
    pub fn step_down(&self) -> Result<()> {
        self.send(Command::StepDown)
    }

    /// Query the current state from the server loop
    pub async fn status(&self) -> Result<RaftStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Status(reply_tx))?;
        reply_rx.await.map_err(|_| RaftError::Shutdown(self.id))
    }

    /// Last published state, without a round trip to the server
    pub fn current_status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Result<RaftStatus>
    where
        F: FnMut(&RaftStatus) -> bool,
    {
        let mut status_rx = self.status_rx.clone();
        let status = status_rx.wait_for(predicate).await.map_err(|_| RaftError::Shutdown(self.id))?;
        Ok(status.clone())
    }

    /// Shutdown the RaftServer gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Owns a partition's context and serializes all work on it
pub struct RaftServer {
    context: RaftContext,
    transport: Arc<dyn RaftTransport>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    status_tx: watch::Sender<RaftStatus>,
    status_rx: watch::Receiver<RaftStatus>,
}

impl RaftServer {
    pub fn new(context: RaftContext, transport: Arc<dyn RaftTransport>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(RaftStatus::of(&context));

        Self {
            context,
            transport,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            status_tx,
            status_rx,
        }
    }

    /// Handle usable before the server is started, e.g. to register it with a router
    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            id: self.context.id(),
            command_tx: self.command_tx.clone(),
            status_rx: self.status_rx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let mut ticker = interval(self.context.config().tick_interval());
        // Delay so a stalled loop does not fire a burst of ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting RAFT server for node {}", self.context.id());

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    break;
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                }
                _ = ticker.tick() => {
                    self.context.tick();
                }
            }

            self.flush_outbox().await;
            self.publish_status();
        }

        info!("Shutting down RAFT server for node {}", self.context.id());
        self.context.step_down();
        self.publish_status();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Deliver { from, message } => self.context.step(from, message),
            Command::Append { lowest_position, highest_position, payload, listener } => {
                self.context.append_entry(lowest_position, highest_position, payload, listener);
            }
            Command::Transition(role) => self.context.transition(role),
            Command::StepDown => self.context.step_down(),
            Command::Status(reply) => {
                let _ = reply.send(RaftStatus::of(&self.context));
            }
        }
    }

    async fn flush_outbox(&mut self) {
        let from = self.context.id();
        for (to, message) in self.context.take_outbox() {
            if let Err(e) = self.transport.send(from, to, message).await {
                debug!("Node {} failed to send to {}: {}", from, to, e);
            }
        }
    }

    fn publish_status(&self) {
        let status = RaftStatus::of(&self.context);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
