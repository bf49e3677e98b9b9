//! Leader append pipeline: listeners, entry validation and bounded retries
//!
//! Every append submitted to a leader ends in exactly one terminal signal:
//! either `on_write` followed later by `on_commit`/`on_commit_error`, or a
//! single `on_write_error`.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Indexed, JournalError, LogEntry, Position, ReplicatedLog};

/// Errors observed by append listeners
#[derive(Debug, Clone, Error)]
pub enum AppendError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("Entry rejected by validator: {0}")]
    Validation(String),

    #[error("Leader is closed and cannot be used as appender: {0}")]
    LeaderClosed(String),
}

/// Receives the outcome of one submitted append.
///
/// The four signals fire independently: write outcomes are known as soon as
/// the local journal accepted the entry, commit outcomes only once a quorum
/// stored it (or the leader gave up).
pub trait AppendListener: Send {
    fn on_write(&mut self, indexed: &Indexed);

    fn on_write_error(&mut self, error: AppendError);

    fn on_commit(&mut self, indexed: &Indexed);

    fn on_commit_error(&mut self, indexed: &Indexed, error: AppendError);
}

/// Signal emitted by a [`ChannelAppendListener`]
#[derive(Debug, Clone)]
pub enum AppendEvent {
    Written(Indexed),
    WriteFailed(AppendError),
    Committed(Indexed),
    CommitFailed(Indexed, AppendError),
}

impl AppendEvent {
    /// Whether no further event follows this one
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppendEvent::Written(_))
    }
}

/// Forwards every signal into an unbounded channel
#[derive(Debug)]
pub struct ChannelAppendListener {
    tx: mpsc::UnboundedSender<AppendEvent>,
}

impl ChannelAppendListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AppendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: AppendEvent) {
        // The submitter may have stopped listening
        let _ = self.tx.send(event);
    }
}

impl AppendListener for ChannelAppendListener {
    fn on_write(&mut self, indexed: &Indexed) {
        self.emit(AppendEvent::Written(indexed.clone()));
    }

    fn on_write_error(&mut self, error: AppendError) {
        self.emit(AppendEvent::WriteFailed(error));
    }

    fn on_commit(&mut self, indexed: &Indexed) {
        self.emit(AppendEvent::Committed(indexed.clone()));
    }

    fn on_commit_error(&mut self, indexed: &Indexed, error: AppendError) {
        self.emit(AppendEvent::CommitFailed(indexed.clone(), error));
    }
}

/// Outcome of validating a new entry against the last one written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    Failed(String),
}

impl ValidationResult {
    pub fn failed(&self) -> bool {
        matches!(self, ValidationResult::Failed(_))
    }
}

/// Checks an application entry before the leader writes it
pub trait EntryValidator: Send {
    fn validate(&self, last: Option<&LogEntry>, next: &LogEntry) -> ValidationResult;
}

/// Requires entries to cover contiguous, non-overlapping position ranges
#[derive(Debug, Clone, Copy, Default)]
pub struct ContiguousPositionValidator;

impl EntryValidator for ContiguousPositionValidator {
    fn validate(&self, last: Option<&LogEntry>, next: &LogEntry) -> ValidationResult {
        if next.lowest_position > next.highest_position {
            return ValidationResult::Failed(format!(
                "Entry lowest position {} is greater than its highest position {}",
                next.lowest_position, next.highest_position
            ));
        }

        match last {
            Some(last) if last.highest_position + 1 != next.lowest_position => {
                ValidationResult::Failed(format!(
                    "Unexpected position {}, expected {} (previous entry ends at {})",
                    next.lowest_position,
                    last.highest_position + 1,
                    last.highest_position
                ))
            }
            _ => ValidationResult::Ok,
        }
    }
}

/// An append waiting for its turn on the leader
pub struct PendingAppend {
    pub lowest_position: Position,
    pub highest_position: Position,
    pub payload: Vec<u8>,
    pub listener: Box<dyn AppendListener>,
}

impl std::fmt::Debug for PendingAppend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAppend")
            .field("lowest_position", &self.lowest_position)
            .field("highest_position", &self.highest_position)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Append `entry`, retrying the same entry on transient journal errors.
///
/// Out-of-disk, oversized and unclassified failures are returned after the
/// first attempt.
pub fn append_with_retry(
    log: &mut dyn ReplicatedLog,
    entry: &LogEntry,
    max_retries: u32,
) -> Result<Indexed, JournalError> {
    let mut retries = 0;

    loop {
        match log.append(entry.clone()) {
            Ok(indexed) => return Ok(indexed),
            Err(e) if e.is_transient() && retries < max_retries => {
                retries += 1;
                warn!(
                    "Error on appending entry {}, retrying... (try {} out of {}): {}",
                    entry.index, retries, max_retries, e
                );
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Failed to append to local log after {} retries: {}", retries, e);
                }
                return Err(e);
            }
        }
    }
}
