//! Replicated log entries and the journal the engine appends to

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{LogIndex, Position, Term};

/// Errors raised by a journal implementation
#[derive(Debug, Error)]
pub enum JournalError {
    /// Wrapped I/O failure; the only class the leader retries
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of disk space")]
    OutOfDiskSpace,

    #[error("Entry of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Checksum mismatch for entry at index {index}")]
    InvalidChecksum { index: LogIndex },

    #[error("Expected to append at index {expected}, got {actual}")]
    InvalidIndex { expected: LogIndex, actual: LogIndex },

    #[error("Failed to encode entry: {0}")]
    Encoding(String),

    #[error("Journal failure: {0}")]
    Other(String),
}

impl JournalError {
    /// Whether the same append may succeed when attempted again
    pub fn is_transient(&self) -> bool {
        matches!(self, JournalError::Io(_))
    }
}

impl Clone for JournalError {
    fn clone(&self) -> Self {
        match self {
            JournalError::Io(e) => JournalError::Io(std::io::Error::new(e.kind(), e.to_string())),
            JournalError::OutOfDiskSpace => JournalError::OutOfDiskSpace,
            JournalError::TooLarge { size, max } => JournalError::TooLarge { size: *size, max: *max },
            JournalError::InvalidChecksum { index } => JournalError::InvalidChecksum { index: *index },
            JournalError::InvalidIndex { expected, actual } => JournalError::InvalidIndex {
                expected: *expected,
                actual: *actual,
            },
            JournalError::Encoding(msg) => JournalError::Encoding(msg.clone()),
            JournalError::Other(msg) => JournalError::Other(msg.clone()),
        }
    }
}

pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Type of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryType {
    /// Application command covering a range of record positions
    Application,

    /// Written by a newly elected leader so entries of earlier terms can commit
    Initial,
}

/// Entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: Term,

    /// Log index (1-based)
    pub index: LogIndex,

    /// Entry type
    pub entry_type: LogEntryType,

    /// First record position covered by this entry
    pub lowest_position: Position,

    /// Last record position covered by this entry
    pub highest_position: Position,

    /// Serialized records
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new application entry
    pub fn application(
        term: Term,
        index: LogIndex,
        lowest_position: Position,
        highest_position: Position,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            term,
            index,
            entry_type: LogEntryType::Application,
            lowest_position,
            highest_position,
            payload,
        }
    }

    /// Create the entry a new leader writes at the start of its term
    pub fn initial(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            entry_type: LogEntryType::Initial,
            lowest_position: 0,
            highest_position: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_application(&self) -> bool {
        self.entry_type == LogEntryType::Application
    }

    /// Serialized form; this is what checksums and size limits apply to
    pub fn encode(&self) -> JournalResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| JournalError::Encoding(e.to_string()))
    }

    /// CRC32 over the serialized entry
    pub fn checksum(&self) -> JournalResult<u32> {
        Ok(crc32fast::hash(&self.encode()?))
    }
}

/// An entry as stored in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed {
    entry: LogEntry,
    size: usize,
    checksum: u32,
}

impl Indexed {
    pub fn index(&self) -> LogIndex {
        self.entry.index
    }

    pub fn term(&self) -> Term {
        self.entry.term
    }

    pub fn entry(&self) -> &LogEntry {
        &self.entry
    }

    pub fn into_entry(self) -> LogEntry {
        self.entry
    }

    /// Stored size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn lowest_position(&self) -> Position {
        self.entry.lowest_position
    }

    pub fn highest_position(&self) -> Position {
        self.entry.highest_position
    }

    pub fn is_application(&self) -> bool {
        self.entry.is_application()
    }
}

/// The journal a partition appends to.
///
/// Appends are synchronous and are only issued from the partition's own
/// execution context.
pub trait ReplicatedLog: Send {
    /// Append without verifying a sender-supplied checksum
    fn append(&mut self, entry: LogEntry) -> JournalResult<Indexed>;

    /// Append after verifying `checksum` against the serialized entry
    fn append_with_checksum(&mut self, entry: LogEntry, checksum: u32) -> JournalResult<Indexed>;

    /// Index of the first entry the journal can hold
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or `first_index() - 1` when empty
    fn last_index(&self) -> LogIndex;

    fn entry(&self, index: LogIndex) -> Option<Indexed>;

    /// Up to `max` entries starting at `from`
    fn entries(&self, from: LogIndex, max: usize) -> Vec<Indexed>;

    /// Delete every entry after `index`
    fn truncate_after(&mut self, index: LogIndex) -> JournalResult<()>;

    fn commit_index(&self) -> LogIndex;

    fn set_commit_index(&mut self, index: LogIndex);

    /// Index of the application entry whose position range contains `position`
    fn seek_position(&self, position: Position) -> Option<LogIndex>;

    /// Make appended entries durable
    fn flush(&mut self) -> JournalResult<()> {
        Ok(())
    }

    fn last_entry(&self) -> Option<Indexed> {
        self.entry(self.last_index())
    }

    fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    /// Last application entry, scanning back past initial entries
    fn last_application_entry(&self) -> Option<Indexed> {
        let first = self.first_index();
        let mut index = self.last_index();
        while index >= first && index > 0 {
            match self.entry(index) {
                Some(indexed) if indexed.is_application() => return Some(indexed),
                Some(_) => index -= 1,
                None => return None,
            }
        }
        None
    }
}

/// In-memory journal
#[derive(Debug, Clone)]
pub struct MemoryLog {
    /// Entries starting at `first_index`
    entries: Vec<Indexed>,

    first_index: LogIndex,

    commit_index: LogIndex,

    max_entry_size: usize,
}

impl MemoryLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self::with_max_entry_size(usize::MAX)
    }

    pub fn with_max_entry_size(max_entry_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            first_index: 1,
            commit_index: 0,
            max_entry_size,
        }
    }

    /// Get number of entries in log
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn offset(&self, index: LogIndex) -> Option<usize> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        (offset < self.entries.len()).then_some(offset)
    }

    fn prepare(&self, entry: &LogEntry) -> JournalResult<(usize, u32)> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(JournalError::InvalidIndex { expected, actual: entry.index });
        }

        let bytes = entry.encode()?;
        if bytes.len() > self.max_entry_size {
            return Err(JournalError::TooLarge { size: bytes.len(), max: self.max_entry_size });
        }

        Ok((bytes.len(), crc32fast::hash(&bytes)))
    }

    fn push(&mut self, entry: LogEntry, size: usize, checksum: u32) -> Indexed {
        let indexed = Indexed { entry, size, checksum };
        self.entries.push(indexed.clone());
        indexed
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedLog for MemoryLog {
    fn append(&mut self, entry: LogEntry) -> JournalResult<Indexed> {
        let (size, checksum) = self.prepare(&entry)?;
        Ok(self.push(entry, size, checksum))
    }

    fn append_with_checksum(&mut self, entry: LogEntry, checksum: u32) -> JournalResult<Indexed> {
        let (size, actual) = self.prepare(&entry)?;
        if actual != checksum {
            return Err(JournalError::InvalidChecksum { index: entry.index });
        }
        Ok(self.push(entry, size, actual))
    }

    fn first_index(&self) -> LogIndex {
        self.first_index
    }

    fn last_index(&self) -> LogIndex {
        self.first_index + self.entries.len() as LogIndex - 1
    }

    fn entry(&self, index: LogIndex) -> Option<Indexed> {
        self.offset(index).map(|offset| self.entries[offset].clone())
    }

    fn entries(&self, from: LogIndex, max: usize) -> Vec<Indexed> {
        match self.offset(from) {
            Some(offset) => self.entries[offset..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn truncate_after(&mut self, index: LogIndex) -> JournalResult<()> {
        if index < self.commit_index {
            return Err(JournalError::Other(format!(
                "Cannot truncate committed entries (commit index {}, requested {})",
                self.commit_index, index
            )));
        }
        if index < self.first_index {
            self.entries.clear();
        } else {
            let keep = (index - self.first_index + 1) as usize;
            self.entries.truncate(keep);
        }
        Ok(())
    }

    fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    fn set_commit_index(&mut self, index: LogIndex) {
        self.commit_index = index;
    }

    fn seek_position(&self, position: Position) -> Option<LogIndex> {
        self.entries
            .iter()
            .find(|indexed| {
                indexed.is_application()
                    && indexed.lowest_position() <= position
                    && position <= indexed.highest_position()
            })
            .map(Indexed::index)
    }
}
