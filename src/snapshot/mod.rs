//! Snapshot storage and chunked snapshot transfer
//!
//! A store keeps persisted snapshots under `snapshots/<id>/`, each next to a
//! `<id>.checksum` manifest, and stages snapshots that are still being
//! written or received under `pending/`.

pub mod chunk;
pub mod received;
pub mod store;

pub use chunk::*;
pub use received::*;
pub use store::*;

use quorum_core::{LogIndex, Position, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Snapshot error types
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot id '{0}'")]
    InvalidId(String),

    #[error("Snapshot {0} already exists")]
    AlreadyExists(SnapshotId),

    #[error("Snapshot {0} not found")]
    NotFound(String),

    #[error("Expected chunk of snapshot {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Chunk {chunk} declares {actual} chunks in total, expected {expected}")]
    TotalCountMismatch { chunk: String, expected: u32, actual: u32 },

    #[error("Chunk {chunk} checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { chunk: String, expected: u32, actual: u32 },

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Snapshot {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Identifies a snapshot by the log entry and record positions it covers.
///
/// The string form is `index-term-processed-exporter`; ids order by index
/// first, then term and positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub index: LogIndex,
    pub term: Term,
    pub processed_position: Position,
    pub exporter_position: Position,
}

impl SnapshotId {
    pub fn new(
        index: LogIndex,
        term: Term,
        processed_position: Position,
        exporter_position: Position,
    ) -> Self {
        Self { index, term, processed_position, exporter_position }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.exporter_position
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        let [index, term, processed, exporter] = parts.as_slice() else {
            return Err(SnapshotError::InvalidId(s.to_string()));
        };

        let parse = |part: &str| part.parse::<u64>().map_err(|_| SnapshotError::InvalidId(s.to_string()));
        Ok(Self {
            index: parse(*index)?,
            term: parse(*term)?,
            processed_position: parse(*processed)?,
            exporter_position: parse(*exporter)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_string_form() {
        let id = SnapshotId::new(10, 2, 10, 7);
        assert_eq!(id.to_string(), "10-2-10-7");
        assert_eq!("10-2-10-7".parse::<SnapshotId>().unwrap(), id);
    }

    #[test]
    fn test_invalid_snapshot_ids() {
        for invalid in ["", "10", "10-2-3", "10-2-3-4-5", "a-2-3-4", "10--3-4", "-1-2-3-4"] {
            assert!(
                matches!(invalid.parse::<SnapshotId>(), Err(SnapshotError::InvalidId(_))),
                "accepted {:?}",
                invalid
            );
        }
    }

    #[test]
    fn test_snapshot_id_ordering() {
        let older = SnapshotId::new(5, 1, 20, 20);
        let newer = SnapshotId::new(6, 1, 1, 1);
        assert!(older < newer);
    }
}
