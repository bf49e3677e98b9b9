//! # Quorum
//!
//! A partitioned replicated-log consensus engine with snapshot-based restore.
//!
//! ## Architecture
//!
//! - **Consensus Layer**: role state machine, leader append pipeline and
//!   follower append handling, one single-threaded context per partition
//! - **Snapshot Layer**: persisted snapshots and chunked snapshot transfer
//! - **Restore Layer**: catch-up of lagging members from a snapshot or events
//! - **Configuration Layer**: layered configuration (`quorum-config`)

#![warn(rust_2018_idioms, unused_qualifications)]
#![deny(unsafe_code)]

/// Consensus and replication
pub mod raft;

/// Snapshot storage and transfer
pub mod snapshot;

/// Catch-up of lagging members
pub mod restore;

pub use quorum_core::{
    quorum_size, LogIndex, Member, MemberType, NodeId, PartitionId, Position, QuorumError, Result,
    Term,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_initialization() {
        assert!(!VERSION.is_empty());
    }
}
