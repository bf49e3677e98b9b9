//! Core type definitions for quorum

use serde::{Deserialize, Serialize};
use std::fmt;

/// Member id in a replication group
pub type NodeId = u64;

/// Election epoch; a higher term always wins
pub type Term = u64;

/// Index of an entry in the replicated log (1-based, 0 means "none")
pub type LogIndex = u64;

/// Logical record position carried by log entries
pub type Position = u64;

/// Identifier for a partition of the ordered command log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self(1)
    }
}

/// How a member takes part in a replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// Votes in elections and counts towards the commit quorum
    Active,
    /// Receives replicated entries but never votes or campaigns
    Passive,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberType::Active => write!(f, "active"),
            MemberType::Passive => write!(f, "passive"),
        }
    }
}

/// A member of a replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub member_type: MemberType,
}

impl Member {
    pub fn active(id: NodeId) -> Self {
        Self { id, member_type: MemberType::Active }
    }

    pub fn passive(id: NodeId) -> Self {
        Self { id, member_type: MemberType::Passive }
    }

    pub fn is_active(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

/// Returns the number of votes needed for a majority out of `voters`
pub fn quorum_size(voters: usize) -> usize {
    voters / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_partition_display() {
        assert_eq!(PartitionId::new(3).to_string(), "partition-3");
        assert_eq!(PartitionId::default().as_u32(), 1);
    }

    #[test]
    fn test_member_types() {
        assert!(Member::active(1).is_active());
        assert!(!Member::passive(2).is_active());
        assert_eq!(MemberType::Passive.to_string(), "passive");
    }
}
