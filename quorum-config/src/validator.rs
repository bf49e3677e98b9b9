//! Configuration validation

use crate::{ClusterSection, QuorumConfig, RaftSection, RestoreSection, SnapshotSection};
use quorum_core::{QuorumError, Result};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration
    pub fn validate(config: &QuorumConfig) -> Result<()> {
        Self::validate_cluster(&config.cluster)?;
        Self::validate_raft(&config.raft)?;
        Self::validate_snapshot(&config.snapshot)?;
        Self::validate_restore(&config.restore)?;

        Ok(())
    }

    fn validate_cluster(cluster: &ClusterSection) -> Result<()> {
        if cluster.name.is_empty() {
            return Err(QuorumError::config("Cluster name cannot be empty"));
        }

        if cluster.name.len() > 63 {
            return Err(QuorumError::config("Cluster name too long (max 63 characters)"));
        }

        // DNS label format
        if !cluster.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
            return Err(QuorumError::config(
                "Cluster name contains invalid characters (only alphanumeric and hyphen allowed)",
            ));
        }

        if cluster.node_id == 0 {
            return Err(QuorumError::config("Node id 0 is reserved"));
        }

        if cluster.members.is_empty() {
            return Err(QuorumError::config("At least one voting member is required"));
        }

        if let Some(id) = cluster.passive_members.iter().find(|id| cluster.members.contains(id)) {
            return Err(QuorumError::config(format!(
                "Node {} cannot be both a voting and a passive member",
                id
            )));
        }

        let known = cluster.members.contains(&cluster.node_id)
            || cluster.passive_members.contains(&cluster.node_id);
        if !known {
            return Err(QuorumError::config(format!(
                "Node id {} is not listed as a member",
                cluster.node_id
            )));
        }

        Ok(())
    }

    fn validate_raft(raft: &RaftSection) -> Result<()> {
        if raft.tick_interval_ms == 0 {
            return Err(QuorumError::config("Tick interval must be greater than 0"));
        }

        if raft.election_timeout_min_ms >= raft.election_timeout_max_ms {
            return Err(QuorumError::config(
                "election_timeout_min_ms must be less than election_timeout_max_ms",
            ));
        }

        if raft.heartbeat_interval_ms >= raft.election_timeout_min_ms {
            return Err(QuorumError::config(
                "heartbeat_interval_ms must be less than election_timeout_min_ms",
            ));
        }

        if raft.heartbeat_interval_ms < raft.tick_interval_ms {
            return Err(QuorumError::config(
                "heartbeat_interval_ms must be at least one tick",
            ));
        }

        if raft.max_append_entries == 0 {
            return Err(QuorumError::config("max_append_entries must be greater than 0"));
        }

        if raft.max_entry_size == 0 {
            return Err(QuorumError::config("max_entry_size must be greater than 0"));
        }

        if raft.max_candidate_rounds == 0 {
            return Err(QuorumError::config("max_candidate_rounds must be greater than 0"));
        }

        if raft.max_append_retries > 100 {
            tracing::warn!(
                "max_append_retries is very high ({}); a failing journal will stall the leader",
                raft.max_append_retries
            );
        }

        Ok(())
    }

    fn validate_snapshot(snapshot: &SnapshotSection) -> Result<()> {
        if snapshot.chunk_size == 0 {
            return Err(QuorumError::config("Snapshot chunk size must be greater than 0"));
        }

        if snapshot.directory.as_os_str().is_empty() {
            return Err(QuorumError::config("Snapshot directory cannot be empty"));
        }

        Ok(())
    }

    fn validate_restore(restore: &RestoreSection) -> Result<()> {
        if restore.source_poll_interval_ms == 0 {
            return Err(QuorumError::config("Restore poll interval must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&QuorumConfig::default()).is_ok());
    }

    #[test]
    fn test_unknown_local_node() {
        let mut config = QuorumConfig::default();
        config.cluster.node_id = 7;
        assert!(ConfigValidator::validate(&config).is_err());

        config.cluster.passive_members = vec![7];
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_overlapping_member_sets() {
        let mut config = QuorumConfig::default();
        config.cluster.members = vec![1, 2];
        config.cluster.passive_members = vec![2];
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_timeouts() {
        let mut config = QuorumConfig::default();
        config.raft.election_timeout_min_ms = 300;
        config.raft.election_timeout_max_ms = 150;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = QuorumConfig::default();
        config.raft.heartbeat_interval_ms = config.raft.election_timeout_min_ms;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = QuorumConfig::default();
        config.snapshot.chunk_size = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
