//! RAFT configuration

use quorum_config::RaftSection;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RAFT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout in milliseconds
    pub election_timeout_min: u64,

    /// Maximum election timeout in milliseconds
    pub election_timeout_max: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,

    /// Timer granularity in milliseconds; all role timers count ticks
    pub tick_interval: u64,

    /// Maximum number of entries per append request
    pub max_append_entries: usize,

    /// Retries for transient journal failures before the leader steps down
    pub max_append_retries: u32,

    /// Send per-entry checksums with append requests
    pub checksums_enabled: bool,

    /// Vote rounds a candidate runs before falling back to follower
    pub max_candidate_rounds: u32,

    /// Largest encoded entry the journal accepts, in bytes
    pub max_entry_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            heartbeat_interval: 250,
            tick_interval: 50,
            max_append_entries: 100,
            max_append_retries: 5,
            checksums_enabled: true,
            max_candidate_rounds: 3,
            max_entry_size: 4 * 1024 * 1024,
        }
    }
}

impl From<&RaftSection> for RaftConfig {
    fn from(section: &RaftSection) -> Self {
        Self {
            election_timeout_min: section.election_timeout_min_ms,
            election_timeout_max: section.election_timeout_max_ms,
            heartbeat_interval: section.heartbeat_interval_ms,
            tick_interval: section.tick_interval_ms,
            max_append_entries: section.max_append_entries,
            max_append_retries: section.max_append_retries,
            checksums_enabled: section.checksums_enabled,
            max_candidate_rounds: section.max_candidate_rounds,
            max_entry_size: section.max_entry_size,
        }
    }
}

impl RaftConfig {
    /// Randomized election timeout expressed in ticks
    pub fn election_timeout_ticks(&self, rng: &mut impl Rng) -> u64 {
        let min = self.ticks(self.election_timeout_min);
        let max = self.ticks(self.election_timeout_max).max(min + 1);
        rng.gen_range(min..max)
    }

    /// Randomized length of one candidate vote round, between half and one
    /// minimum election timeout, in ticks
    pub fn vote_round_ticks(&self, rng: &mut impl Rng) -> u64 {
        let max = self.ticks(self.election_timeout_min);
        let min = (max / 2).max(1);
        rng.gen_range(min..max.max(min + 1))
    }

    /// Heartbeat interval expressed in ticks
    pub fn heartbeat_ticks(&self) -> u64 {
        self.ticks(self.heartbeat_interval)
    }

    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }

    fn ticks(&self, millis: u64) -> u64 {
        (millis / self.tick_interval.max(1)).max(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::raft::Result<()> {
        if self.tick_interval == 0 {
            return Err(crate::raft::RaftError::ConfigError(
                "tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(crate::raft::RaftError::ConfigError(
                "election_timeout_min must be less than election_timeout_max".to_string(),
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(crate::raft::RaftError::ConfigError(
                "heartbeat_interval must be less than election_timeout_min".to_string(),
            ));
        }

        if self.max_append_entries == 0 {
            return Err(crate::raft::RaftError::ConfigError(
                "max_append_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_entry_size == 0 {
            return Err(crate::raft::RaftError::ConfigError(
                "max_entry_size must be greater than 0".to_string(),
            ));
        }

        if self.max_candidate_rounds == 0 {
            return Err(crate::raft::RaftError::ConfigError(
                "max_candidate_rounds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
