//! # config
//!
//! why: tune election timing, heartbeats and log compaction
//! relations: owned by RaftNode, read by raft-kv's timers and apply path
//! what: RaftConfig

use serde::{Deserialize, Serialize};

use crate::RaftError;

/// Timing and compaction parameters for a raft node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout (ms)
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout (ms)
    pub election_timeout_max: u64,
    /// Leader heartbeat period (ms)
    pub heartbeat_interval: u64,
    /// Log length at which the applied prefix is compacted into a snapshot
    pub snapshot_threshold: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            snapshot_threshold: 1000,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be positive".to_string(),
            ));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be positive and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::InvalidConfig(
                "snapshot_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a log of `log_len` entries should be compacted
    pub fn should_snapshot(&self, log_len: usize) -> bool {
        log_len >= self.snapshot_threshold
    }
}
