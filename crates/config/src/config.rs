//! Consensus engine configuration.
//!
//! Timeouts follow the `base + delta * round` shape: every failed round
//! widens the window, which restores liveness once the network stabilizes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Configuration for the consensus state machine and its WAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Root directory for consensus data (the WAL lives below it)
    pub home_dir: PathBuf,

    /// How long to wait for a proposal in round 0
    pub timeout_propose: Duration,
    /// Additional propose wait per round
    pub timeout_propose_delta: Duration,
    /// How long to wait for stragglers after 2f+1 prevotes
    pub timeout_prevote: Duration,
    /// Additional prevote wait per round
    pub timeout_prevote_delta: Duration,
    /// How long to wait for stragglers after 2f+1 precommits
    pub timeout_precommit: Duration,
    /// Additional precommit wait per round
    pub timeout_precommit_delta: Duration,
    /// Quiescence after a commit before starting the next height
    pub timeout_commit: Duration,
    /// Skip the post-commit quiescence and start the next height
    /// immediately (test only)
    pub skip_timeout_commit: bool,

    /// Whether to propose blocks with no transactions
    pub create_empty_blocks: bool,
    /// Minimum wait before proposing an empty block (zero = no wait)
    pub create_empty_blocks_interval: Duration,

    /// Sleep between gossip rounds in the reactor
    pub peer_gossip_sleep_duration: Duration,
    /// Sleep between 2/3-majority queries to a peer
    pub peer_query_maj23_sleep_duration: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("./data/consensus"),
            timeout_propose: Duration::from_millis(3000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1000),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            peer_gossip_sleep_duration: Duration::from_millis(100),
            peer_query_maj23_sleep_duration: Duration::from_millis(2000),
        }
    }
}

impl ConsensusConfig {
    /// A configuration with short timeouts for tests.
    pub fn test_config(home_dir: &Path) -> Self {
        Self {
            home_dir: home_dir.to_path_buf(),
            timeout_propose: Duration::from_millis(80),
            timeout_propose_delta: Duration::from_millis(20),
            timeout_prevote: Duration::from_millis(40),
            timeout_prevote_delta: Duration::from_millis(10),
            timeout_precommit: Duration::from_millis(40),
            timeout_precommit_delta: Duration::from_millis(10),
            timeout_commit: Duration::from_millis(20),
            skip_timeout_commit: true,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            peer_gossip_sleep_duration: Duration::from_millis(10),
            peer_query_maj23_sleep_duration: Duration::from_millis(50),
        }
    }

    /// Path of the write-ahead log file.
    pub fn wal_file(&self) -> PathBuf {
        self.home_dir.join("wal").join("wal.log")
    }

    /// Propose deadline for `round`: `timeout_propose + delta * round`.
    pub fn propose_timeout(&self, round: i32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round.max(0) as u32
    }

    /// Prevote-wait deadline for `round`.
    pub fn prevote_timeout(&self, round: i32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round.max(0) as u32
    }

    /// Precommit-wait deadline for `round`.
    pub fn precommit_timeout(&self, round: i32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round.max(0) as u32
    }

    /// Post-commit quiescence, `Duration::ZERO` when skipped.
    pub fn commit_timeout(&self) -> Duration {
        if self.skip_timeout_commit {
            Duration::ZERO
        } else {
            self.timeout_commit
        }
    }

    /// Validate the configuration values.
    pub fn validate_basic(&self) -> ConfigResult<()> {
        let positive = [
            ("timeout_propose", self.timeout_propose),
            ("timeout_prevote", self.timeout_prevote),
            ("timeout_precommit", self.timeout_precommit),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::InvalidTimeout(format!(
                    "{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ConsensusConfig::default().validate_basic().unwrap();
    }

    #[test]
    fn test_timeouts_grow_with_round() {
        let config = ConsensusConfig::default();
        assert_eq!(config.propose_timeout(0), Duration::from_millis(3000));
        assert_eq!(config.propose_timeout(1), Duration::from_millis(3500));
        assert_eq!(config.propose_timeout(4), Duration::from_millis(5000));
        assert!(config.prevote_timeout(3) > config.prevote_timeout(1));
    }

    #[test]
    fn test_skip_timeout_commit() {
        let mut config = ConsensusConfig::default();
        assert_eq!(config.commit_timeout(), config.timeout_commit);
        config.skip_timeout_commit = true;
        assert_eq!(config.commit_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ConsensusConfig::default();
        config.timeout_propose = Duration::ZERO;
        assert!(config.validate_basic().is_err());
    }

    #[test]
    fn test_wal_file_under_home() {
        let config = ConsensusConfig::test_config(Path::new("/tmp/node1"));
        assert_eq!(config.wal_file(), PathBuf::from("/tmp/node1/wal/wal.log"));
    }
}
