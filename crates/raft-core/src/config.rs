//! # config
//!
//! why: keep every timing constant of the consensus engine in one tunable place
//! relations: read by node.rs, election.rs, replication.rs and rpc.rs; built by callers
//! what: RaftConfig with defaults, json overrides and validation

use std::time::Duration;

use raft_dispatch::DispatcherConfig;
use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Timing and sizing knobs for a Raft node.
///
/// Guard timeouts sit well below the heartbeat interval, which sits below
/// the election tolerance, so a stuck peer is written off long before an
/// election would fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Leader heartbeat period.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Followers start an election after this many heartbeat intervals of silence.
    pub election_tolerance_factor: u32,
    /// Period of the election ticker.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// Lower bound of the randomized pause after each election attempt.
    #[serde(with = "millis")]
    pub election_backoff_min: Duration,
    /// Upper bound (exclusive) of the randomized pause after each election attempt.
    #[serde(with = "millis")]
    pub election_backoff_max: Duration,
    /// Default guard timeout, used for votes and commit notifications.
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    /// Guard timeout for the first append of a submission and for heartbeats.
    #[serde(with = "millis")]
    pub append_timeout: Duration,
    /// Guard timeout for each append retry.
    #[serde(with = "millis")]
    pub append_retry_timeout: Duration,
    /// Retries after a timed out append before giving up on a peer for the round.
    pub append_retries: u32,
    /// Guard timeout for a replenish send.
    #[serde(with = "millis")]
    pub replenish_timeout: Duration,
    /// Lanes in the dispatcher's general pool.
    pub dispatcher_lanes: usize,
    /// Idle poll period of each lane.
    #[serde(with = "millis")]
    pub lane_poll_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_tolerance_factor: 3,
            tick_interval: Duration::from_millis(10),
            election_backoff_min: Duration::from_millis(150),
            election_backoff_max: Duration::from_millis(400),
            rpc_timeout: Duration::from_millis(10),
            append_timeout: Duration::from_millis(20),
            append_retry_timeout: Duration::from_millis(10),
            append_retries: 3,
            replenish_timeout: Duration::from_millis(30),
            dispatcher_lanes: 10,
            lane_poll_interval: Duration::from_millis(1),
        }
    }
}

impl RaftConfig {
    /// Parse a json document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, RaftError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Silence after which a follower gives up on the leader.
    pub fn election_tolerance(&self) -> Duration {
        self.heartbeat_interval * self.election_tolerance_factor
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            lanes: self.dispatcher_lanes,
            poll_interval: self.lane_poll_interval,
        }
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        let invalid = |msg: &str| Err(RaftError::InvalidConfig(msg.to_string()));

        if self.heartbeat_interval.is_zero() || self.tick_interval.is_zero() {
            return invalid("heartbeat and tick intervals must be non-zero");
        }
        if self.election_tolerance_factor == 0 {
            return invalid("election_tolerance_factor must be at least 1");
        }
        if self.election_backoff_min >= self.election_backoff_max {
            return invalid("election backoff range is empty");
        }
        let slowest_guard = self
            .rpc_timeout
            .max(self.append_timeout)
            .max(self.replenish_timeout);
        if slowest_guard.is_zero() || self.append_retry_timeout.is_zero() {
            return invalid("guard timeouts must be non-zero");
        }
        if slowest_guard >= self.heartbeat_interval {
            return invalid("guard timeouts must be shorter than the heartbeat interval");
        }
        if self.dispatcher_lanes == 0 {
            return invalid("dispatcher needs at least one lane");
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
