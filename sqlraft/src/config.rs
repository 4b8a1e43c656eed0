//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds. Twice the minimum, so the randomized
/// timeout is drawn from `[timeout, 2 * timeout)`.
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold of applied entries after which a new snapshot is taken.
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;
/// Default number of entries retained in the log after a snapshot.
const DEFAULT_SNAPSHOT_TRAILING: u64 = 2048;
/// Default timeout for sending a snapshot to a follower, in milliseconds.
const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 30_000;
/// Default maximum number of entries per AppendEntries payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default maximum number of catch-up rounds when promoting a server to voter.
const DEFAULT_MAX_CATCH_UP_ROUNDS: u64 = 10;
/// Default maximum duration of a single catch-up round, in milliseconds.
const DEFAULT_MAX_CATCH_UP_ROUND_DURATION: u64 = 5_000;

/// The policy governing when to take a new snapshot of the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Take a new snapshot once the number of entries applied since the last snapshot reaches
    /// this threshold.
    LogsSinceLast(u64),
}

/// The runtime configuration of a Raft node.
///
/// The election timeout is randomized per reset, drawn uniformly from
/// `[election_timeout_min, election_timeout_max)`. Set the maximum to twice the minimum to get
/// the classic `[T, 2T)` window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds (exclusive).
    pub election_timeout_max: u64,
    /// The interval at which leaders send heartbeats to followers, in milliseconds.
    pub heartbeat_interval: u64,
    /// Whether candidates run a pre-vote round before incrementing their term.
    pub pre_vote: bool,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// How far behind a follower may fall before its replication stream drops from pipeline
    /// back to probe mode.
    pub replication_lag_threshold: u64,
    /// The snapshot policy.
    pub snapshot_policy: SnapshotPolicy,
    /// The number of entries retained in the log after taking a snapshot.
    pub snapshot_trailing: u64,
    /// When set, the retained window after a snapshot is chosen between the snapshot threshold
    /// and `snapshot_trailing` based on how many entries the previous snapshot covered.
    pub dynamic_trailing: bool,
    /// The timeout for sending a snapshot to a follower, in milliseconds. When it elapses the
    /// transfer is aborted and the follower is probed again.
    pub install_snapshot_timeout: u64,
    /// The maximum number of catch-up rounds granted to a server being promoted to voter.
    pub max_catch_up_rounds: u64,
    /// The maximum duration of a single catch-up round, in milliseconds.
    pub max_catch_up_round_duration: u64,
}

impl Config {
    /// Start a builder for a config bearing the given cluster name.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            pre_vote: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_trailing: None,
            dynamic_trailing: None,
            install_snapshot_timeout: None,
            max_catch_up_rounds: None,
            max_catch_up_round_duration: None,
        }
    }

    /// Generate a new random election timeout within the configured window.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The snapshot threshold currently in force.
    pub fn snapshot_threshold(&self) -> u64 {
        match self.snapshot_policy {
            SnapshotPolicy::LogsSinceLast(threshold) => threshold,
        }
    }
}

/// A builder for the [`Config`] type.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    pre_vote: Option<bool>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_trailing: Option<u64>,
    dynamic_trailing: Option<bool>,
    install_snapshot_timeout: Option<u64>,
    max_catch_up_rounds: Option<u64>,
    max_catch_up_round_duration: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Enable or disable the pre-vote phase.
    pub fn pre_vote(mut self, val: bool) -> Self {
        self.pre_vote = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the replication lag threshold.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the number of trailing entries retained after a snapshot.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Enable or disable dynamic trailing.
    pub fn dynamic_trailing(mut self, val: bool) -> Self {
        self.dynamic_trailing = Some(val);
        self
    }

    /// Set the snapshot transfer timeout in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the maximum number of promotion catch-up rounds.
    pub fn max_catch_up_rounds(mut self, val: u64) -> Self {
        self.max_catch_up_rounds = Some(val);
        self
    }

    /// Set the maximum duration of a single promotion catch-up round, in milliseconds.
    pub fn max_catch_up_round_duration(mut self, val: u64) -> Self {
        self.max_catch_up_round_duration = Some(val);
        self
    }

    /// Validate the state of this builder & produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 || election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            pre_vote: self.pre_vote.unwrap_or(false),
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            snapshot_policy: self
                .snapshot_policy
                .unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_SNAPSHOT_THRESHOLD)),
            snapshot_trailing: self.snapshot_trailing.unwrap_or(DEFAULT_SNAPSHOT_TRAILING),
            dynamic_trailing: self.dynamic_trailing.unwrap_or(false),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
            max_catch_up_rounds: self.max_catch_up_rounds.unwrap_or(DEFAULT_MAX_CATCH_UP_ROUNDS),
            max_catch_up_round_duration: self
                .max_catch_up_round_duration
                .unwrap_or(DEFAULT_MAX_CATCH_UP_ROUND_DURATION),
        })
    }
}
