//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The `Wait` utility on top of the
//! metrics channel is how the test suite observes cluster convergence.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::core::State;
use crate::membership::Configuration;
use crate::replication::ReplicationMetrics;
use crate::LogId;
use crate::NodeId;

/// Per-follower replication metrics, keyed by target node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to have been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to have been applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership configuration of the cluster.
    pub membership_config: Configuration,
    /// The position covered by this node's current snapshot.
    pub snapshot: LogId,
    /// The metrics about the leader. It is Some() only when this node is leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: Configuration::new(),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

// Error variants related to metrics waiting.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait for a metrics condition to be satisfied, or timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();

            tracing::debug!("id={} wait {:} latest: {:?}", latest.id, msg.to_string(), latest);

            if func(&latest) {
                tracing::debug!("id={} done wait {:}", latest.id, msg.to_string());
                return Ok(latest);
            }

            let delay = tokio::time::sleep(self.timeout);

            tokio::select! {
                _ = delay => {
                    tracing::debug!("id={} timeout wait {:}", latest.id, msg.to_string());
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to reach `want_log`, or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log && x.last_applied == want_log,
            &format!("{} .last_log_index & last_applied -> {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `state` to become `want_state`, or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for `current_leader` to become `leader_id`, or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait for the snapshot position to become `want`, or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn snapshot(&self, want: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.snapshot == want,
            &format!("{} .snapshot -> {}", msg.to_string(), want),
        )
        .await
    }
}
