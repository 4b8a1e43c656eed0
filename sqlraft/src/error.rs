//! Error types exposed by this crate.

use thiserror::Error;

use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// The node detected a log inconsistency which can not be repaired safely.
    ///
    /// This indicates a cluster-level bug, such as a request to truncate an entry which has
    /// already been committed. The node converts to the unavailable state.
    #[error("log inconsistency: {0}")]
    LogInconsistency(String),
    /// The Raft node is shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
    /// The node stepped down while the request was outstanding.
    #[error("leadership was lost while the request was outstanding")]
    LeadershipLost,
}

/// An error related to a client read request.
#[derive(Debug, Error)]
pub enum ClientReadError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader.
    #[error("the client read request must be forwarded to the cluster leader")]
    ForwardToLeader(Option<NodeId>),
}

/// An error related to initializing a pristine node.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the node's current state.
    ///
    /// The node must be pristine: no logs and term 0.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
    /// The given configuration was rejected.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),
}

/// An error related to a membership change or leadership transfer.
#[derive(Debug, Error)]
pub enum ChangeMembershipError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node is not the leader; the value is the current leader if known.
    #[error("this node is not the raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// A configuration change is already in progress and has not committed yet.
    #[error("a configuration change is already in progress")]
    ChangeInProgress,
    /// The node stepped down while the request was outstanding.
    #[error("leadership was lost while the request was outstanding")]
    LeadershipLost,
    /// The target server is not part of the cluster configuration.
    #[error("server {0} is not part of the cluster configuration")]
    NotFound(NodeId),
    /// The server already has the requested role, or the change is otherwise a no-op.
    #[error("the requested change is a no-op")]
    Noop,
    /// The proposed configuration would leave the cluster without voters.
    #[error("the proposed configuration has no voters")]
    InoperableConfig,
    /// The target of a promotion could not catch up with the leader's log in time.
    #[error("server {0} is too slow or unreachable, promotion aborted")]
    NoConnection(NodeId),
    /// The given configuration was rejected.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),
    /// A leadership transfer did not complete within the election timeout.
    #[error("leadership transfer to {0} expired")]
    TransferExpired(NodeId),
}

/// An error raised while building or decoding a cluster configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A server with this id is already part of the configuration.
    #[error("duplicate server id {0}")]
    DuplicateId(NodeId),
    /// A server with this address is already part of the configuration.
    #[error("duplicate server address {0}")]
    DuplicateAddress(String),
    /// The given role code is not voter, standby or spare.
    #[error("unknown role code {0}")]
    BadRole(u8),
    /// A server id must not be zero.
    #[error("server id must not be zero")]
    BadId,
    /// No server with the given id exists in the configuration.
    #[error("unknown server id {0}")]
    UnknownServer(NodeId),
    /// The configuration has no voters.
    #[error("configuration has no voters")]
    NoVoters,
    /// The encoded configuration could not be decoded.
    #[error("malformed encoded configuration: {0}")]
    Malformed(&'static str),
}

/// Error variants related to configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeout values are invalid: max must be greater than min.
    #[error("election timeout max must be greater than election timeout min")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be non-zero and less than the election timeout minimum.
    #[error("heartbeat interval must be non-zero and less than the election timeout minimum")]
    InvalidHeartbeatInterval,
    /// The maximum number of payload entries must be non-zero.
    #[error("max payload entries must be non-zero")]
    MaxPayloadEntriesTooSmall,
}
