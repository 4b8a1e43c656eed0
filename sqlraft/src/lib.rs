//! sqlraft: a distributed SQL database server.
//!
//! The crate embeds an SQLite-style engine behind trait seams and replicates
//! its write-ahead log across a cluster with the Raft consensus protocol.
//! Clients speak a framed binary protocol over TCP: they open logical
//! database handles, prepare statements and execute queries, while the
//! server persists state through a page store whose WAL frames are fed into
//! Raft, committed, and applied on every replica.
//!
//! The two halves of the crate:
//!
//! - the consensus engine (`raft`, `core`, `replication`, `membership`,
//!   `log`), generic over the [`RaftStorage`] and [`RaftNetwork`] traits;
//! - the client-facing server (`server`), generic over the SQL engine and
//!   page store seams in [`server::sql`].

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod network;
mod quorum;
pub mod raft;
mod raft_types;
pub mod replication;
pub mod server;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;
pub use crate::config::Config;
pub use crate::config::SnapshotPolicy;
pub use crate::error::RaftError;
pub use crate::membership::Configuration;
pub use crate::membership::Role;
pub use crate::membership::Server;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::raft_types::SnapshotId;
pub use crate::raft_types::Update;
pub use crate::storage::RaftStorage;
pub use crate::storage::RaftStorageDebug;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `RaftStorage` impl when ready,
/// and the application may then deal with the data directly in the storage engine without having
/// to do a preliminary deserialization.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the storage layer when an
/// entry is applied to the state machine as part of a client request (this is not used during
/// replication). This allows applications to seamlessly return application specific data from
/// their storage layer, up through Raft, and back into their application for returning data to
/// clients.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A rendering of a message or event, kept cheap enough for tracing at debug level.
pub trait MessageSummary {
    /// Return a brief human readable summary.
    fn summary(&self) -> String;
}
