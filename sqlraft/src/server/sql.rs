//! Trait seams for the external collaborators of the server: the SQL engine, the page store
//! backing its virtual file system, and the cluster interface.
//!
//! The engine is expected to be configured for WAL journaling with 4096-byte pages and fsync
//! off, with WAL replication bound to the VFS name given at open time: committed write
//! transactions surface as WAL frames, which the embedding application routes through Raft and
//! applies to the page store on every replica.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::NodeId;

/// A single value bound to or produced by a statement.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl SqlValue {
    /// The wire type code of this value.
    pub fn type_code(&self) -> u8 {
        match self {
            SqlValue::Integer(_) => 1,
            SqlValue::Float(_) => 2,
            SqlValue::Text(_) => 3,
            SqlValue::Blob(_) => 4,
            SqlValue::Null => 5,
        }
    }
}

/// The outcome of executing a statement to completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: u64,
    pub rows_affected: u64,
}

/// A fully materialized query result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    /// The column names, in order.
    pub columns: Vec<String>,
    /// The result rows; every row has one value per column.
    pub rows: Vec<Vec<SqlValue>>,
}

/// An error record from the SQL engine: primary and extended result codes plus a message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct EngineError {
    pub code: u64,
    pub extended: u64,
    pub message: String,
}

impl EngineError {
    pub fn new(code: u64, extended: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            extended,
            message: message.into(),
        }
    }
}

/// The SQL engine seam.
///
/// The gateway assumes a single-threaded engine: connections and statements are owned by one
/// task and never shared. Implementations must enforce their threading expectations at
/// startup.
pub trait SqlEngine: Send + Sync + 'static {
    type Connection: SqlConnection;

    /// Open a database, configuring WAL journaling, 4096-byte pages, fsync off, and binding
    /// WAL replication to the given VFS name.
    fn open(&self, name: &str, flags: u64, vfs: &str) -> Result<Self::Connection, EngineError>;
}

/// An open database connection.
pub trait SqlConnection: Send + 'static {
    type Statement: SqlStatement;

    /// Compile the given SQL into a prepared statement.
    fn prepare(&mut self, sql: &str) -> Result<Self::Statement, EngineError>;
}

/// A prepared statement.
pub trait SqlStatement: Send + 'static {
    /// Bind the given parameters and step the statement to completion.
    fn exec(&mut self, params: &[SqlValue]) -> Result<ExecResult, EngineError>;

    /// Bind the given parameters and fetch all result rows.
    fn query(&mut self, params: &[SqlValue]) -> Result<Rows, EngineError>;
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A write-ahead-log frame: one page worth of data at a page number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalFrame {
    pub page_number: u32,
    pub data: Bytes,
}

/// The WAL frames of one committed write transaction, as routed through Raft.
///
/// This is the application data type of the server's Raft log: committed frames are applied
/// to the page store on every replica, in log order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalFrames {
    /// The database the transaction belongs to.
    pub db: String,
    pub frames: Vec<WalFrame>,
}

/// The page store behind the engine's virtual file system: a byte-addressable store of pages
/// with whole-database snapshot and restore.
pub trait PageStore: Send + Sync + 'static {
    /// Write a batch of WAL frames into the store, atomically.
    fn apply_frames(&self, db: &str, frames: &[WalFrame]) -> Result<()>;

    /// Capture the current content of a database as a single buffer.
    fn snapshot(&self, db: &str) -> Result<Bytes>;

    /// Replace the content of a database from a snapshot buffer.
    fn restore(&self, db: &str, data: Bytes) -> Result<()>;
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An error from the cluster interface.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The local node is not the cluster leader; the value is the leader's address if known.
    #[error("this node is not the cluster leader")]
    NotLeader(Option<String>),
    /// The cluster interface is unavailable.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// The cluster seam of the gateway: who leads, and who serves.
///
/// Implemented over the Raft handle by the embedding application.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// The id and address of the current cluster leader, if known.
    async fn leader(&self) -> Option<(NodeId, String)>;

    /// The addresses of all cluster members. Fails with `NotLeader` when served by a
    /// non-leader node.
    async fn servers(&self) -> Result<Vec<String>, ClusterError>;
}
