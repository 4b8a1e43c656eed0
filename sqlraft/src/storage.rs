//! The Raft storage interface and data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::Configuration;
use crate::raft::Entry;
use crate::raft_types::SnapshotId;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// Metadata of a snapshot: the log position it covers, the membership configuration in force at
/// that position, and an id for transfer bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    /// Log entries up to which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: Configuration,
    /// To identify a snapshot when transferring.
    ///
    /// Caveat: even when two snapshots are built with the same `last_log_id`, they can still
    /// differ in bytes.
    pub snapshot_id: SnapshotId,
}

/// A snapshot of the state machine: metadata plus the state as a single buffer.
///
/// Snapshots cross the wire in one piece; the data buffer is shared, not copied, on its way
/// through the replication streams.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

/// A record holding the hard state of a Raft node.
///
/// Both fields must be durable before `save_hard_state` returns.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry of the log.
    pub last_log_id: LogId,
    /// The id of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster configuration found in the log or snapshot, else an empty
    /// configuration for a pristine node.
    pub membership: Configuration,
    /// The position covered by the current snapshot, `0-0` if none exists.
    pub snapshot: LogId,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Configuration::new(),
            snapshot: LogId::default(),
        }
    }
}

/// A trait defining the interface for the Raft persistence layer.
///
/// The engine relies on a few ordering invariants from implementations: append callbacks
/// complete in submission order, a truncation takes effect before any append submitted after
/// it, and the hard state is durable before `save_hard_state` returns.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Get the latest membership config found in the log or snapshot.
    ///
    /// This must be implemented as a reverse search through the log for the most recent
    /// configuration-change entry, falling back to the configuration embedded in the current
    /// snapshot, and finally to an empty configuration for a pristine store.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn get_membership_config(&self) -> Result<Configuration>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system
    /// to fetch the last known state from stable storage. If no such entry exists due to being
    /// the first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state, durably.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage, `[start, stop)`.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry. Returns `None` when the entry has been compacted away or never
    /// existed.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Delete all logs from `start` onwards, inclusive.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn delete_logs_from(&self, start: u64) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used
    /// to determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of entries to the state machine, in order.
    ///
    /// Only committed entries reach this method. This is where the application's business logic
    /// lives: for this crate's server, applying a command entry writes its WAL frames into the
    /// page store on this replica.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state, in
    /// order to preserve the safety of the data and avoid corruption.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Perform log compaction, returning the generated snapshot.
    ///
    /// The compaction can only cover the breadth of the log up to the last applied entry; the
    /// implementation should checkpoint its state machine and use that checkpoint's last
    /// applied log as the snapshot position.
    ///
    /// Errors returned from this method will be logged and retried on the next trigger.
    async fn do_log_compaction(&self) -> Result<Snapshot>;

    /// Install a snapshot received from the cluster leader.
    ///
    /// The state machine is replaced with the snapshot contents, all log entries through
    /// `meta.last_log_id.index` are deleted, and the snapshot becomes the current one.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, data: Bytes) -> Result<()>;

    /// Get the current snapshot, if any.
    ///
    /// Errors returned from this method will cause Raft to go into the unavailable state.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
