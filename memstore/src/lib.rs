//! In-memory implementations of the sqlraft collaborator traits, used by the test suites.
//!
//! [`MemStore`] implements `RaftStorage` over plain maps; the `engine` module provides a toy
//! SQL engine and an in-memory page store for exercising the gateway and server.

pub mod engine;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use sqlraft::membership::Configuration;
use sqlraft::raft::Entry;
use sqlraft::raft::EntryPayload;
use sqlraft::storage::HardState;
use sqlraft::storage::InitialState;
use sqlraft::storage::Snapshot;
use sqlraft::storage::SnapshotMeta;
use sqlraft::LogId;
use sqlraft::NodeId;
use sqlraft::RaftStorage;
use sqlraft::RaftStorageDebug;
use tokio::sync::RwLock;

/// The application data request type for the in-memory store.
///
/// Conceptually this request is a set of WAL frames; for the purposes of the test suites a
/// client-stamped status update keeps assertions simple.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should
    /// probably be an enum representing all of the various types of requests / operations
    /// which a client can perform.
    pub status: String,
}

/// The application data response type for the in-memory store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse(pub Option<String>);

/// The state machine of the in-memory store.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemStoreStateMachine {
    pub last_applied_log: u64,
    /// A mapping of client IDs to their state info, for request deduplication.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `RaftStorage` trait.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    sm: RwLock<MemStoreStateMachine>,
    hs: RwLock<Option<HardState>>,
    current_snapshot: RwLock<Option<Snapshot>>,
    snapshot_counter: RwLock<u64>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(MemStoreStateMachine::default()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
            snapshot_counter: RwLock::new(0),
        }
    }

    /// The id this store was created for.
    pub fn id(&self) -> NodeId {
        self.id
    }

    async fn membership_from_log(&self) -> Option<Configuration> {
        let log = self.log.read().await;
        log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(change) => Some(change.membership.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<Configuration> {
        if let Some(cfg) = self.membership_from_log().await {
            return Ok(cfg);
        }
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot.as_ref().map(|s| s.meta.membership.clone()).unwrap_or_default())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = log.values().rev().next().map(|e| e.log_id).unwrap_or_default();
                let snapshot = self
                    .current_snapshot
                    .read()
                    .await
                    .as_ref()
                    .map(|s| s.meta.last_log_id)
                    .unwrap_or_default();
                let last_applied_index = sm.last_applied_log;
                let last_applied_log = if last_applied_index == snapshot.index {
                    snapshot
                } else {
                    log.get(&last_applied_index).map(|e| e.log_id).unwrap_or(LogId {
                        term: 0,
                        index: last_applied_index,
                    })
                };
                Ok(InitialState {
                    last_log_id: if last_log_id.index >= snapshot.index { last_log_id } else { snapshot },
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                    snapshot,
                })
            }
            None => {
                let new = InitialState::new_initial();
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<_> = log.range(start..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id.index;
            match &entry.payload {
                EntryPayload::Barrier | EntryPayload::ConfigChange(_) => res.push(ClientResponse(None)),
                EntryPayload::Normal(normal) => {
                    let data = &normal.data;
                    if let Some((serial, response)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(response.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses
                        .insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(ClientResponse(previous));
                }
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot> {
        let (data, last_applied_log);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership = self.get_membership_config().await?;

        let snapshot_id = {
            let mut counter = self.snapshot_counter.write().await;
            *counter += 1;
            format!("{}-{}-{}", self.id, last_applied_log, counter)
        };

        let previous = self
            .current_snapshot
            .read()
            .await
            .as_ref()
            .map(|s| s.meta.last_log_id)
            .unwrap_or_default();

        let snapshot = {
            let mut log = self.log.write().await;
            let term = log
                .get(&last_applied_log)
                .map(|e| e.log_id.term)
                .unwrap_or(if previous.index == last_applied_log { previous.term } else { 0 });

            // Drop the compacted prefix.
            let keys: Vec<_> = log.range(..=last_applied_log).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }

            Snapshot {
                meta: SnapshotMeta {
                    last_log_id: LogId {
                        term,
                        index: last_applied_log,
                    },
                    membership,
                    snapshot_id,
                },
                data: Bytes::from(data),
            }
        };

        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(snapshot.clone());
        }

        tracing::trace!({ snapshot_size = snapshot.data.len() }, "log compaction complete");
        Ok(snapshot)
    }

    #[tracing::instrument(level = "trace", skip(self, data))]
    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, data: Bytes) -> Result<()> {
        let new_sm: MemStoreStateMachine = serde_json::from_slice(&data)?;
        {
            let mut sm = self.sm.write().await;
            *sm = new_sm;
            sm.last_applied_log = meta.last_log_id.index;
        }
        {
            let mut log = self.log.write().await;
            let keys: Vec<_> = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
        }
        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(Snapshot {
                meta: meta.clone(),
                data,
            });
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.current_snapshot.read().await.clone())
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}
