use std::sync::Arc;

use anyhow::anyhow;
use futures::future::TryFutureExt;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ChangeMembershipError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::ChangeResponseTx;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its
/// response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Entry<D>, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }

    /// Fail this request because the local node stepped down while it was outstanding.
    pub(crate) fn fail_leadership_lost(self) {
        match self.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                let _ = tx.send(Err(ClientWriteError::LeadershipLost));
            }
            ClientOrInternalResponseTx::Internal(Some(tx)) => {
                let _ = tx.send(Err(ChangeMembershipError::LeadershipLost));
            }
            ClientOrInternalResponseTx::Internal(None) => {}
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Internal(Option<ChangeResponseTx>),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to
    /// power, per §8.
    ///
    /// If the cluster has just formed and the current index is 0, the current configuration is
    /// committed as the first entry; otherwise a barrier entry of the new term forces a commit.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req: ClientWriteRequest<D> = if self.core.last_log_id.index == 0 {
            ClientWriteRequest::new_config(self.core.membership.clone())
        } else {
            ClientWriteRequest::new_barrier_payload()
        };

        let entry = self.append_payload_to_log(req.entry).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        // A freshly formed cluster commits its configuration as the first entry; gate any
        // further change until it lands.
        if let EntryPayload::ConfigChange(_) = entry.payload {
            self.uncommitted_change = Some(crate::core::ChangeState {
                index: entry.log_id.index,
            });
        }

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await?;

        Ok(())
    }

    /// Handle client read requests.
    ///
    /// Spawn heartbeats to all voters of the cluster; respond once a majority confirms this
    /// node is still the leader.
    ///
    /// From §8 of the Raft paper:
    /// Second, a leader must check whether it has been deposed before processing a read-only
    /// request (its information may be stale if a more recent leader has been elected). Raft
    /// handles this by having the leader exchange heartbeat messages with a majority of the
    /// cluster before responding to read-only requests.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        let mut confirmed = 0usize;
        let needed = self.core.membership.majority();

        if self.core.membership.is_voter(self.core.id) {
            confirmed += 1;
        }

        // If we already have all needed confirmations, which would be the case for single
        // voter clusters, then respond.
        if confirmed >= needed {
            let _ = tx.send(Ok(()));
            return;
        }

        // Spawn parallel requests, all with the standard timeout for heartbeats.
        let mut pending = FuturesUnordered::new();
        for (id, node) in self.nodes.iter().filter(|(id, _)| self.core.membership.is_voter(**id)) {
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            let task = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(data)) => Ok((target, data)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_timeout) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            )
            .map_err(move |err| (*id, err));
            pending.push(task);
        }

        // Handle responses as they return.
        while let Some(res) = pending.next().await {
            let (_target, data) = match res {
                Ok(Ok(res)) => res,
                Ok(Err((target, err))) => {
                    tracing::error!(target, error=%err, "timeout while confirming leadership for read request");
                    continue;
                }
                Err((target, err)) => {
                    tracing::error!(target, "{}", err);
                    continue;
                }
            };

            // If we receive a response with a greater term, then revert to follower and abort
            // this request.
            if data.term != self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.set_target_state(State::Follower);
                break;
            }

            confirmed += 1;
            if confirmed >= needed {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        // If we've hit this location, then we've failed to gather needed confirmations due to
        // request failures.
        let _ = tx.send(Err(ClientReadError::RaftError(RaftError::RaftNetwork(anyhow!(
            "too many requests failed, could not confirm leadership"
        )))));
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        if let Err(err) = self.replicate_client_request(entry).await {
            tracing::error!(error=%err, "error while replicating client request");
        }
    }

    /// Transform the given payload into an entry, assign an index and term, and append the
    /// entry to the log.
    ///
    /// A configuration-change payload takes effect as soon as it is appended: the membership is
    /// swapped in and the replication streams are adjusted to the new member set.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;

        let arc_entry = Arc::new(entry.clone());
        self.core.log.append(arc_entry);

        if let EntryPayload::ConfigChange(ref change) = entry.payload {
            self.apply_config_change_as_leader(change.membership.clone(), entry.log_id.index);
        }

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response
    /// will be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) -> RaftResult<()> {
        let entry_arc = req.entry.clone();

        self.awaiting_committed.push(req);

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                crate::replication::RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // With no other voters (a single voter cluster, possibly with standbys or spares),
        // the entry is committed by this append alone.
        self.update_commit_index().await
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) -> RaftResult<()> {
        let entry = &req.entry;

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                match &entry.payload {
                    EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(entry).await {
                        Ok(data) => {
                            let _ = tx.send(Ok(ClientWriteResponse {
                                index: req.entry.log_id.index,
                                data,
                            }));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                        }
                    },
                    _ => {
                        // Why is this a bug, and why are we going unavailable? This is because
                        // we can not easily encode these constraints in the type system, and
                        // client requests should be the only log entry types for which a
                        // `ClientOrInternalResponseTx::Client` type is used. This error should
                        // never be hit unless we've done a poor job in code review.
                        tracing::error!("critical error in Raft, this is a programming bug, please open an issue");
                        self.core.set_target_state(State::Unavailable);
                    }
                }
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                let res = match self.apply_entry_to_state_machine(entry).await {
                    Ok(_data) => Ok(entry.log_id.index),
                    Err(err) => {
                        tracing::error!("res of applying to state machine: {:?}", err);
                        Err(err)
                    }
                };

                if let EntryPayload::ConfigChange(ref change) = entry.payload {
                    self.handle_config_change_committed(change.membership.clone(), entry.log_id.index);
                }

                match tx {
                    None => {
                        tracing::debug!("no response tx to send res");
                    }
                    Some(tx) => {
                        let send_res = tx.send(res.map_err(ChangeMembershipError::from));
                        tracing::debug!("send internal response through tx, res: {:?}", send_res);
                    }
                }
            }
        }

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
        Ok(())
    }

    /// Apply the given log entry to the state machine.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        // First, we just ensure that we apply any outstanding up to, but not including, the
        // index of the given entry. We need to be able to return the data response from
        // applying this entry to the state machine.
        //
        // Note that this would only ever happen if a node had unapplied logs from before
        // becoming leader.

        let log_id = &entry.log_id;
        let index = log_id.index;

        let expected_next_index = self.core.last_applied.index + 1;
        if index != expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;

            for prior in entries.iter() {
                // Committed configuration changes from a prior term surface here.
                if let EntryPayload::ConfigChange(ref change) = prior.payload {
                    self.handle_config_change_committed(change.membership.clone(), prior.log_id.index);
                }
            }

            if let Some(last) = entries.last() {
                self.core.last_applied = last.log_id;
            }

            let data_entries: Vec<_> = entries.iter().collect();
            if !data_entries.is_empty() {
                self.core
                    .storage
                    .apply_to_state_machine(&data_entries)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                for applied in data_entries.iter() {
                    self.core.log.mark_applied(applied.log_id.index);
                }
            }
        }

        // Before we can safely apply this entry to the state machine, we need to ensure there
        // is no pending task to replicate entries to the state machine. This is edge case, and
        // would only happen once very early in a new leader's term.
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(replicate_to_sm_result)) = self.core.replicate_to_sm_handle.next().await {
                self.core.handle_replicate_to_sm_result(replicate_to_sm_result)?;
            }
        }

        // Apply this entry to the state machine and return its data response.
        let res = self.core.storage.apply_to_state_machine(&[entry]).await.map_err(|err| {
            // A storage failure while applying committed state is never recoverable.
            self.core.map_fatal_storage_error(err)
        });

        self.core.last_applied = *log_id;
        self.core.sm_target = std::cmp::max(self.core.sm_target, index);
        self.core.log.mark_applied(index);
        self.leader_report_metrics();
        let res = res?;

        Ok(res.into_iter().next().ok_or_else(|| {
            RaftError::RaftStorage(anyhow!("expected one response from apply_to_state_machine"))
        })?)
    }
}
