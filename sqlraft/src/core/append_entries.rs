use std::sync::Arc;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogCache;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=req.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.prev_log_id.index.max(1),
                last_log_index: self.last_log_id.index,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        let mut report_metrics = false;

        // Update current term if needed.
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // An append from the current term settles any candidacy: the peer won.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // Log matching (§5.3): the entry at prev_log_id must be present with the same term.
        if !self.log_id_matches(req.prev_log_id).await? {
            tracing::debug!(
                prev_log_id = %req.prev_log_id,
                last_log_id = %self.last_log_id,
                "rejecting AppendEntries, log matching failed"
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.prev_log_id.index.max(1),
                last_log_index: self.last_log_id.index,
            });
        }

        if !req.entries.is_empty() {
            self.append_log_entries(req.entries).await?;
        }

        // Advance the commit index to min(leader_commit, last log index) and kick the apply
        // loop; applying happens off-task and strictly in index order.
        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_log_id.index);
            self.replicate_to_state_machine_if_needed().await?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.last_log_id.index,
        })
    }

    /// Whether the local log holds the given log id, per the log matching property.
    ///
    /// Entries at or before the snapshot position are committed and identical on every node,
    /// so they match by definition.
    async fn log_id_matches(&mut self, prev: LogId) -> RaftResult<bool> {
        if prev.index == 0 {
            return Ok(true);
        }
        if prev.index < self.snapshot_last_log_id.index {
            return Ok(true);
        }
        if let Some(term) = self.log.term_of(prev.index) {
            return Ok(term == prev.term);
        }
        // The cache starts empty after a restart; fall back to storage.
        let entry = self
            .storage
            .try_get_log_entry(prev.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(matches!(entry, Some(e) if e.log_id.term == prev.term))
    }

    /// Append the entries of an accepted AppendEntries request.
    ///
    /// Entries already present (same index and term) are skipped; a conflicting suffix is
    /// truncated first; the rest is persisted, cached, and any configuration-change entry
    /// among them takes effect immediately, uncommitted.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: Vec<Entry<D>>) -> RaftResult<()> {
        let mut to_append = Vec::with_capacity(entries.len());
        for entry in entries {
            let index = entry.log_id.index;
            if index <= self.snapshot_last_log_id.index {
                // Already compacted into the snapshot.
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.local_term_of(index).await? {
                Some(term) if term == entry.log_id.term => continue, // Already present.
                Some(_) => {
                    // Conflict: remove this entry and everything after it, then append from
                    // here on.
                    self.truncate_conflict(index).await?;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        if to_append.is_empty() {
            return Ok(());
        }

        let refs: Vec<_> = to_append.iter().collect();
        self.storage.append_to_log(&refs).await.map_err(|err| self.map_fatal_storage_error(err))?;

        for entry in to_append {
            let entry = Arc::new(entry);
            self.last_log_id = entry.log_id;
            self.log.append(entry.clone());
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                self.update_membership_uncommitted(change.membership.clone(), entry.log_id.index);
            }
        }
        self.report_metrics(Update::Ignore);
        Ok(())
    }

    /// The local term at the given index, from the cache or storage.
    async fn local_term_of(&mut self, index: u64) -> RaftResult<Option<u64>> {
        if index > self.last_log_id.index {
            return Ok(None);
        }
        if let Some(term) = self.log.term_of(index) {
            return Ok(Some(term));
        }
        let entry = self
            .storage
            .try_get_log_entry(index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(entry.map(|e| e.log_id.term))
    }

    /// Remove the conflicting suffix of the log, from `index` onwards.
    ///
    /// Truncating a committed entry is a cluster-level invariant break; the node goes
    /// unavailable rather than rewrite history.
    async fn truncate_conflict(&mut self, index: u64) -> RaftResult<()> {
        if index <= self.commit_index {
            let err = RaftError::LogInconsistency(format!(
                "refusing to truncate committed entry at index {} (commit index {})",
                index, self.commit_index
            ));
            return Err(self.map_log_inconsistency(err));
        }

        tracing::debug!(index, "truncating conflicting log suffix");

        let in_cache = self.log.first_index().map(|first| index >= first).unwrap_or(false);
        if in_cache {
            let res = self.log.truncate(index);
            if let Err(err) = res {
                return Err(self.map_log_inconsistency(err));
            }
            self.storage
                .delete_logs_from(index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            // If the whole cached suffix went away, the term of the new tail is only known
            // to storage.
            let last = self.log.last_log_id();
            if last.index > 0 && last.term == 0 {
                let prev = self
                    .storage
                    .try_get_log_entry(last.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                let last = prev.map(|e| e.log_id).unwrap_or(self.snapshot_last_log_id);
                self.log = LogCache::new(last, self.snapshot_last_log_id);
            }
        } else {
            // The conflict predates the cache (fresh restart): truncate storage and rebuild
            // the cache at the new tail.
            self.storage
                .delete_logs_from(index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let prev = self
                .storage
                .try_get_log_entry(index - 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let last = prev.map(|e| e.log_id).unwrap_or(self.snapshot_last_log_id);
            self.log = LogCache::new(last, self.snapshot_last_log_id);
        }

        self.rollback_membership(index);
        self.last_log_id = self.log.last_log_id();
        Ok(())
    }
}
