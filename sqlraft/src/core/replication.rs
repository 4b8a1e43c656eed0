//! Leader-side handling of replication stream events and the progress table.

use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::replication::ProgressMode;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            mode: ProgressMode::Probe,
            recent_recv: false,
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        let res = match event {
            ReplicaEvent::ModeUpdate { target, mode } => self.handle_mode_update(target, mode),
            ReplicaEvent::RecentContact { target } => self.handle_recent_contact(target),
            ReplicaEvent::UpdateMatchIndex { target, matched } => self.handle_update_match_index(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Unavailable);
                return;
            }
        };

        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// A replication stream changed mode; mirror it in the progress table.
    fn handle_mode_update(&mut self, target: NodeId, mode: ProgressMode) -> RaftResult<()> {
        if let Some(node) = self.nodes.get_mut(&target) {
            node.mode = mode;
        }
        self.update_leader_metrics(target);
        self.leader_report_metrics();
        Ok(())
    }

    /// A follower responded to an RPC; feed the leader's contact accounting.
    fn handle_recent_contact(&mut self, target: NodeId) -> RaftResult<()> {
        if let Some(node) = self.nodes.get_mut(&target) {
            node.recent_recv = true;
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        let mut found = false;

        if let Some(node) = self.nodes.get_mut(&target) {
            node.matched = matched;
            node.recent_recv = true;
            found = true;
        }

        if !found {
            // Replication event from a stream which is no longer tracked, ignore.
            return Ok(());
        }

        self.update_leader_metrics(target);

        // Promotion catch-up rounds are measured against the promotee's match index.
        if self.promotion.as_ref().map(|p| p.target == target).unwrap_or(false) {
            self.promotion_update(matched).await?;
        }

        // A deferred leadership transfer fires once the target's persisted log is up to date.
        let transfer_ready = self
            .transfer
            .as_ref()
            .map(|t| t.target == target && !t.timeout_sent && matched.index >= self.core.last_log_id.index)
            .unwrap_or(false);
        if transfer_ready {
            self.send_timeout_now(target);
        }

        // Drop streams to servers which have replicated the configuration entry that removed
        // them from the cluster.
        let remove_now = self
            .nodes
            .get(&target)
            .and_then(|node| node.remove_after_commit)
            .map(|index| matched.index >= index && self.core.commit_index >= index)
            .unwrap_or(false);
        if remove_now {
            self.remove_replication_stream(target);
        }

        self.update_commit_index().await?;
        self.leader_report_metrics();
        Ok(())
    }

    /// Compute the highest index which a strict majority of voters has replicated, and commit
    /// up to it.
    ///
    /// Only entries of the current term are committed by counting replicas (§5.4.2); entries
    /// from prior terms ride along implicitly.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn update_commit_index(&mut self) -> RaftResult<()> {
        let last = self.core.last_log_id.index;
        let majority = self.core.membership.majority();
        let mut new_commit = self.core.commit_index;

        for index in ((self.core.commit_index + 1)..=last).rev() {
            if self.core.log.term_of(index) != Some(self.core.current_term) {
                continue;
            }
            let mut count = 0;
            if self.core.membership.is_voter(self.core.id) {
                count += 1; // The leader's own log always holds its entries.
            }
            for (id, node) in self.nodes.iter() {
                if self.core.membership.is_voter(*id) && node.matched.index >= index {
                    count += 1;
                }
            }
            if count >= majority {
                new_commit = index;
                break;
            }
        }

        if new_commit <= self.core.commit_index {
            return Ok(());
        }

        tracing::debug!(commit_index = new_commit, "commit index advanced");
        self.core.commit_index = new_commit;
        self.core.log.mark_committed(new_commit);

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: new_commit,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // Complete the requests whose entries have just committed, in index order.
        let commit_index = self.core.commit_index;
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.awaiting_committed.len() {
            if self.awaiting_committed[i].entry.log_id.index <= commit_index {
                ready.push(self.awaiting_committed.remove(i));
            } else {
                i += 1;
            }
        }
        for req in ready {
            self.client_request_post_commit(req).await?;
        }

        self.leader_report_metrics();
        Ok(())
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, _target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// A replication stream needs a snapshot to serve its follower.
    ///
    /// Hand over the current snapshot if one exists; otherwise force a compaction and answer
    /// once it completes.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        _target: NodeId,
        tx: tokio::sync::oneshot::Sender<crate::storage::Snapshot>,
    ) -> RaftResult<()> {
        let current = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        if let Some(snapshot) = current {
            let _ = tx.send(snapshot);
            return Ok(());
        }

        // No snapshot exists yet: start one and hand the result over when it lands.
        self.core.trigger_log_compaction_if_needed(true);
        let mut completion = match self.core.snapshot_state.as_ref() {
            Some(snapshotting) => snapshotting.sender.subscribe(),
            None => return Ok(()), // Nothing to compact yet; the stream will ask again.
        };
        let storage = self.core.storage.clone();
        tokio::spawn(
            async move {
                if completion.recv().await.is_err() {
                    return;
                }
                match storage.get_current_snapshot().await {
                    Ok(Some(snapshot)) => {
                        let _ = tx.send(snapshot);
                    }
                    Ok(None) => {}
                    Err(err) => tracing::error!({error=%err}, "error fetching snapshot after compaction"),
                }
            }
            .instrument(tracing::debug_span!("waiting for compaction to serve snapshot")),
        );
        Ok(())
    }

    /// Terminate and drop the replication stream to the given target.
    pub(super) fn remove_replication_stream(&mut self, target: NodeId) {
        if let Some(node) = self.nodes.remove(&target) {
            tracing::debug!(target, "removing target node from replication pool");
            let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
            self.leader_metrics.replication.remove(&target);
        }
    }

    /// Apply a just-appended configuration to leader state: swap the membership in and adjust
    /// the replication streams to the new member set.
    ///
    /// The configuration is uncommitted at this point; quorum math uses it immediately, while
    /// streams to removed servers stay alive until the entry commits on them, so they learn of
    /// their own removal.
    #[tracing::instrument(level = "trace", skip(self, membership))]
    pub(super) fn apply_config_change_as_leader(&mut self, membership: Configuration, index: u64) {
        let old = std::mem::replace(&mut self.core.membership, membership);
        self.core.uncommitted_membership_index = Some(index);

        // Spawn streams for new members.
        let added: Vec<_> = self
            .core
            .membership
            .member_ids()
            .filter(|id| id != &self.core.id && !self.nodes.contains_key(id))
            .collect();
        for target in added {
            tracing::debug!(target, "spawning replication stream for new member");
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Flag streams to removed members; they are dropped once they have replicated this
        // configuration entry.
        for id in old.member_ids() {
            if id != self.core.id && !self.core.membership.contains(id) {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.remove_after_commit = Some(index);
                }
            }
        }
    }

    /// Finish a committed configuration change on the leader.
    ///
    /// Clears the pending change, completes removals, and steps down if this node is no longer
    /// a voter under the committed configuration.
    #[tracing::instrument(level = "trace", skip(self, membership))]
    pub(super) fn handle_config_change_committed(&mut self, membership: Configuration, index: u64) {
        self.core.update_membership_committed(membership, index);

        if self.uncommitted_change.as_ref().map(|c| c.index == index).unwrap_or(false) {
            // The response channel, if any, was already completed by the request path.
            self.uncommitted_change = None;
        }

        // Remove streams which were flagged at append time and have already replicated the
        // configuration entry.
        let to_remove: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|(id, node)| match node.remove_after_commit {
                Some(i) if i <= index && node.matched.index >= i => Some(*id),
                _ => None,
            })
            .collect();
        for target in to_remove {
            self.remove_replication_stream(target);
        }

        // A leader which removed itself from the voters steps down once the change commits.
        if !self.core.membership.is_voter(self.core.id) {
            tracing::debug!("leader is no longer a voter, stepping down");
            self.core.set_target_state(State::Follower);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }

        self.leader_report_metrics();
    }
}
