//! Membership administration: cluster initialization, configuration changes, promotion
//! catch-up rounds and leadership transfer.

use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::FollowerState;
use crate::core::LeaderState;
use crate::core::PromotionState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::TransferState;
use crate::error::ChangeMembershipError;
use crate::error::InitializeError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::raft::ChangeResponseTx;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::TransferResponseTx;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    /// Handle the admin command to initialize a pristine cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        configuration: Configuration,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting init request, node is not pristine");
            return Err(InitializeError::NotAllowed);
        }
        configuration.validate()?;
        if !configuration.contains(self.core.id) {
            tracing::error!("rejecting init request, configuration does not contain this node");
            return Err(InitializeError::NotAllowed);
        }

        // Assign the config as the new cluster membership, in memory only: it is written to
        // the log as the first entry once a leader is established.
        self.core.membership = configuration;

        // Become a candidate and start campaigning for leadership. If this node is the only
        // voter in the cluster, then become leader without holding an election. Non-voting
        // members stay followers and wait for the leader to reach them.
        if self.core.membership.voter_count() == 1 && self.core.membership.is_voter(self.core.id) {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else if self.core.membership.is_voter(self.core.id) {
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by a transferring leader asking this node to start an election at once.
    ///
    /// The receiving node campaigns with `disrupt_leader` set and without a pre-vote round, so
    /// peers that still hear from the old leader grant their votes anyway.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_timeout_now_request(&mut self, req: TimeoutNowRequest) -> RaftResult<TimeoutNowResponse> {
        if req.term < self.current_term {
            return Ok(TimeoutNowResponse {
                term: self.current_term,
            });
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
        }

        let from_current_leader = self.current_leader == Some(req.leader_id);
        if self.target_state.is_follower() && self.is_voter() && from_current_leader {
            tracing::info!(leader = req.leader_id, "received TimeoutNow, starting election");
            self.candidate_pre_vote = false;
            self.candidate_disrupt_leader = true;
            self.set_target_state(State::Candidate);
        }

        Ok(TimeoutNowResponse {
            term: self.current_term,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Guard that no other configuration change is currently in flight.
    fn ensure_no_change_in_progress(&self) -> Result<(), ChangeMembershipError> {
        if self.uncommitted_change.is_some() || self.promotion.is_some() {
            return Err(ChangeMembershipError::ChangeInProgress);
        }
        Ok(())
    }

    /// Add a new server to the cluster with the spare role.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_add_server(&mut self, id: NodeId, address: String, tx: ChangeResponseTx) {
        if let Err(err) = self.ensure_no_change_in_progress() {
            let _ = tx.send(Err(err));
            return;
        }

        let mut configuration = self.core.membership.clone();
        if let Err(err) = configuration.add(id, address, Role::Spare) {
            let _ = tx.send(Err(err.into()));
            return;
        }

        if let Err(err) = self.append_membership_log(configuration, Some(tx)).await {
            tracing::error!({error=%err}, "error appending add-server configuration entry");
        }
    }

    /// Assign a new role to a server.
    ///
    /// A promotion to voter does not change the configuration right away: the promotee is first
    /// granted a bounded number of catch-up rounds, and the configuration-change entry is only
    /// appended once its log has caught up with the leader's. Demotions apply immediately.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_assign(&mut self, id: NodeId, role: Role, tx: ChangeResponseTx) {
        if let Err(err) = self.ensure_no_change_in_progress() {
            let _ = tx.send(Err(err));
            return;
        }

        let current_role = match self.core.membership.get(id) {
            Some(server) => server.role,
            None => {
                let _ = tx.send(Err(ChangeMembershipError::NotFound(id)));
                return;
            }
        };
        if current_role == role {
            let _ = tx.send(Err(ChangeMembershipError::Noop));
            return;
        }

        if role == Role::Voter {
            // The promotee may already be fully caught up, in which case there is nothing to
            // wait for.
            let matched = self.nodes.get(&id).map(|n| n.matched.index).unwrap_or(0);
            if matched >= self.core.last_log_id.index {
                self.finalize_promotion(id, role, Some(tx)).await;
                return;
            }

            tracing::info!(target = id, "starting catch-up rounds for promotion");
            self.promotion = Some(PromotionState {
                target: id,
                role,
                round: 1,
                round_index: self.core.last_log_id.index,
                round_start: Instant::now(),
                tx: Some(tx),
            });
            return;
        }

        // Demotion: apply directly.
        let mut configuration = self.core.membership.clone();
        if let Err(err) = configuration.set_role(id, role) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        if let Err(err) = configuration.validate() {
            let _ = tx.send(Err(err.into()));
            return;
        }
        if let Err(err) = self.append_membership_log(configuration, Some(tx)).await {
            tracing::error!({error=%err}, "error appending assign configuration entry");
        }
    }

    /// Remove a server from the cluster configuration.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_remove_server(&mut self, id: NodeId, tx: ChangeResponseTx) {
        if let Err(err) = self.ensure_no_change_in_progress() {
            let _ = tx.send(Err(err));
            return;
        }

        let mut configuration = self.core.membership.clone();
        if let Err(err) = configuration.remove(id) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        if configuration.voter_count() == 0 {
            let _ = tx.send(Err(ChangeMembershipError::InoperableConfig));
            return;
        }

        if let Err(err) = self.append_membership_log(configuration, Some(tx)).await {
            tracing::error!({error=%err}, "error appending remove-server configuration entry");
        }
    }

    /// Append a configuration-change entry and register it as the in-flight change.
    ///
    /// The response channel is completed once the entry commits and applies; until then any
    /// further change request is rejected.
    #[tracing::instrument(level = "trace", skip(self, resp_tx), fields(id=self.core.id))]
    pub(super) async fn append_membership_log(
        &mut self,
        configuration: Configuration,
        resp_tx: Option<ChangeResponseTx>,
    ) -> RaftResult<()> {
        use crate::core::client::ClientRequestEntry;
        use crate::raft::ClientWriteRequest;

        let payload = ClientWriteRequest::<D>::new_config(configuration);
        let entry = match self.append_payload_to_log(payload.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                let err_str = err.to_string();
                if let Some(tx) = resp_tx {
                    let _ = tx.send(Err(err.into()));
                }
                return Err(crate::error::RaftError::RaftStorage(anyhow::anyhow!(err_str)));
            }
        };

        self.uncommitted_change = Some(crate::core::ChangeState {
            index: entry.log_id.index,
        });

        let cr_entry = ClientRequestEntry::from_entry(entry, resp_tx);
        self.replicate_client_request(cr_entry).await?;

        Ok(())
    }

    /// Promotion progress: called whenever the promotee's match index advances.
    ///
    /// A round completes when the promotee reaches the index anchored at the round's start.
    /// Once the promotee is fully caught up the configuration change is appended; a promotee
    /// that keeps needing rounds past the configured budget is abandoned.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn promotion_update(&mut self, matched: LogId) -> RaftResult<()> {
        let (target, role, round, round_index, round_start) = match self.promotion.as_ref() {
            Some(p) => (p.target, p.role, p.round, p.round_index, p.round_start),
            None => return Ok(()),
        };

        if matched.index < round_index {
            return Ok(());
        }

        // Round complete. Fully caught up means the promotion can be finalized.
        if matched.index >= self.core.last_log_id.index {
            let tx = self.promotion.take().and_then(|p| p.tx);
            self.finalize_promotion(target, role, tx).await;
            return Ok(());
        }

        // The promotee needs another round. Give up on a server which burned through the
        // round budget and is still slower than an election timeout per round.
        let election_timeout = Duration::from_millis(self.core.config.election_timeout_min);
        if round >= self.core.config.max_catch_up_rounds && round_start.elapsed() > election_timeout {
            self.abort_promotion();
            return Ok(());
        }

        if let Some(p) = self.promotion.as_mut() {
            p.round = round + 1;
            p.round_index = self.core.last_log_id.index;
            p.round_start = Instant::now();
            tracing::debug!(target, round = p.round, round_index = p.round_index, "promotion round advanced");
        }
        Ok(())
    }

    /// Append the configuration change which completes a promotion.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn finalize_promotion(&mut self, target: NodeId, role: Role, tx: Option<ChangeResponseTx>) {
        let mut configuration = self.core.membership.clone();
        if let Err(err) = configuration.set_role(target, role) {
            if let Some(tx) = tx {
                let _ = tx.send(Err(err.into()));
            }
            return;
        }
        if let Err(err) = self.append_membership_log(configuration, tx).await {
            tracing::error!({error=%err}, "error appending promotion configuration entry");
        }
    }

    /// Abort an in-flight promotion: the promotee is too slow or unreachable.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn abort_promotion(&mut self) {
        if let Some(promotion) = self.promotion.take() {
            tracing::warn!(target = promotion.target, "aborting promotion, server cannot catch up");
            if let Some(tx) = promotion.tx {
                let _ = tx.send(Err(ChangeMembershipError::NoConnection(promotion.target)));
            }
        }
    }

    /// Periodic check: abort a promotion whose current round has outlived the configured
    /// maximum duration.
    pub(super) fn check_promotion_round_duration(&mut self) {
        let expired = self
            .promotion
            .as_ref()
            .map(|p| p.round_start.elapsed() > Duration::from_millis(self.core.config.max_catch_up_round_duration))
            .unwrap_or(false);
        if expired {
            self.abort_promotion();
        }
    }

    /// Start a leadership transfer to the given target, or to the most up-to-date voter when
    /// the target is 0.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_transfer_leadership(&mut self, target: NodeId, tx: TransferResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeMembershipError::ChangeInProgress));
            return;
        }

        let target = if target == 0 {
            // Pick the most up-to-date voter.
            match self
                .nodes
                .iter()
                .filter(|(id, _)| self.core.membership.is_voter(**id))
                .max_by_key(|(_, node)| node.matched.index)
                .map(|(id, _)| *id)
            {
                Some(id) => id,
                None => {
                    let _ = tx.send(Err(ChangeMembershipError::NotFound(0)));
                    return;
                }
            }
        } else {
            target
        };

        if target == self.core.id || !self.core.membership.is_voter(target) {
            let _ = tx.send(Err(ChangeMembershipError::NotFound(target)));
            return;
        }

        let up_to_date = self
            .nodes
            .get(&target)
            .map(|node| node.matched.index >= self.core.last_log_id.index)
            .unwrap_or(false);

        self.transfer = Some(TransferState {
            target,
            start: Instant::now(),
            timeout_sent: false,
            tx: Some(tx),
        });
        self.core.transfer_target = Some(target);

        // Send the TimeoutNow right away if the target's persisted log is up to date; defer
        // otherwise until its match index gets there.
        if up_to_date {
            self.send_timeout_now(target);
        } else {
            tracing::debug!(target, "deferring TimeoutNow until the target catches up");
        }
    }

    /// Send a TimeoutNow RPC to the transfer target.
    pub(super) fn send_timeout_now(&mut self, target: NodeId) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.timeout_sent = true;
        }
        let rpc = TimeoutNowRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
        };
        let network = self.core.network.clone();
        tokio::spawn(
            async move {
                if let Err(err) = network.send_timeout_now(target, rpc).await {
                    tracing::warn!({error=%err, target}, "error sending TimeoutNow to transfer target");
                }
            }
            .instrument(tracing::debug_span!("sending TimeoutNow", target = target)),
        );
    }

    /// Periodic check: a transfer which has not produced a new leader within an election
    /// timeout expires.
    pub(super) fn check_transfer_expiry(&mut self) {
        let expired = self
            .transfer
            .as_ref()
            .map(|t| t.start.elapsed() > Duration::from_millis(self.core.config.election_timeout_min))
            .unwrap_or(false);
        if expired {
            if let Some(transfer) = self.transfer.take() {
                tracing::warn!(target = transfer.target, "leadership transfer expired");
                self.core.transfer_target = None;
                if let Some(tx) = transfer.tx {
                    let _ = tx.send(Err(ChangeMembershipError::TransferExpired(transfer.target)));
                }
            }
        }
    }
}
