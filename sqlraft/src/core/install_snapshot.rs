use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to bring a lagging follower up to date with a snapshot (§7).
    ///
    /// The snapshot arrives as a single buffer, so installation is one storage call: no
    /// streaming state has to be tracked between requests. A node busy compacting itself
    /// answers rejected and lets the leader retry.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                rejected: true,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower); // State update will emit metrics.
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // Busy taking a snapshot of our own; the leader will retry.
        if self.snapshot_state.is_some() {
            tracing::debug!("rejecting snapshot install, a local compaction is in progress");
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                rejected: true,
            });
        }

        // Our own state already covers the offered snapshot; just acknowledge.
        if req.meta.last_log_id.index <= self.last_applied.index {
            tracing::debug!(
                offered = %req.meta.last_log_id,
                last_applied = %self.last_applied,
                "ignoring snapshot install, local state is newer"
            );
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                rejected: false,
            });
        }

        self.install_snapshot(req).await?;

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            rejected: false,
        })
    }

    /// Replace the local log and state machine with the given snapshot.
    ///
    /// Any errors which come up from this routine will cause the Raft node to go into
    /// the unavailable state.
    #[tracing::instrument(level = "debug", skip(self, req), fields(snapshot=%req.meta.last_log_id))]
    async fn install_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<()> {
        let meta = req.meta.clone();

        self.storage
            .finalize_snapshot_installation(&meta, req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // The snapshot replaces everything: log, applied state and configuration.
        self.log.restore(meta.last_log_id);
        self.last_log_id = meta.last_log_id;
        self.last_applied = meta.last_log_id;
        self.sm_target = meta.last_log_id.index;
        self.commit_index = meta.last_log_id.index;
        self.snapshot_last_log_id = meta.last_log_id;

        self.membership = meta.membership.clone();
        self.committed_membership = meta.membership;
        self.configuration_committed_index = meta.last_log_id.index;
        self.uncommitted_membership_index = None;

        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
