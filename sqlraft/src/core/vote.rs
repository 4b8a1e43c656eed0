use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// Votes are denied when: this node is not a voter; a current leader is known and the
    /// request does not carry `disrupt_leader`; the candidate's log is behind ours; or a vote
    /// has already been cast for another candidate this term, unless the candidate is the
    /// target of this node's in-progress leadership transfer. A pre-vote grant changes no
    /// durable state and echoes the request's term.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // A stale term is denied outright.
        if req.term < self.current_term {
            tracing::debug!({candidate=req.candidate_id, self.current_term, rpc_term=req.term}, "VoteRequest received with smaller term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                pre_vote: req.pre_vote,
            });
        }

        // Observing a higher term on a real vote request updates ours; pre-vote requests
        // deliberately leave durable state alone.
        if !req.pre_vote && req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_hard_state().await?;
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
        }

        let deny = |reason: &str, term: u64, pre_vote: bool| {
            tracing::debug!(candidate = req.candidate_id, reason, "denying vote");
            VoteResponse {
                term,
                vote_granted: false,
                pre_vote,
            }
        };

        // A pre-vote response carries the request's term, so a responder with a stale view of
        // the world cannot suppress the candidate.
        let response_term = if req.pre_vote { req.term } else { self.current_term };

        // Only voters hand out votes.
        if !self.is_voter() {
            return Ok(deny("not a voter", response_term, req.pre_vote));
        }

        // A node that knows a current leader refuses to take part in an election, unless the
        // candidate is deliberately disrupting that leader as part of a leadership transfer.
        // A node that stops hearing from its leader sheds this knowledge by becoming a
        // candidate itself, and a real vote request with a higher term cleared it above.
        if !req.disrupt_leader && self.current_leader.is_some() {
            return Ok(deny("current leader known", response_term, req.pre_vote));
        }

        // The candidate's log must be at least as up-to-date as ours (§5.4.1): compared by
        // last log term, then last log index.
        let local = self.last_log_id;
        let candidate_behind = req.last_log_term < local.term
            || (req.last_log_term == local.term && req.last_log_index < local.index);
        if candidate_behind {
            return Ok(deny("candidate log is behind", response_term, req.pre_vote));
        }

        // A pre-vote grant is stateless.
        if req.pre_vote {
            return Ok(VoteResponse {
                term: response_term,
                vote_granted: true,
                pre_vote: true,
            });
        }

        // At most one real vote per term (§5.4.1), except that the designated target of an
        // in-progress leadership transfer takes the vote even when a competing candidate got
        // there first.
        let is_transfer_target = req.disrupt_leader && self.transfer_target == Some(req.candidate_id);
        match &self.voted_for {
            Some(candidate_id) if candidate_id != &req.candidate_id && !is_transfer_target => {
                Ok(deny("already voted for another candidate", response_term, false))
            }
            _ => {
                // This node is pristine in this term, or is repeating its vote for the same
                // candidate. Persist and grant.
                self.voted_for = Some(req.candidate_id);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!(candidate = req.candidate_id, "voted for candidate");
                self.report_metrics(Update::Ignore);
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                    pre_vote: false,
                })
            }
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Spawn parallel vote requests to all voters of the cluster.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_voters: Vec<_> = self.core.membership.voter_ids().collect();
        let (tx, rx) = mpsc::channel(all_voters.len().max(1));

        // A pre-vote round probes with term + 1 without having bumped the term.
        let term = if self.pre_vote { self.core.current_term + 1 } else { self.core.current_term };
        let rpc = VoteRequest {
            term,
            candidate_id: self.core.id,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
            disrupt_leader: self.disrupt_leader,
            pre_vote: self.pre_vote,
        };

        for member in all_voters.into_iter().filter(|member| member != &self.core.id) {
            let rpc = rpc.clone();
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::error!({error=%err, peer=member}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }

    /// Handle a vote response, returning true once a majority of voters has granted.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<bool> {
        // Responses from an earlier pre-vote round are stale once the real election started.
        if res.pre_vote != self.pre_vote {
            return Ok(false);
        }

        // A newer term on a real vote response means this candidacy is over. Pre-vote
        // responses echo the request's term and cannot carry this signal.
        if !self.pre_vote && res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.set_target_state(State::Follower);
            return Ok(false);
        }

        if !res.vote_granted {
            return Ok(false);
        }

        Ok(self.register_vote(target))
    }
}
