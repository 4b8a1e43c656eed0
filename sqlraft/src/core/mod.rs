//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::ClientRequestEntry;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogCache;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::raft::ChangeResponseTx;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::raft::TransferResponseTx;
use crate::replication::ProgressMode;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

/// The core type implementing the Raft protocol.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    ///
    /// A configuration-change entry takes effect as soon as it is appended; this field may
    /// therefore be ahead of `committed_membership` and is rolled back if the entry is
    /// truncated.
    membership: Configuration,
    /// The most recent membership configuration known to be committed.
    committed_membership: Configuration,
    /// The log index of the committed membership configuration.
    configuration_committed_index: u64,
    /// The index of an appended but not yet committed configuration-change entry, if any.
    uncommitted_membership_index: Option<u64>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,

    /// The in-memory cache of the log suffix.
    ///
    /// Term lookups for log matching, conflict detection and commit computation are answered
    /// here without touching storage.
    log: LogCache<D>,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// The definition of a committed log is that the leader which has created the log has
    /// successfully replicated the log to a majority of the cluster. This value is updated via
    /// AppendEntries RPC from the leader, or if a node is the leader, it will update this value
    /// as new entries have been successfully replicated to a majority of the cluster.
    ///
    /// Is initialized to 0, and increases monotonically. This is always based on the leader's
    /// commit index which is communicated to other members via the AppendEntries protocol.
    commit_index: u64,

    /// The log id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,
    /// The highest log index scheduled for application to the state machine.
    ///
    /// Application happens on a separate task to keep the AppendEntries flow unblocked;
    /// `last_applied` trails this value until the task reports back.
    sm_target: u64,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally based
    /// on the leader's term which is communicated to other members via the AppendEntries
    /// protocol, but this may also be incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// A local snapshot compaction job in progress, if any.
    snapshot_state: Option<Snapshotting>,
    /// The log id upto which the current snapshot includes, inclusive, if a snapshot exists.
    snapshot_last_log_id: LogId,

    /// Whether the next election this node starts should run a pre-vote round.
    candidate_pre_vote: bool,
    /// Whether the next election this node starts is allowed to disrupt a live leader.
    ///
    /// Set by a received TimeoutNow during leadership transfer.
    candidate_disrupt_leader: bool,
    /// The target of an in-progress leadership transfer started by this node, if any.
    ///
    /// The vote handler lets this candidate take the vote even when another candidate already
    /// got it for the term.
    transfer_target: Option<NodeId>,

    /// The stream of join handles from state machine replication tasks. There will only ever
    /// be a maximum of 1 element at a time.
    ///
    /// This abstraction is needed to ensure that replicating to the state machine does not
    /// block the AppendEntries RPC flow, and to ensure that we have a smooth transition to
    /// becoming leader without concern over duplicate application of entries to the state
    /// machine.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let pre_vote = config.pre_vote;
        let this = Self {
            id,
            config,
            membership: Configuration::new(), // This is updated from storage in the main loop.
            committed_membership: Configuration::new(),
            configuration_committed_index: 0,
            uncommitted_membership_index: None,
            network,
            storage,
            target_state: State::Follower,
            log: LogCache::new(LogId::default(), LogId::default()),
            commit_index: 0,
            last_applied: LogId::default(),
            sm_target: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            candidate_pre_vote: pre_vote,
            candidate_disrupt_leader: false,
            transfer_target: None,
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership.clone();
        self.committed_membership = state.membership;
        self.last_applied = state.last_applied_log;
        self.sm_target = state.last_applied_log.index;
        self.snapshot_last_log_id = state.snapshot;
        self.log = LogCache::new(state.last_log_id, state.snapshot);
        // NOTE: this is repeated here for clarity. It is unsafe to initialize the node's commit
        // index to any other value. The commit index must be determined by a leader after
        // successfully committing a new log to the cluster.
        self.commit_index = 0;

        let has_log = self.last_log_id.index != u64::MIN;
        let single_voter = self.membership.voter_count() == 1 && self.membership.is_voter(self.id);

        // If this is the only voter and there is live state, then this is a single-voter
        // cluster. Become leader. Everything else starts as follower; a non-voting member's
        // election timer is simply inert.
        self.target_state = if has_log && single_voter { State::Leader } else { State::Follower };

        if self.target_state == State::Follower {
            // Here we use a 2 second overhead on the initial next_election_timeout. This is
            // because we need to ensure that restarted nodes don't disrupt a stable cluster by
            // timing out and driving up their term before network communication is established.
            let inst = Instant::now()
                + Duration::from_secs(2)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is central loop of the system. The Raft core assumes a few different roles based
        // on cluster state. The Raft core will delegate control to the different state
        // controllers and simply awaits the delegated loop to return, which will only take
        // place if some error has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Unavailable => {
                    // Cancel any compaction still running in the background.
                    if let Some(snapshotting) = self.snapshot_state.take() {
                        snapshotting.handle.abort();
                    }
                    tracing::info!("node has become unavailable");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.snapshot_last_log_id,
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if self.target_state == target_state {
            return;
        }
        debug_assert!(
            State::can_convert(self.target_state, target_state),
            "invalid state transition {:?} -> {:?}",
            self.target_state,
            target_state
        );
        self.target_state = target_state;
    }

    /// Whether this node is a voter under the current configuration.
    fn is_voter(&self) -> bool {
        self.membership.is_voter(self.id)
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    ///
    /// Recognizing a leader also closes the vote exception for a transfer target: whoever now
    /// leads, the transfer has resolved.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
                self.transfer_target = None;
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
                self.transfer_target = None;
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state
    /// must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use
    /// this interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, becoming unavailable");
        self.set_target_state(State::Unavailable);
        RaftError::RaftStorage(err)
    }

    /// Mark a log inconsistency which can not be repaired safely; the node goes unavailable.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_log_inconsistency(&mut self, err: RaftError) -> RaftError {
        tracing::error!({error=%err, id=self.id}, "log inconsistency, becoming unavailable");
        self.set_target_state(State::Unavailable);
        err
    }

    /// Apply an appended but not yet committed configuration to the node.
    ///
    /// Log matching applies configuration changes on receipt; a later truncation rolls them
    /// back via `rollback_membership`.
    #[tracing::instrument(level = "trace", skip(self, cfg))]
    fn update_membership_uncommitted(&mut self, cfg: Configuration, index: u64) {
        self.membership = cfg;
        self.uncommitted_membership_index = Some(index);
        self.report_metrics(Update::Ignore);
    }

    /// Record that the configuration-change entry at `index` has committed.
    #[tracing::instrument(level = "trace", skip(self, cfg))]
    fn update_membership_committed(&mut self, cfg: Configuration, index: u64) {
        self.configuration_committed_index = index;
        self.committed_membership = cfg;
        if self.uncommitted_membership_index == Some(index) {
            self.uncommitted_membership_index = None;
        }
        tracing::debug!(index = self.configuration_committed_index, "configuration committed");
        self.report_metrics(Update::Ignore);
    }

    /// Roll the membership back to the last committed configuration, after a truncation
    /// removed an uncommitted configuration-change entry.
    #[tracing::instrument(level = "trace", skip(self))]
    fn rollback_membership(&mut self, truncated_from: u64) {
        if let Some(index) = self.uncommitted_membership_index {
            if index >= truncated_from {
                tracing::debug!(index, "rolling back uncommitted configuration");
                self.membership = self.committed_membership.clone();
                self.uncommitted_membership_index = None;
                self.report_metrics(Update::Ignore);
            }
        }
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            let prev_snapshot_index = self.snapshot_last_log_id.index;
            self.snapshot_last_log_id = log_id;

            // Trim the log cache to the trailing window. With dynamic trailing, size the
            // window from how many entries the previous snapshot covered, clamped between the
            // snapshot threshold and the configured trailing.
            let trailing = if self.config.dynamic_trailing {
                let covered = log_id.index.saturating_sub(prev_snapshot_index);
                covered.max(self.config.snapshot_threshold()).min(self.config.snapshot_trailing)
            } else {
                self.config.snapshot_trailing
            };
            self.log.snapshot_taken(log_id, trailing);
            self.report_metrics(Update::Ignore);
        }
        self.snapshot_state = None;
    }

    /// Trigger a log compaction (snapshot) job if needed.
    /// If force is True, it will skip the threshold check and start creating snapshot as demanded.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let threshold = self.config.snapshot_threshold();
        // Check to ensure we have actual entries for compaction.
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }

        if !force {
            // If we are below the threshold, then there is nothing to do.
            if self.last_applied.index < self.snapshot_last_log_id.index + threshold {
                return;
            }
        }

        // At this point, we are clear to begin a new compaction process.
        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let f = storage.do_log_compaction();
                let res = Abortable::new(f, reg).await;
                match res {
                    Ok(res) => match res {
                        Ok(snapshot) => {
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id));
                            let _ = chan_tx.send(snapshot.meta.last_log_id.index); // This will always succeed.
                        }
                        Err(err) => {
                            tracing::error!({error=%err}, "error while generating snapshot");
                            let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                        }
                    },
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("beginning new log compaction process")),
        );
    }

    /// Handle the output of an async task replicating entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;

        tracing::debug!("last_applied:{:?}", last_applied_opt);

        if let Some(last_applied) = last_applied_opt {
            for index in (self.last_applied.index + 1)..=last_applied.index {
                self.log.mark_applied(index);
            }
            self.last_applied = last_applied;
        }

        self.report_metrics(Update::Ignore);
        self.trigger_log_compaction_if_needed(false);
        Ok(())
    }

    /// Schedule application of committed entries to the state machine, in index order.
    ///
    /// The apply itself runs on a spawned task so the RPC flow stays responsive; entries are
    /// inspected inline for committed configuration changes before the task is dispatched.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn replicate_to_state_machine_if_needed(&mut self) -> RaftResult<()> {
        if self.sm_target >= self.commit_index {
            return Ok(());
        }
        let start = self.sm_target + 1;
        let stop = self.commit_index + 1;

        let entries = self.fetch_entries(start, stop).await?;
        self.log.mark_committed(self.commit_index);

        for entry in entries.iter() {
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                self.update_membership_committed(change.membership.clone(), entry.log_id.index);
            }
        }
        self.sm_target = self.commit_index;

        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let refs: Vec<_> = entries.iter().map(|e| e.as_ref()).collect();
            if !refs.is_empty() {
                storage.apply_to_state_machine(&refs).await?;
            }
            Ok(entries.last().map(|e| e.log_id))
        });
        self.replicate_to_sm_handle.push(handle);
        Ok(())
    }

    /// Fetch entries `[start, stop)`, preferring the log cache and falling back to storage.
    async fn fetch_entries(&mut self, start: u64, stop: u64) -> RaftResult<Vec<Arc<Entry<D>>>> {
        let n = (stop - start) as usize;
        let cached = self.log.acquire(start, n);
        if cached.len() == n && cached.first().map(|e| e.log_id.index) == Some(start) {
            return Ok(cached);
        }
        let entries = self
            .storage
            .get_log_entries(start..stop)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(entries.into_iter().map(Arc::new).collect())
    }

    /// Reject an init config request due to the Raft node being in a state which prohibits the request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Reject a proposed config change request due to the Raft node not being the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ChangeResponseTx) {
        let _ = tx.send(Err(ChangeMembershipError::NodeNotLeader(self.current_leader)));
    }

    /// Reject a leadership transfer request due to the Raft node not being the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_transfer_not_leader(&self, tx: TransferResponseTx) {
        let _ = tx.send(Err(ChangeMembershipError::NodeNotLeader(self.current_leader)));
    }

    /// Forward the given client write request to the leader.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        match req.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, self.current_leader)));
            }
            _ => {
                // This is unreachable, and well controlled by the type system, but let's log an
                // error for good measure.
                tracing::error!("unreachable branch hit, attempting to forward a Raft internal entry");
            }
        }
    }

    /// Forward the given client read request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(crate::error::ClientReadError::ForwardToLeader(self.current_leader)));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// A local snapshot compaction job in progress.
pub(self) struct Snapshotting {
    /// A handle to abort the compaction process early if needed.
    pub handle: AbortHandle,
    /// A sender for notifying any other tasks of the completion of this compaction.
    pub sender: broadcast::Sender<u64>,
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given index.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    ///
    /// Non-voting members (standbys and spares) are followers whose election timer never
    /// fires.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node is not taking part in the cluster: it is shutting down, or it hit a fatal
    /// storage error or a log inconsistency. Terminal.
    Unavailable,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Whether a conversion between two states is legal.
    pub fn can_convert(from: State, to: State) -> bool {
        use State::*;
        matches!(
            (from, to),
            (Follower, Candidate)
                | (Candidate, Follower)
                | (Candidate, Leader)
                | (Candidate, Candidate)
                | (Leader, Follower)
                | (Follower, Follower)
                | (Follower, Leader) // single-voter startup and initialize
                | (Follower, Unavailable)
                | (Candidate, Unavailable)
                | (Leader, Unavailable)
                | (Unavailable, Follower)
        )
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The leader's record of a follower's replication progress.
struct ReplicationState<D: AppData> {
    /// The most recent log id known to be replicated on the target.
    pub matched: LogId,
    /// The replication mode the target's stream is in.
    pub mode: ProgressMode,
    /// Whether the target responded to an RPC since the last contact check.
    pub recent_recv: bool,
    /// Remove the stream once the entry at this index commits; set when a committed
    /// configuration no longer contains the target.
    pub remove_after_commit: Option<u64>,
    /// The handle to the replication stream task.
    pub replstream: ReplicationStream<D>,
}

/// The state of an uncommitted configuration-change request on the leader.
///
/// The response channel of the originating request rides the awaiting-committed queue; this
/// record only gates further changes until the entry commits.
struct ChangeState {
    /// The index of the appended configuration-change entry.
    pub index: u64,
}

/// Catch-up bookkeeping for a server being promoted to voter.
struct PromotionState {
    /// The server being promoted.
    pub target: NodeId,
    /// The role the server will get once caught up.
    pub role: Role,
    /// The current catch-up round, starting at 1.
    pub round: u64,
    /// The log index the current round is trying to reach.
    pub round_index: u64,
    /// When the current round started.
    pub round_start: Instant,
    /// The response channel of the originating request.
    pub tx: Option<ChangeResponseTx>,
}

/// The state of an in-progress leadership transfer.
struct TransferState {
    /// The server leadership is being transferred to.
    pub target: NodeId,
    /// When the transfer started; it expires an election timeout later.
    pub start: Instant,
    /// Whether the TimeoutNow has been sent to the target.
    pub timeout_sent: bool,
    /// The response channel of the originating request.
    pub tx: Option<TransferResponseTx>,
}

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    ///
    /// This is the leader's progress table: one entry per configuration member except the
    /// leader itself, regardless of role.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,

    /// The metrics about a leader.
    pub leader_metrics: LeaderMetrics,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,

    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A buffer of client requests which have been appended locally and are awaiting to be
    /// committed to the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry<D, R>>,

    /// The configuration change currently in flight, if any. A second change is rejected
    /// until this one commits.
    pub(super) uncommitted_change: Option<ChangeState>,
    /// Promotion bookkeeping for a server being brought up to voter, if any.
    pub(super) promotion: Option<PromotionState>,
    /// An in-progress leadership transfer, if any.
    pub(super) transfer: Option<TransferState>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
            uncommitted_change: None,
            promotion: None,
            transfer: None,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams for every other member of the configuration.
        let targets: Vec<_> = self.core.membership.member_ids().filter(|id| id != &self.core.id).collect();

        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        // The leader checks once per election timeout that a majority of voters is still
        // responding; silence from the quorum means this leader is partitioned and must step
        // down.
        let mut contact_check = interval(Duration::from_millis(self.core.config.election_timeout_min));
        contact_check.tick().await; // The first tick fires immediately.

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                self.leave();
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                _ = contact_check.tick() => {
                    self.check_voter_contact();
                    self.check_promotion_round_duration();
                    self.check_transfer_expiry();
                }
                Some((msg,span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            tracing::debug!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            tracing::debug!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            tracing::debug!("leader recv from rx_api: InstallSnapshot, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.handle_client_read_request(tx).await;
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddServer{id, address, tx} => {
                            self.handle_add_server(id, address, tx).await;
                        }
                        RaftMsg::Assign{id, role, tx} => {
                            self.handle_assign(id, role, tx).await;
                        }
                        RaftMsg::RemoveServer{id, tx} => {
                            self.handle_remove_server(id, tx).await;
                        }
                        RaftMsg::TransferLeadership{target, tx} => {
                            self.handle_transfer_leadership(target, tx).await;
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    tracing::debug!("leader recv from rx_compaction: {:?}", update);
                    self.core.update_snapshot_state(update);
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    tracing::debug!("leader recv from replication_rx: {:?}", event.summary());
                    let _ent = span.enter();
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Unavailable);
                }
            }
        }
    }

    /// Tear down leader-only state on the way out of the leader loop.
    ///
    /// Every queued request is failed with a leadership-lost error, pending change and
    /// promotion requests are cancelled, and all replication streams are terminated.
    fn leave(&mut self) {
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
        }

        for req in self.awaiting_committed.drain(..) {
            req.fail_leadership_lost();
        }
        self.uncommitted_change = None;
        if let Some(promotion) = self.promotion.take() {
            if let Some(tx) = promotion.tx {
                let _ = tx.send(Err(ChangeMembershipError::LeadershipLost));
            }
        }
        if let Some(transfer) = self.transfer.take() {
            if let Some(tx) = transfer.tx {
                // Stepping down after the TimeoutNow went out is the expected outcome of a
                // transfer: the target campaigned in a higher term.
                if transfer.timeout_sent {
                    let _ = tx.send(Ok(()));
                } else {
                    let _ = tx.send(Err(ChangeMembershipError::LeadershipLost));
                }
            }
            // With a TimeoutNow in flight the target's vote request may still be on its way;
            // its vote exception must survive this step-down, until a leader of the new term
            // is recognized.
            if !transfer.timeout_sent {
                self.core.transfer_target = None;
            }
        }
    }

    /// Count voters with recent contact; step down when a majority has gone silent.
    #[tracing::instrument(level = "trace", skip(self))]
    fn check_voter_contact(&mut self) {
        let mut contacts = 1; // self
        for (id, node) in self.nodes.iter_mut() {
            if self.core.membership.is_voter(*id) && node.recent_recv {
                contacts += 1;
            }
            node.recent_recv = false;
        }
        if !self.core.membership.is_voter(self.core.id) {
            contacts -= 1;
        }
        if contacts < self.core.membership.majority() {
            tracing::warn!(
                contacts,
                majority = self.core.membership.majority(),
                "lost contact with a majority of voters, stepping down"
            );
            self.core.set_target_state(State::Follower);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }

    /// Refresh the leader metrics entry for one target.
    fn update_leader_metrics(&mut self, target: NodeId) {
        if let Some(node) = self.nodes.get(&target) {
            self.leader_metrics.replication.insert(target, ReplicationMetrics {
                matched: node.matched,
                mode: node.mode,
            });
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The vote tally: one slot per voter, indexed by voter position within the configuration.
    votes: Vec<bool>,
    /// Whether the current round is a pre-vote round.
    pre_vote: bool,
    /// Whether this candidacy is deliberately disrupting a live leader (leadership transfer).
    disrupt_leader: bool,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let pre_vote = core.candidate_pre_vote;
        let disrupt_leader = core.candidate_disrupt_leader;
        // Reset the triggers: the next natural timeout election goes back to the configured
        // behavior.
        core.candidate_pre_vote = core.config.pre_vote;
        core.candidate_disrupt_leader = false;
        Self {
            core,
            votes: Vec::new(),
            pre_vote,
            disrupt_leader,
        }
    }

    /// Tally a granted vote from the given peer. Returns true when a majority is reached.
    pub(self) fn register_vote(&mut self, from: NodeId) -> bool {
        if let Some(i) = self.core.membership.index_of_voter(from) {
            if let Some(slot) = self.votes.get_mut(i) {
                *slot = true;
            }
        }
        let granted = self.votes.iter().filter(|v| **v).count();
        granted >= self.core.membership.majority()
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup initial state per round: a fresh tally with our own vote in it.
            self.votes = vec![false; self.core.membership.voter_count()];
            if let Some(i) = self.core.membership.index_of_voter(self.core.id) {
                self.votes[i] = true;
            }

            // Setup new term. A pre-vote round probes with term + 1 but does not bump or
            // persist anything; only a real election mutates hard state.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            if !self.pre_vote {
                self.core.current_term += 1;
                self.core.voted_for = Some(self.core.id);
                self.core.save_hard_state().await?;
            }
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.report_metrics(Update::Update(None));

            // Send RPCs to all voters in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    _ = timeout_fut => break, // This election has timed-out. Break to outer loop, which starts a new term.
                    Some((res, peer)) = pending_votes.recv() => {
                        if self.handle_vote_response(res, peer).await? {
                            // Majority reached. A pre-vote majority restarts the flow as a
                            // real election; a real majority makes us leader.
                            if self.pre_vote {
                                self.pre_vote = false;
                                break;
                            }
                            self.core.set_target_state(State::Leader);
                        }
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();

                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot{rpc, tx} => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::TimeoutNow{rpc, tx} => {
                                let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                            }
                            RaftMsg::ClientReadRequest{tx} => {
                                self.core.forward_client_read_request(tx);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                            RaftMsg::Initialize{tx, ..} => {
                                self.core.reject_init_with_config(tx);
                            }
                            RaftMsg::AddServer{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::Assign{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::RemoveServer{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::TransferLeadership{tx, ..} => {
                                self.core.reject_transfer_not_leader(tx);
                            }
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        // Errors herein will trigger shutdown, so no need to process error.
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Unavailable),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout()); // Value is updated as heartbeats are received.

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // An election timeout only matters to a voter with no snapshot work in
                // flight; anyone else just re-arms the timer.
                _ = election_timeout => {
                    if self.core.is_voter() && self.core.snapshot_state.is_none() {
                        tracing::debug!(last_heartbeat=?self.core.last_heartbeat, "election timeout, becoming candidate");
                        self.core.set_target_state(State::Candidate);
                    } else {
                        self.core.update_next_election_timeout(false);
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();

                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientReadRequest{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::Initialize{configuration, tx} => {
                            let _ = tx.send(self.handle_init_with_config(configuration).await);
                        }
                        RaftMsg::AddServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::Assign{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::RemoveServer{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::TransferLeadership{tx, ..} => {
                            self.core.reject_transfer_not_leader(tx);
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Unavailable),
            }
        }
    }
}
