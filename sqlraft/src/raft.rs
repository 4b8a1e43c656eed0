//! Public Raft interface and data types.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeMembershipError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building on top of Raft
/// will use this to spawn a Raft task and interact with the spawned task.
///
/// For more information on the Raft protocol, see
/// [the specification here](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft
/// node is shutting down (potentially for data safety reasons due to a storage error), and the
/// `shutdown` method should be called on this type to await the shutdown of the node. If the
/// parent application needs to shutdown the Raft node for any reason, calling `shutdown` will
/// do the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should
    /// be persisted in a well known location, probably alongside the Raft log and the
    /// application's state machine.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs
    /// to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather
    /// votes (§5.2). Pre-vote requests flow through the same entry point.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node
    /// up-to-speed with the leader (§7). The snapshot data travels as a single buffer.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a TimeoutNow RPC to this Raft node.
    ///
    /// Sent by a leader which is transferring its leadership to this node; a voter receiving it
    /// starts an election immediately, disrupting the current leader on purpose.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn timeout_now(&self, rpc: TimeoutNowRequest) -> Result<TimeoutNowResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::TimeoutNow { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID and address of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date; however, the `client_read` method must still be used to guard against stale
    /// reads. This method is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<(NodeId, String)> {
        let metrics = self.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let address = metrics.membership_config.get(leader).map(|s| s.address.clone())?;
        Some((leader, address))
    }

    /// Check to ensure this node is still the cluster leader, in order to guard against stale
    /// reads (§8).
    ///
    /// The actual read operation itself is up to the application, this method just ensures that
    /// the read will not be stale.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::ClientReadRequest { tx }, span))
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;

        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// If the node is not the leader, the request fails with `ForwardToLeader` carrying the
    /// current leader if known; the caller is expected to retry there.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        let res = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, span));

        if let Err(e) = res {
            tracing::error!("error when Raft::client_write: send to tx_api: {}", e);
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }

        match rx.await {
            Ok(v) => {
                if let Err(ref e) = v {
                    tracing::error!("error Raft::client_write: {:?}", e);
                }
                v
            }
            Err(e) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", e);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Initialize a pristine Raft node with the given cluster configuration.
    ///
    /// This command should be called on pristine nodes, where the log index is 0 and the
    /// current term is 0; anything else indicates that the cluster is already formed and in
    /// motion, and `InitializeError::NotAllowed` will be returned.
    ///
    /// The configuration must contain this node, have unique ids and addresses and at least
    /// one voter. Every member of the cluster should be initialized with the same
    /// configuration; Raft guarantees that the first node to become leader will propagate only
    /// its own.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, configuration: Configuration) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::Initialize { configuration, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Add a new server to the cluster with the spare role (§6).
    ///
    /// A spare receives replicated entries but takes part in neither quorums nor elections; use
    /// [`Raft::assign`] to promote it once it has caught up. The returned index is that of the
    /// committed configuration-change entry.
    ///
    /// If this Raft node is not the cluster leader, then this call will fail.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn add_server(&self, id: NodeId, address: String) -> Result<u64, ChangeMembershipError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::AddServer { id, address, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        match rx.await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ChangeMembershipError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Assign a new role to a server (§6).
    ///
    /// Assigning the voter role to a standby or spare starts the catch-up machinery: the leader
    /// grants the promotee a bounded number of rounds to reach the head of the log, and only
    /// then appends the configuration change. A promotee which is too slow or unreachable fails
    /// the request with `ChangeMembershipError::NoConnection` and keeps its old role.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn assign(&self, id: NodeId, role: Role) -> Result<u64, ChangeMembershipError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::Assign { id, role, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        match rx.await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ChangeMembershipError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Remove a server from the cluster configuration (§6).
    ///
    /// Removing the leader itself is allowed: once the configuration change commits on the
    /// remaining servers, the leader steps down to follower and a new election takes place.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn remove_server(&self, id: NodeId) -> Result<u64, ChangeMembershipError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::RemoveServer { id, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        match rx.await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ChangeMembershipError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Transfer leadership to the given voter (§3.10 of the Raft dissertation).
    ///
    /// With `target = 0` the most up-to-date voter is chosen. The leader sends a TimeoutNow to
    /// the target once its persisted log is up-to-date; the call completes when the target wins
    /// an election in a higher term, or fails with `TransferExpired` after an election timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(target=target))]
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<(), ChangeMembershipError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::TransferLeadership { target, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        match rx.await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ChangeMembershipError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use sqlraft::{core::State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait for raft node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;
pub(crate) type ChangeResponseTx = oneshot::Sender<Result<u64, ChangeMembershipError>>;
pub(crate) type TransferResponseTx = oneshot::Sender<Result<(), ChangeMembershipError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
        tx: oneshot::Sender<Result<TimeoutNowResponse, RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    ClientReadRequest {
        tx: ClientReadResponseTx,
    },
    Initialize {
        configuration: Configuration,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddServer {
        id: NodeId,
        address: String,
        tx: ChangeResponseTx,
    },
    Assign {
        id: NodeId,
        role: Role,
        tx: ChangeResponseTx,
    },
    RemoveServer {
        id: NodeId,
        tx: ChangeResponseTx,
    },
    TransferLeadership {
        target: NodeId,
        tx: TransferResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Zero if the entries were accepted, else the `prev_log_index` which failed the log
    /// matching check.
    pub rejected: u64,
    /// The index of the last entry persisted on the responding node.
    ///
    /// On rejection the leader caps its next probe at this value; on success it advances the
    /// follower's match index to it.
    pub last_log_index: u64,
}

impl AppendEntriesResponse {
    /// Whether the request was accepted.
    pub fn success(&self) -> bool {
        self.rejected == 0
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader to force a commit in its term.
    Barrier,
    /// A normal log entry carrying a command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A config change log entry.
    ConfigChange(EntryConfigChange),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Barrier => "barrier".to_string(),
            EntryPayload::Normal(_n) => "normal".to_string(),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {:?}", c.membership)
            }
        }
    }
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// The cluster's new membership configuration.
    pub membership: Configuration,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term, or its current term plus one for a pre-vote round.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
    /// Set when the candidate is deliberately disrupting a live leader, as part of a
    /// leadership transfer.
    pub disrupt_leader: bool,
    /// Whether this is a pre-vote round: the candidate has not incremented its term yet and a
    /// grant carries no durable state.
    pub pre_vote: bool,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
            disrupt_leader: false,
            pre_vote: false,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    ///
    /// A pre-vote response echoes the request's term instead, so a responder with a stale term
    /// cannot suppress the candidate.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
    /// Echo of the request's pre-vote flag.
    pub pre_vote: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to bring a lagging follower up to date with a snapshot (§7).
///
/// The snapshot data travels as one buffer; there is no chunking on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// Metadata of the snapshot: covered log position, membership, snapshot id.
    pub meta: SnapshotMeta,
    /// The snapshot state, whole.
    pub data: Bytes,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, len={}",
            self.term,
            self.leader_id,
            self.meta,
            self.data.len(),
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
    /// Set when the receiver could not take the snapshot, because it is busy compacting
    /// itself or because the request carried a stale term. The leader falls back to probe
    /// mode and retries later.
    pub rejected: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a transferring leader to its chosen successor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// The sending leader's current term.
    pub term: u64,
    /// The sending leader's ID.
    pub leader_id: u64,
}

/// The response to a `TimeoutNowRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    /// The receiving node's current term.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then applied to the Raft
/// state machine according to the Raft protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The application specific contents of this client request.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance with a normal entry type.
    pub fn new(entry: D) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal { data: entry }))
    }

    /// Create a new instance.
    pub(crate) fn new_base(entry: EntryPayload<D>) -> Self {
        Self { entry }
    }

    /// Generate a new payload holding a config change.
    pub(crate) fn new_config(membership: Configuration) -> Self {
        Self::new_base(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    /// Generate a new barrier payload.
    ///
    /// This is used by new leaders when first coming to power.
    pub(crate) fn new_barrier_payload() -> Self {
        Self::new_base(EntryPayload::Barrier)
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
