//! Replication stream.
//!
//! One task per follower, owned by the leader. The task tracks the follower's replication
//! progress and moves between three modes: probe (at most one AppendEntries per heartbeat
//! interval, while the follower's match index is unknown or contested), pipeline (entries are
//! streamed optimistically as they arrive), and snapshot (the follower is behind the start of
//! the leader's log and receives an InstallSnapshot).

use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The replication mode of a follower, as tracked in the leader's progress table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressMode {
    /// At most one AppendEntries per heartbeat interval.
    Probe,
    /// Optimistically stream AppendEntries.
    Pipeline,
    /// Sending a snapshot.
    Snapshot,
}

/// Per-follower replication metrics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    /// The most recent log id known to be replicated on the target.
    pub matched: LogId,
    /// The replication mode the target is in.
    pub mode: ProgressMode,
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self {
            matched: LogId::default(),
            mode: ProgressMode::Probe,
        }
    }
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            storage,
            replication_tx,
        )
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. We always buffer until we receive a success response, then send the
/// next payload from the buffer.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent<D>, Span)>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,

    /// The `RaftStorage` interface.
    storage: Arc<S>,

    /// The Raft's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// The index of the next log to send.
    ///
    /// This is initialized to leader's last log index + 1. Per the Raft protocol spec, this
    /// value may be decremented as new nodes enter the cluster and need to catch-up per the log
    /// consistency check. After a rejection, `next_index` is capped down to
    /// `min(rejected, follower last index + 1)` but never below `matched + 1`; eventually the
    /// leader and follower logs meet and replication proceeds from there.
    ///
    /// In pipeline mode the value is advanced optimistically by the entries in flight and rolled
    /// back the same way on rejection.
    next_index: u64,
    /// The last known log to be successfully replicated on the target.
    matched: LogId,
    /// Whether any response was received from the target recently.
    ///
    /// A snapshot is only dispatched to a follower with recent contact; a silent follower keeps
    /// receiving plain heartbeats instead.
    recent_recv: bool,

    /// A buffer of data to replicate to the target follower.
    ///
    /// The buffered payload here will be expanded as more replication commands come in from the
    /// Raft node. Data from this buffer will flow into the `outbound_buffer` in chunks.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// A buffer of data which is being sent to the follower.
    ///
    /// Data in this buffer comes directly from the `replication_buffer` in chunks, and will
    /// remain here until it is confirmed that the payload has been successfully received by the
    /// target node. This allows for retransmission of payloads in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry<D>>,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,

    /// The timeout duration for heartbeats.
    heartbeat_timeout: Duration,

    /// The timeout for a snapshot transfer, after which it is aborted and the follower is
    /// probed again.
    install_snapshot_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            target_state: TargetReplState::Probe,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: LogId::default(),
            recent_recv: false,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial probe so the follower learns about the new term immediately.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                TargetReplState::Probe => self.probe_loop().await,
                TargetReplState::Pipeline => self.pipeline_loop().await,
                TargetReplState::Snapshot => SnapshotState::new(&mut self).run().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Report the current mode to the leader's progress table.
    fn report_mode(&self, mode: ProgressMode) {
        let event = ReplicaEvent::ModeUpdate {
            target: self.target,
            mode,
        };
        let _ = self.raft_core_tx.send((event, tracing::debug_span!("CH")));
    }

    /// Send an AppendEntries RPC to the target, built from the outbound buffer.
    ///
    /// This request will timeout if no response is received within the configured heartbeat
    /// interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = if repl_len < self.max_payload_entries {
                    repl_len
                } else {
                    self.max_payload_entries
                };
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        // Resolve the log id preceding the first outbound entry.
        let prev_log_id = match self.prev_log_id().await {
            Some(prev) => prev,
            // The entry preceding next_index has been compacted away; the follower needs a
            // snapshot, but only a follower with recent contact gets one. Without contact,
            // keep heartbeating from the last known match.
            None => {
                if self.recent_recv {
                    self.target_state = TargetReplState::Snapshot;
                    return;
                }
                self.outbound_buffer.clear();
                self.matched
            }
        };

        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };
        let n_entries = payload.entries.len() as u64;

        // In pipeline mode, optimistically advance next_index by the entries in flight; a
        // rejection rolls it back below.
        if self.target_state == TargetReplState::Pipeline {
            self.next_index += n_entries;
        }

        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        let res = match timeout(
            self.heartbeat_timeout,
            self.network.send_append_entries(self.target, payload),
        )
        .await
        {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    self.rollback_optimistic_next_index(n_entries);
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                self.rollback_optimistic_next_index(n_entries);
                return;
            }
        };

        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        // Once we've successfully sent a payload of entries, don't send them again.
        self.outbound_buffer.clear();

        self.recent_recv = true;
        let _ = self.raft_core_tx.send((
            ReplicaEvent::RecentContact { target: self.target },
            tracing::debug_span!("CH"),
        ));

        // A newer term on the wire means this node is no longer the leader.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        if res.success() {
            // Success proves the prefix through prev_log_id matches (§5.3); entries beyond
            // what we sent are not verified even if the follower's log extends further.
            let matched = last_log_id.unwrap_or(prev_log_id);
            self.update_matched(matched);

            // A successful append moves a probing follower to pipeline mode.
            if self.target_state == TargetReplState::Probe {
                self.target_state = TargetReplState::Pipeline;
                return;
            }

            // If running at line rate but the follower has accumulated too much lag, fall back
            // to probe mode and serve it from storage.
            let is_lagging = self
                .last_log_index
                .checked_sub(self.matched.index)
                .map(|diff| diff > self.config.replication_lag_threshold)
                .unwrap_or(false);
            if is_lagging && self.target_state == TargetReplState::Pipeline {
                self.target_state = TargetReplState::Probe;
            }
            return;
        }

        // Rejected: cap next_index at min(rejected, follower last + 1), never below the match
        // index, and fall back to probe mode.
        tracing::debug!(
            rejected = res.rejected,
            last_log_index = res.last_log_index,
            "append entries rejected by target"
        );
        let next = std::cmp::min(res.rejected, res.last_log_index + 1);
        self.next_index = std::cmp::max(next, self.matched.index + 1);
        if self.target_state == TargetReplState::Pipeline {
            self.target_state = TargetReplState::Probe;
        }
    }

    /// Undo an optimistic next_index advance after a send failure.
    fn rollback_optimistic_next_index(&mut self, n_entries: u64) {
        if self.target_state == TargetReplState::Pipeline {
            self.next_index -= n_entries;
        }
    }

    /// Resolve the id of the entry preceding `next_index`, or the first outbound entry.
    ///
    /// Returns `None` when that entry has been compacted out of the log, which is the signal
    /// that the follower can only be served by a snapshot.
    async fn prev_log_id(&mut self) -> Option<LogId> {
        let first_outbound = self.outbound_buffer.first().map(|e| e.as_ref().log_id.index);
        let prev_index = match first_outbound {
            Some(index) => index - 1,
            None => self.next_index.saturating_sub(1),
        };
        if prev_index == 0 {
            return Some(LogId::default());
        }
        match self.storage.try_get_log_entry(prev_index).await {
            Ok(Some(entry)) => Some(entry.log_id),
            Ok(None) => {
                // A follower sitting exactly at the snapshot boundary does not need the
                // snapshot itself; the boundary id answers the log matching check.
                if let Ok(Some(snapshot)) = self.storage.get_current_snapshot().await {
                    if snapshot.meta.last_log_id.index == prev_index {
                        return Some(snapshot.meta.last_log_id);
                    }
                }
                None
            }
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entry for prev_log_id");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.target_state = TargetReplState::Shutdown;
                Some(self.matched)
            }
        }
    }

    /// Record a new match index and report it to the leader.
    fn update_matched(&mut self, matched: LogId) {
        if matched.index < self.matched.index {
            return;
        }
        self.matched = matched;
        if self.next_index < matched.index + 1 {
            self.next_index = matched.index + 1;
        }
        let _ = self.raft_core_tx.send((
            ReplicaEvent::UpdateMatchIndex {
                target: self.target,
                matched,
            },
            tracing::debug_span!("CH"),
        ));
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            let _ent = span.enter();

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }

                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == TargetReplState::Pipeline {
                        self.replication_buffer.push(entry);
                    }
                }

                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry<D: AppData> {
    /// An entry owned by an Arc, hot off the replication stream from the Raft leader.
    Arc(Arc<Entry<D>>),
    /// An entry which was fetched directly from storage.
    Raw(Entry<D>),
}

impl<D: AppData> AsRef<Entry<D>> for OutboundEntry<D> {
    fn as_ref(&self) -> &Entry<D> {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The follower's match index is unknown or contested; send at most one AppendEntries per
    /// heartbeat interval.
    Probe,
    /// The follower is in sync; stream entries as they arrive.
    Pipeline,
    /// The follower is behind the start of the log and is being sent a snapshot.
    Snapshot,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log, so
        /// its index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent {
    /// The replication mode of a target changed.
    ModeUpdate {
        /// The ID of the Raft node to which this event relates.
        target: NodeId,
        /// The mode the target's stream is now in.
        mode: ProgressMode,
    },
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The log of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// The target responded to an RPC; used for leader contact accounting.
    RecentContact {
        /// The ID of the responding target node.
        target: NodeId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::ModeUpdate { ref target, mode } => {
                format!("ModeUpdate: target: {}, mode: {:?}", target, mode)
            }
            ReplicaEvent::UpdateMatchIndex {
                ref target,
                ref matched,
            } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RecentContact { ref target } => {
                format!("RecentContact: target: {}", target)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// The probe loop: one AppendEntries per heartbeat tick, served from storage.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "probe"))]
    pub async fn probe_loop(&mut self) {
        self.report_mode(ProgressMode::Probe);
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Probe {
                return;
            }

            self.prep_outbound_buffer_from_storage().await;
            if self.target_state != TargetReplState::Probe {
                return;
            }
            self.send_append_entries().await;
            if self.target_state != TargetReplState::Probe {
                return;
            }

            // At most one message per heartbeat interval; keep the event channel drained in
            // the meantime.
            let span = tracing::debug_span!("CHrx:Probe");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => continue,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// The pipeline loop: stream entries as they arrive, heartbeat when idle.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "pipeline"))]
    pub async fn pipeline_loop(&mut self) {
        self.report_mode(ProgressMode::Pipeline);
        loop {
            if self.target_state != TargetReplState::Pipeline {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // When converting to probe mode the buffers are cleared, in which there may be
            // uncommitted logs. Thus when converting back to pipeline with empty buffers, all
            // entries after next_index must be resent, else they would only be replicated once
            // a new log is written.
            let index = match next_buf_index {
                Some(i) => i,
                None => self.last_log_index + 1,
            };

            // Ensure that our buffered data matches up with `next_index`. When transitioning to
            // pipeline mode, it is always possible that new data has been sent for replication
            // but has skipped this replication stream during transition. In such cases, a single
            // update from storage will put this stream back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != TargetReplState::Pipeline {
                    return;
                }

                self.send_append_entries().await;
                continue;
            }

            // Emit when there is data to send, or on the heartbeat interval.
            if !self.outbound_buffer.is_empty() || !self.replication_buffer.is_empty() {
                self.send_append_entries().await;
                continue;
            }

            let span = tracing::debug_span!("CHrx:Pipeline");
            let _en = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from probe mode.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        if start >= stop {
            return;
        }
        let entries = match self.storage.get_log_entries(start..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                return;
            }
        };

        // A gap in storage means the range was compacted; only a snapshot can help.
        if entries.first().map(|e| e.log_id.index) != Some(start) {
            self.target_state = TargetReplState::Snapshot;
            return;
        }

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    /// Prep the outbound buffer with the next payload of entries to append, from storage.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        if !self.outbound_buffer.is_empty() {
            return;
        }
        if self.next_index > self.last_log_index {
            // Up to date; the probe is a plain heartbeat.
            return;
        }

        let stop_index = std::cmp::min(
            self.next_index + self.max_payload_entries as u64,
            self.last_log_index + 1,
        );
        let entries = match self.storage.get_log_entries(self.next_index..stop_index).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error fetching logs from storage");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        if entries.first().map(|e| e.log_id.index) != Some(self.next_index) {
            // The range was compacted away; the follower needs a snapshot, provided it is
            // responsive at all.
            if self.recent_recv {
                self.target_state = TargetReplState::Snapshot;
            }
            return;
        }

        self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Snapshot mode specific state.
struct SnapshotState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// An exclusive handle to the replication core.
    replication_core: &'a mut ReplicationCore<D, R, N, S>,
    snapshot: Option<Snapshot>,
    snapshot_fetch_rx: Option<oneshot::Receiver<Snapshot>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> SnapshotState<'a, D, R, N, S> {
    /// Create a new instance.
    pub fn new(replication_core: &'a mut ReplicationCore<D, R, N, S>) -> Self {
        Self {
            replication_core,
            snapshot: None,
            snapshot_fetch_rx: None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshot"))]
    pub async fn run(mut self) {
        self.replication_core.report_mode(ProgressMode::Snapshot);
        self.replication_core.replication_buffer.clear();
        self.replication_core.outbound_buffer.clear();

        loop {
            if self.replication_core.target_state != TargetReplState::Snapshot {
                return;
            }

            // If we don't have any of the components we need, fetch the current snapshot.
            if self.snapshot.is_none() && self.snapshot_fetch_rx.is_none() {
                let (tx, rx) = oneshot::channel();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::NeedsSnapshot {
                        target: self.replication_core.target,
                        tx,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.snapshot_fetch_rx = Some(rx);
            }

            // If we are waiting for a snapshot response from the storage layer, then wait for
            // it and send heartbeats in the meantime.
            if let Some(snapshot_fetch_rx) = self.snapshot_fetch_rx.take() {
                self.wait_for_snapshot(snapshot_fetch_rx).await;
                continue;
            }

            // If we have a snapshot to work with, then send it.
            if let Some(snapshot) = self.snapshot.take() {
                self.send_snapshot(snapshot).await;
                return;
            }
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// If an error comes up during processing, this routine should simply be called again after
    /// issuing a new request to the storage layer.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot>) {
        loop {
            let span = tracing::debug_span!("CHrx:Snapshot:wait");
            let _ent = span.enter();

            tokio::select! {
                _ = self.replication_core.heartbeat.tick() => self.replication_core.send_append_entries().await,

                event_span = self.replication_core.repl_rx.recv() =>  {
                    match event_span {
                        Some((event, span)) => self.replication_core.drain_raft_rx(event, span),
                        None => {
                            self.replication_core.target_state = TargetReplState::Shutdown;
                            return;
                        }
                    }
                },

                res = &mut rx => {
                    match res {
                        Ok(snapshot) => {
                            self.snapshot = Some(snapshot);
                            return;
                        }
                        Err(_) => return, // Channels may close for various acceptable reasons.
                    }
                },
            }
        }
    }

    /// Transfer the snapshot in a single InstallSnapshot RPC.
    ///
    /// A transfer which errors or outlives the install snapshot timeout is aborted, and the
    /// follower goes back to probe mode; the leader will retry from there.
    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot=%snapshot.meta.last_log_id))]
    async fn send_snapshot(&mut self, snapshot: Snapshot) {
        let snapshot_index = snapshot.meta.last_log_id.index;
        let req = InstallSnapshotRequest {
            term: self.replication_core.term,
            leader_id: self.replication_core.id,
            meta: snapshot.meta.clone(),
            data: snapshot.data.clone(),
        };

        tracing::debug!(snapshot_size = req.data.len(), "sending snapshot");

        let res = timeout(
            self.replication_core.install_snapshot_timeout,
            self.replication_core.network.send_install_snapshot(self.replication_core.target, req),
        )
        .await;

        let res = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                self.replication_core.target_state = TargetReplState::Probe;
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                self.replication_core.target_state = TargetReplState::Probe;
                return;
            }
        };

        self.replication_core.recent_recv = true;
        let _ = self.replication_core.raft_core_tx.send((
            ReplicaEvent::RecentContact {
                target: self.replication_core.target,
            },
            tracing::debug_span!("CH"),
        ));

        if res.term > self.replication_core.term {
            let _ = self.replication_core.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.replication_core.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.replication_core.target_state = TargetReplState::Shutdown;
            return;
        }

        // The follower is busy with a snapshot of its own; back to probing, retry later.
        if res.rejected {
            self.replication_core.target_state = TargetReplState::Probe;
            return;
        }

        // Done: the follower holds everything through the snapshot. Resume probing from
        // max(match + 1, snapshot index); the follower's next ack will settle the rest.
        self.replication_core.update_matched(snapshot.meta.last_log_id);
        self.replication_core.next_index =
            std::cmp::max(self.replication_core.matched.index + 1, snapshot_index);
        self.replication_core.target_state = TargetReplState::Probe;
    }
}
