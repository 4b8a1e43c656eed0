//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::TimeoutNowRequest;
use crate::raft::TimeoutNowResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for sending RPCs to peer nodes.
///
/// An unreachable peer is an ordinary error here, never fatal: the calling loops log the
/// failure and retry on their own schedule.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a TimeoutNow RPC to the target Raft node, asking it to start an election at once.
    ///
    /// Used by leaders to complete a leadership transfer (§3.10 of the Raft dissertation).
    async fn send_timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> Result<TimeoutNowResponse>;
}
