//! Transport abstraction for Raft RPC communication.
//!
//! Implementations serialize the arguments, perform the remote call, and
//! surface failures as errors; retry policy belongs to the callers (the
//! next heartbeat tick or election round).

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// Outbound RPC surface of a node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node.
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    /// Send an AppendEntries RPC to a peer node.
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node.
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError>;
}

/// Errors surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("target node not found")]
    NodeNotFound,
    /// The simulated network dropped the message (partition testing).
    #[error("network partitioned")]
    Disconnected,
}
