//! In-memory transport for testing.
//!
//! Routes RPCs over per-node mpsc channels. A shared [`ClusterNet`]
//! controller can isolate nodes: messages to or from an isolated node are
//! dropped at send time, which is how the partition scenarios are driven.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftCore,
    RequestVoteArgs, RequestVoteReply,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Requests routed to a node's inbound queue.
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteReply>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesReply>,
    },
    InstallSnapshot {
        args: InstallSnapshotArgs,
        reply: oneshot::Sender<InstallSnapshotReply>,
    },
}

type Isolated = Arc<StdMutex<HashSet<u64>>>;

/// Partition controller shared by every transport in a cluster.
#[derive(Clone, Default)]
pub struct ClusterNet {
    isolated: Isolated,
}

impl ClusterNet {
    /// Cut a node off: traffic to and from it is dropped.
    pub fn isolate(&self, id: u64) {
        self.isolated.lock().unwrap().insert(id);
    }

    /// Reconnect a previously isolated node.
    pub fn heal(&self, id: u64) {
        self.isolated.lock().unwrap().remove(&id);
    }

    pub fn heal_all(&self) {
        self.isolated.lock().unwrap().clear();
    }

    fn cut(&self, a: u64, b: u64) -> bool {
        let isolated = self.isolated.lock().unwrap();
        isolated.contains(&a) || isolated.contains(&b)
    }
}

/// Channel-backed transport for one node.
pub struct InMemoryTransport {
    me: u64,
    senders: HashMap<u64, mpsc::Sender<Request>>,
    net: ClusterNet,
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    async fn roundtrip<R>(
        &self,
        target: u64,
        request: Request,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, TransportError> {
        if self.net.cut(self.me, target) {
            return Err(TransportError::Disconnected);
        }
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        sender
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(
            target,
            Request::RequestVote {
                args,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(
            target,
            Request::AppendEntries {
                args,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(
            target,
            Request::InstallSnapshot {
                args,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }
}

/// Receiver side: drains a node's inbound queue into its core.
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process a single request against an exclusively-held core.
    pub async fn process_one(&mut self, core: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::dispatch(request, core);
                true
            }
            None => false,
        }
    }

    /// Process a single request against a shared core.
    pub async fn process_one_shared(&mut self, core: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut core = core.lock().await;
                Self::dispatch(request, &mut core);
                true
            }
            None => false,
        }
    }

    /// Serve requests until the channel closes. The lock is held only for
    /// the handler itself; replies go out through the oneshot afterwards.
    pub async fn serve(mut self, core: SharedCore) {
        while let Some(request) = self.receiver.recv().await {
            let mut core = core.lock().await;
            Self::dispatch(request, &mut core);
        }
    }

    fn dispatch(request: Request, core: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => {
                let _ = reply.send(core.handle_request_vote(&args));
            }
            Request::AppendEntries { args, reply } => {
                let _ = reply.send(core.handle_append_entries(&args));
            }
            Request::InstallSnapshot { args, reply } => {
                let _ = reply.send(core.handle_install_snapshot(&args));
            }
        }
    }
}

/// Create transports and inbound handles for a cluster of nodes (no RPC
/// timeout).
pub fn create_cluster(
    node_ids: &[u64],
) -> (
    HashMap<u64, InMemoryTransport>,
    HashMap<u64, NodeHandle>,
    ClusterNet,
) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and inbound handles with an optional RPC timeout.
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (
    HashMap<u64, InMemoryTransport>,
    HashMap<u64, NodeHandle>,
    ClusterNet,
) {
    let net = ClusterNet::default();
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let peer_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&peer, _)| peer != id)
            .map(|(&peer, tx)| (peer, tx.clone()))
            .collect();
        transports.insert(
            id,
            InMemoryTransport {
                me: id,
                senders: peer_senders,
                net: net.clone(),
                timeout,
            },
        );
    }

    (transports, handles, net)
}
