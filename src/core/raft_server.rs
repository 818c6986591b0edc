//! RaftServer: the three timer loops that drive a node.
//!
//! - election ticker: watches the election deadline and runs candidacies
//! - heartbeat ticker: leader-only replication rounds
//! - apply ticker: pumps committed entries onto the apply channel
//!
//! Timers are expressed as absolute deadlines recomputed from the core on
//! every iteration, so a reset observed under the lock simply moves the
//! next wake-up instead of requiring cancellation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use super::apply::ApplyMsg;
use super::config::RaftConfig;
use super::raft_core::{RaftCore, RaftStatus, Role};
use super::raft_node::{RaftNode, SharedCore};
use crate::transport::Transport;

/// A running Raft node: construct with [`RaftServer::new`], then call
/// [`RaftServer::start`] to spawn the timer loops and obtain a handle.
pub struct RaftServer<T: Transport> {
    node: Arc<RaftNode<T>>,
    config: RaftConfig,
    apply_tx: mpsc::Sender<ApplyMsg>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server around a core and a transport. Returns the server
    /// and the consumer end of the apply channel, which the upper layer
    /// owns.
    pub fn new(
        core: RaftCore,
        transport: T,
        config: RaftConfig,
    ) -> (Self, mpsc::Receiver<ApplyMsg>) {
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);
        let server = Self {
            node: Arc::new(RaftNode::new(core, transport)),
            config,
            apply_tx,
        };
        (server, apply_rx)
    }

    /// Shared handle to the core, for wiring inbound RPC handlers.
    pub fn shared_core(&self) -> SharedCore {
        self.node.shared_core()
    }

    /// Spawn the election, heartbeat, and apply loops.
    pub fn start(self) -> RaftHandle {
        let core = self.node.shared_core();

        tokio::spawn(election_loop(self.node.clone(), self.config.clone()));
        tokio::spawn(heartbeat_loop(self.node.clone(), self.config.clone()));
        tokio::spawn(apply_loop(
            self.node.shared_core(),
            self.apply_tx.clone(),
            self.config.clone(),
        ));

        RaftHandle { core }
    }
}

/// Sleeps until the election deadline, then starts a candidacy unless the
/// timer was reset in the meantime or this node leads already. The
/// timeout is re-rolled for every wait.
async fn election_loop<T: Transport>(node: Arc<RaftNode<T>>, config: RaftConfig) {
    let core = node.shared_core();
    loop {
        let timeout = config.random_election_timeout();
        let deadline = {
            let core = core.lock().await;
            if core.killed() {
                return;
            }
            core.last_reset_election + timeout
        };
        sleep_until(deadline).await;

        let expired = {
            let core = core.lock().await;
            if core.killed() {
                return;
            }
            core.role != Role::Leader && Instant::now() >= core.last_reset_election + timeout
        };
        if expired && node.run_election().await {
            // Assert leadership before any follower times out again.
            node.do_heartbeat().await;
        }
    }
}

/// Leader-only replication rounds, one per heartbeat interval.
async fn heartbeat_loop<T: Transport>(node: Arc<RaftNode<T>>, config: RaftConfig) {
    let core = node.shared_core();
    loop {
        let deadline = {
            let core = core.lock().await;
            if core.killed() {
                return;
            }
            core.last_reset_heartbeat + config.heartbeat_interval
        };
        sleep_until(deadline).await;

        let is_leader = {
            let mut core = core.lock().await;
            if core.killed() {
                return;
            }
            core.last_reset_heartbeat = Instant::now();
            core.role == Role::Leader
        };
        if is_leader {
            node.do_heartbeat().await;
        }
    }
}

/// Pumps deliverable messages onto the apply channel. Collection happens
/// under the lock, sending outside it: a full channel blocks this loop
/// (backpressure on the upper layer) without stalling replication.
async fn apply_loop(core: SharedCore, apply_tx: mpsc::Sender<ApplyMsg>, config: RaftConfig) {
    loop {
        sleep(config.apply_interval).await;

        let msgs = {
            let mut core = core.lock().await;
            if core.killed() {
                return;
            }
            core.take_apply_messages()
        };
        for msg in msgs {
            debug!(index = msg.index(), "delivering apply message");
            if apply_tx.send(msg).await.is_err() {
                // Upper layer dropped its receiver; nothing left to feed.
                return;
            }
        }
    }
}

/// Cloneable handle to a running node, used by the upper layer and by the
/// inbound RPC glue.
#[derive(Clone)]
pub struct RaftHandle {
    core: SharedCore,
}

impl RaftHandle {
    pub fn from_shared(core: SharedCore) -> Self {
        Self { core }
    }

    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Submit a command. Returns the assigned `(index, term)` without
    /// waiting for commit, or `None` when this node is not the leader.
    pub async fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        self.core.lock().await.start(command)
    }

    /// `(currentTerm, isLeader)` snapshot.
    pub async fn get_state(&self) -> (u64, bool) {
        self.core.lock().await.get_state()
    }

    pub async fn status(&self) -> RaftStatus {
        self.core.lock().await.status()
    }

    /// Upper-layer snapshot request; see [`RaftCore::snapshot`].
    pub async fn snapshot(&self, index: u64, data: &[u8]) {
        self.core.lock().await.snapshot(index, data)
    }

    /// Offer a leader-shipped snapshot back to the core; see
    /// [`RaftCore::cond_install_snapshot`].
    pub async fn cond_install_snapshot(&self, last_term: u64, last_index: u64, data: &[u8]) -> bool {
        self.core
            .lock()
            .await
            .cond_install_snapshot(last_term, last_index, data)
    }

    /// Size of the persisted state blob in bytes.
    pub async fn state_size(&self) -> u64 {
        self.core.lock().await.state_size()
    }

    /// Stop the node: timer loops exit and handlers answer as killed.
    pub async fn kill(&self) {
        self.core.lock().await.kill();
    }
}
