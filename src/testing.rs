//! Testing utilities for Raft cluster integration tests.
//!
//! Provides `TestCluster` for spinning up in-process clusters over the
//! in-memory transport, with partition control.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::raft_core::RaftStatus;
use crate::core::{RaftConfig, RaftCore, RaftHandle, RaftServer, Role};
use crate::persist::memory::MemoryPersister;
use crate::state_machine::kv::KeyValueStore;
use crate::state_machine::service::KvService;
use crate::transport::inmemory::{create_cluster_with_timeout, ClusterNet};

/// A single in-process node: consensus server, KV service, and the shared
/// persister that survives simulated restarts.
pub struct TestNode {
    pub id: u64,
    pub raft: RaftHandle,
    pub kv: KvService<KeyValueStore>,
    pub persister: MemoryPersister,
    serve_task: JoinHandle<()>,
}

impl TestNode {
    pub async fn status(&self) -> RaftStatus {
        self.raft.status().await
    }
}

/// An in-process cluster over the in-memory transport.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub net: ClusterNet,
}

impl TestCluster {
    /// Start `count` nodes with test-friendly timing.
    pub async fn new(count: usize) -> Self {
        Self::with_options(count, Self::test_config(), None).await
    }

    /// Start `count` nodes that snapshot once the persisted state exceeds
    /// `threshold` bytes.
    pub async fn with_snapshot_threshold(count: usize, threshold: u64) -> Self {
        Self::with_options(count, Self::test_config(), Some(threshold)).await
    }

    /// Timing tight enough for fast tests but far from flaky: heartbeats
    /// well under the election timeout floor.
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(40))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .with_apply_interval(Duration::from_millis(10))
    }

    pub async fn with_options(
        count: usize,
        config: RaftConfig,
        snapshot_threshold: Option<u64>,
    ) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();
        let (mut transports, mut handles, net) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(100)));

        let mut nodes = Vec::with_capacity(count);
        for &id in &node_ids {
            let peers: Vec<u64> = node_ids.iter().copied().filter(|&p| p != id).collect();
            let persister = MemoryPersister::new();
            let core = RaftCore::new(id, peers, Box::new(persister.clone()));

            let transport = transports.remove(&id).expect("transport for node");
            let (server, apply_rx) = RaftServer::new(core, transport, config.clone());
            let shared_core = server.shared_core();
            let raft = server.start();
            let kv = KvService::start(
                raft.clone(),
                KeyValueStore::new(),
                apply_rx,
                snapshot_threshold,
            );

            let serve_task =
                tokio::spawn(handles.remove(&id).expect("handle for node").serve(shared_core));

            nodes.push(TestNode {
                id,
                raft,
                kv,
                persister,
                serve_task,
            });
        }

        TestCluster { nodes, net }
    }

    /// Wait until exactly one reachable node reports leadership; returns
    /// its position in `nodes`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(index) = self.leader_index().await {
                return Some(index);
            }
            sleep(Duration::from_millis(25)).await;
        }
        None
    }

    /// Position of the current leader, if any node claims leadership.
    pub async fn leader_index(&self) -> Option<usize> {
        for (index, node) in self.nodes.iter().enumerate() {
            let (_, is_leader) = node.raft.get_state().await;
            if is_leader {
                return Some(index);
            }
        }
        None
    }

    /// All node positions currently claiming leadership at a given term.
    pub async fn leaders_at_term(&self, term: u64) -> Vec<usize> {
        let mut leaders = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let status = node.raft.status().await;
            if status.role == Role::Leader && status.term == term {
                leaders.push(index);
            }
        }
        leaders
    }

    /// Cut a node off from the rest of the cluster.
    pub fn isolate(&self, index: usize) {
        self.net.isolate(self.nodes[index].id);
    }

    /// Reconnect a previously isolated node.
    pub fn heal(&self, index: usize) {
        self.net.heal(self.nodes[index].id);
    }

    /// The key-value view a node's service has applied so far.
    pub fn kv_snapshot(&self, index: usize) -> HashMap<String, String> {
        self.nodes[index].kv.store().lock().unwrap().all()
    }

    /// Poll until `predicate` holds or the timeout elapses.
    pub async fn wait_until<F, Fut>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate().await {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    /// Stop every node and the serve loops.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.raft.kill().await;
            node.serve_task.abort();
        }
    }
}
