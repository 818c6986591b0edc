//! KvService: glue between a running Raft node and a state machine.
//!
//! Owns the consumer end of the apply channel. Committed commands are
//! applied to the store in delivery order; proposers park on a per-index
//! waiter that completes when their entry applies. Snapshot deliveries are
//! offered back to the core via `cond_install_snapshot` and the store is
//! restored only on acceptance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::kv::{KeyValueStore, Op};
use super::traits::{ApplyResult, Snapshotable};
use crate::core::{ApplyMsg, RaftHandle};

/// Errors surfaced to proposers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("not the leader")]
    NotLeader,
    /// The entry did not commit before the deadline (lost majority,
    /// partition, ...). The operation may still commit later.
    #[error("request timed out before commit")]
    Timeout,
    /// A different leader's entry took this log slot.
    #[error("leadership changed before commit")]
    LostLeadership,
    /// The state machine rejected the command.
    #[error("command failed: {0}")]
    Command(String),
}

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(3);

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<(u64, ApplyResult)>>>>;

/// Apply-channel consumer plus the proposer-facing API.
pub struct KvService<S> {
    raft: RaftHandle,
    store: Arc<Mutex<S>>,
    waiters: Waiters,
}

impl<S> Clone for KvService<S> {
    fn clone(&self) -> Self {
        Self {
            raft: self.raft.clone(),
            store: self.store.clone(),
            waiters: self.waiters.clone(),
        }
    }
}

impl<S: Snapshotable + 'static> KvService<S> {
    /// Wire a store to a running node and spawn the consumer loop.
    ///
    /// When `snapshot_threshold` is set, the service asks the core to
    /// compact the log whenever the persisted state outgrows it.
    pub fn start(
        raft: RaftHandle,
        store: S,
        apply_rx: mpsc::Receiver<ApplyMsg>,
        snapshot_threshold: Option<u64>,
    ) -> Self {
        let service = Self {
            raft,
            store: Arc::new(Mutex::new(store)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        };
        tokio::spawn(service.clone().consume(apply_rx, snapshot_threshold));
        service
    }

    /// Shared access to the store, for local reads.
    pub fn store(&self) -> Arc<Mutex<S>> {
        self.store.clone()
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    async fn consume(
        self,
        mut apply_rx: mpsc::Receiver<ApplyMsg>,
        snapshot_threshold: Option<u64>,
    ) {
        // Watermark of the highest index reflected in the store; commands
        // at or below it were covered by an installed snapshot.
        let mut applied: u64 = 0;

        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { data, index, term } => {
                    if index <= applied {
                        continue;
                    }
                    applied = index;

                    let result = self.store.lock().unwrap().apply(&data);
                    if let Err(err) = &result {
                        debug!(index, error = %err, "state machine rejected command");
                    }
                    if let Some(waiter) = self.waiters.lock().unwrap().remove(&index) {
                        let _ = waiter.send((term, result));
                    }

                    if let Some(limit) = snapshot_threshold {
                        if self.raft.state_size().await > limit {
                            let blob = self.store.lock().unwrap().snapshot();
                            match blob {
                                Ok(blob) => self.raft.snapshot(index, &blob).await,
                                Err(err) => warn!(error = %err, "snapshot serialization failed"),
                            }
                        }
                    }
                }
                ApplyMsg::Snapshot { data, index, term } => {
                    if self.raft.cond_install_snapshot(term, index, &data).await {
                        self.store
                            .lock()
                            .unwrap()
                            .restore(&data)
                            .expect("restore state machine from installed snapshot");
                        applied = index;
                    }
                }
            }
        }
    }

    /// Propose an operation and wait for it to commit and apply.
    pub async fn propose(&self, op: &Op) -> Result<String, KvError> {
        let (index, term) = self
            .raft
            .start(op.encode())
            .await
            .ok_or(KvError::NotLeader)?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(index, tx);

        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Ok(Ok((applied_term, result))) => {
                if applied_term == term {
                    result.map_err(KvError::Command)
                } else {
                    Err(KvError::LostLeadership)
                }
            }
            Ok(Err(_)) => Err(KvError::LostLeadership),
            Err(_) => {
                self.waiters.lock().unwrap().remove(&index);
                Err(KvError::Timeout)
            }
        }
    }
}

impl KvService<KeyValueStore> {
    pub async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.propose(&Op::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.propose(&Op::Delete {
            key: key.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Local read; linearizable only against this node's applied state.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key)
    }
}
