//! RaftNode: the sender side of the consensus RPCs.
//!
//! Outbound calls follow the lock discipline of the core: build arguments
//! under the lock, release it across the network call, then re-acquire it
//! and re-check term and role before applying the reply.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::raft_core::{
    AppendEntriesArgs, InstallSnapshotArgs, RaftCore, RequestVoteArgs, Role,
};
use crate::transport::{Transport, TransportError};

/// Shared reference to the state core.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Per-peer payload chosen by the replicator on each heartbeat tick.
enum Payload {
    Entries(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

/// High-level Raft node driving outbound consensus RPCs.
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Shared handle to the core (for inbound RPC handling and the upper
    /// layer).
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Run one full candidacy: transition to candidate, fan RequestVote
    /// out to every peer, and count replies as they arrive. Returns true
    /// if this node won and was promoted.
    pub async fn run_election(&self) -> bool {
        let (args, peers, term_at_start) = {
            let mut core = self.core.lock().await;
            if core.killed() || core.role == Role::Leader {
                return false;
            }
            core.start_election();
            if core.peers.is_empty() {
                // Single-node cluster: the self-vote is already a majority.
                core.become_leader();
                return true;
            }
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.me,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone(), core.current_term)
        };

        let mut replies: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer, transport.request_vote(peer, args).await) }
            })
            .collect();

        while let Some((peer, result)) = replies.next().await {
            match result {
                Ok(reply) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_reply(peer, term_at_start, &reply) {
                        // Won; remaining replies are irrelevant.
                        return true;
                    }
                    if core.role != Role::Candidate || core.current_term != term_at_start {
                        return false;
                    }
                }
                Err(err) => {
                    // A silent peer is a non-vote for this round.
                    debug!(peer, error = %err, "request vote failed");
                }
            }
        }
        false
    }

    /// One replication round: for every peer send either the missing log
    /// suffix (possibly empty, a pure heartbeat) or the current snapshot
    /// when the peer has fallen behind the compaction boundary.
    pub async fn do_heartbeat(&self) {
        let requests = {
            let mut core = self.core.lock().await;
            if core.killed() || core.role != Role::Leader {
                return;
            }
            core.last_reset_heartbeat = Instant::now();
            // Entries appended since the last round may already sit on a
            // majority (trivially so without peers).
            core.leader_update_commit_index();

            let mut requests = Vec::with_capacity(core.peers.len());
            let peers = core.peers.clone();
            for peer in peers {
                let next = core.next_index.get(&peer).copied().unwrap_or(1);

                if next <= core.snapshot_last_index() {
                    // The entries this peer needs are gone; ship the
                    // snapshot instead.
                    let args = InstallSnapshotArgs {
                        term: core.current_term,
                        leader_id: core.me,
                        last_included_index: core.snapshot_last_index(),
                        last_included_term: core.snapshot_last_term(),
                        data: core.snapshot_blob(),
                    };
                    requests.push((peer, Payload::Snapshot(args)));
                    continue;
                }

                let prev_log_index = next - 1;
                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.me,
                    prev_log_index,
                    prev_log_term: core.term_at(prev_log_index),
                    entries: core.entries_from(next),
                    leader_commit: core.commit_index,
                };
                requests.push((peer, Payload::Entries(args)));
            }
            requests
        };

        enum Outcome {
            Entries {
                sent_term: u64,
                prev_log_index: u64,
                sent_entries: u64,
                result: Result<super::raft_core::AppendEntriesReply, TransportError>,
            },
            Snapshot {
                sent_term: u64,
                last_included_index: u64,
                result: Result<super::raft_core::InstallSnapshotReply, TransportError>,
            },
        }

        let mut replies: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer, payload)| {
                let transport = &self.transport;
                async move {
                    match payload {
                        Payload::Entries(args) => {
                            let sent_term = args.term;
                            let prev_log_index = args.prev_log_index;
                            let sent_entries = args.entries.len() as u64;
                            let result = transport.append_entries(peer, args).await;
                            (
                                peer,
                                Outcome::Entries {
                                    sent_term,
                                    prev_log_index,
                                    sent_entries,
                                    result,
                                },
                            )
                        }
                        Payload::Snapshot(args) => {
                            let sent_term = args.term;
                            let last_included_index = args.last_included_index;
                            let result = transport.install_snapshot(peer, args).await;
                            (
                                peer,
                                Outcome::Snapshot {
                                    sent_term,
                                    last_included_index,
                                    result,
                                },
                            )
                        }
                    }
                }
            })
            .collect();

        while let Some((peer, outcome)) = replies.next().await {
            match outcome {
                Outcome::Entries {
                    sent_term,
                    prev_log_index,
                    sent_entries,
                    result,
                } => match result {
                    Ok(reply) => {
                        let mut core = self.core.lock().await;
                        core.handle_append_entries_reply(
                            peer,
                            sent_term,
                            prev_log_index,
                            sent_entries,
                            &reply,
                        );
                    }
                    Err(err) => {
                        // Retried on the next tick.
                        debug!(peer, error = %err, "append entries failed");
                    }
                },
                Outcome::Snapshot {
                    sent_term,
                    last_included_index,
                    result,
                } => match result {
                    Ok(reply) => {
                        let mut core = self.core.lock().await;
                        core.handle_install_snapshot_reply(
                            peer,
                            sent_term,
                            last_included_index,
                            &reply,
                        );
                    }
                    Err(err) => {
                        debug!(peer, error = %err, "install snapshot failed");
                    }
                },
            }
        }
    }

    pub async fn role(&self) -> Role {
        self.core.lock().await.role
    }

    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}
