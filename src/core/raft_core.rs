//! Raft state core: the single owner of all consensus state.
//!
//! `RaftCore` is synchronous and transport-agnostic. Inbound RPC handlers,
//! the election driver, and the replicator all mutate it under one
//! `tokio::sync::Mutex`; everything persisted is written through the
//! `Persister` before the mutating call returns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::apply::ApplyMsg;
use crate::persist::Persister;

/// Raft node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive state, receives updates from the leader
    Follower,
    /// Actively seeking votes to become leader
    Candidate,
    /// Handles client commands and replicates the log
    Leader,
}

/// A single log entry. Commands are opaque bytes; the consensus layer
/// never inspects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader
    pub term: u64,
    /// Global log index (dense, strictly increasing)
    pub index: u64,
    /// Command for the upper-layer state machine
    pub command: Vec<u8>,
}

/// Advisory outcome attached to RequestVote replies. Callers must not
/// base correctness on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    Normal,
    /// Already voted for another candidate this term
    Voted,
    /// The request (or the candidate's log) was out of date
    Expire,
    /// The receiving node has been killed
    Killed,
}

/// Advisory outcome attached to AppendEntries replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendState {
    AppNormal,
    /// The receiving node has been killed
    Disconnected,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub vote_state: VoteState,
}

/// AppendEntries RPC arguments (empty `entries` is a heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// AppendEntries RPC reply.
///
/// On rejection the conflict fields carry the fast-backoff hint:
/// `conflict_term` is the term of the conflicting entry when one exists,
/// `conflict_index` the first index the leader should retry from. A reply
/// with `conflict_index == 0` carries no hint and leaves the leader's
/// bookkeeping untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: Option<u64>,
    pub conflict_index: u64,
    pub app_state: AppendState,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Observable summary of a node's consensus state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub role: Role,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
}

/// The durable record. `log` holds only the entries above the snapshot
/// boundary; the sentinel is rebuilt from the two boundary fields on load.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    current_term: u64,
    voted_for: Option<u64>,
    last_snapshot_include_index: u64,
    last_snapshot_include_term: u64,
    log: Vec<LogEntry>,
}

/// Core Raft state machine (sync, transport-agnostic).
///
/// The in-memory log always keeps a sentinel at position 0 carrying the
/// term and index of the last snapshotted entry, so global index `g` lives
/// at local slot `g - snapshot_last_index()` and the log is never empty.
pub struct RaftCore {
    persister: Box<dyn Persister>,

    /// Unique identifier of this node
    pub me: u64,
    /// IDs of the other nodes in the cluster
    pub peers: Vec<u64>,

    // Persistent state (written through the persister before any RPC reply)
    /// Latest term this node has seen; monotonically non-decreasing
    pub current_term: u64,
    /// Candidate granted this node's vote in the current term
    pub voted_for: Option<u64>,
    log: Vec<LogEntry>,

    // Volatile state
    /// Highest log index known committed
    pub commit_index: u64,
    /// Highest log index handed to the apply channel
    pub last_applied: u64,
    pub role: Role,
    /// Last leader observed via a valid AppendEntries / InstallSnapshot
    pub leader_id: Option<u64>,

    // Leader-only, reinitialized on election
    /// Next log index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Highest log index known replicated on each peer
    pub match_index: HashMap<u64, u64>,

    /// Peers that granted a vote in the current candidacy
    votes_received: Vec<u64>,

    /// Deadline anchors for the election and heartbeat tickers
    pub last_reset_election: Instant,
    pub last_reset_heartbeat: Instant,

    /// Snapshot received over RPC, awaiting FIFO delivery upstream
    pending_snapshot: Option<ApplyMsg>,

    dead: bool,
}

impl RaftCore {
    /// Create a core for node `me`, rehydrating from the persister when a
    /// prior state blob exists.
    pub fn new(me: u64, peers: Vec<u64>, persister: Box<dyn Persister>) -> Self {
        let saved = persister
            .read_state()
            .expect("read persisted raft state");

        let mut core = RaftCore {
            persister,
            me,
            peers,
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry {
                term: 0,
                index: 0,
                command: Vec::new(),
            }],
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: Vec::new(),
            last_reset_election: Instant::now(),
            last_reset_heartbeat: Instant::now(),
            pending_snapshot: None,
            dead: false,
        };

        if let Some(bytes) = saved {
            core.read_persist(&bytes);
        }
        core.commit_index = core.snapshot_last_index();
        core.last_applied = core.snapshot_last_index();
        core
    }

    /// Mark the node as dead. Tickers exit and RPC handlers answer with
    /// the advisory Killed / Disconnected states.
    pub fn kill(&mut self) {
        self.dead = true;
    }

    pub fn killed(&self) -> bool {
        self.dead
    }

    // === Persistence ===

    fn encode_state(&self) -> Vec<u8> {
        let record = PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            last_snapshot_include_index: self.log[0].index,
            last_snapshot_include_term: self.log[0].term,
            log: self.log[1..].to_vec(),
        };
        bincode::serialize(&record).expect("encode raft state")
    }

    /// Write the durable fields through the persister. Failure here is
    /// unrecoverable: replying to an RPC without durability would let
    /// another node elect on state we might forget.
    fn persist(&mut self) {
        let bytes = self.encode_state();
        self.persister
            .save_state(&bytes)
            .expect("persist raft state");
    }

    fn persist_with_snapshot(&mut self, snapshot: &[u8]) {
        let bytes = self.encode_state();
        self.persister
            .save_state_and_snapshot(&bytes, snapshot)
            .expect("persist raft state and snapshot");
    }

    fn read_persist(&mut self, bytes: &[u8]) {
        let record: PersistedState =
            bincode::deserialize(bytes).expect("decode persisted raft state");
        self.current_term = record.current_term;
        self.voted_for = record.voted_for;
        self.log = Vec::with_capacity(record.log.len() + 1);
        self.log.push(LogEntry {
            term: record.last_snapshot_include_term,
            index: record.last_snapshot_include_index,
            command: Vec::new(),
        });
        self.log.extend(record.log);
    }

    /// Size in bytes of the persisted state blob, used by the upper layer
    /// to decide when to snapshot.
    pub fn state_size(&self) -> u64 {
        self.persister.state_size()
    }

    /// Current snapshot blob, empty if none was ever taken.
    pub fn snapshot_blob(&self) -> Vec<u8> {
        self.persister
            .read_snapshot()
            .expect("read snapshot blob")
            .unwrap_or_default()
    }

    // === Log accessors ===

    /// Index of the last entry covered by the snapshot (sentinel index).
    pub fn snapshot_last_index(&self) -> u64 {
        self.log[0].index
    }

    /// Term of the last entry covered by the snapshot (sentinel term).
    pub fn snapshot_last_term(&self) -> u64 {
        self.log[0].term
    }

    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .expect("log always holds the snapshot sentinel")
            .index
    }

    pub fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .expect("log always holds the snapshot sentinel")
            .term
    }

    /// Term of the entry at a global index. The index must lie within
    /// `[snapshot_last_index, last_log_index]`; anything else is a caller
    /// bug (the caller should have shipped a snapshot instead).
    pub fn term_at(&self, index: u64) -> u64 {
        assert!(
            index >= self.snapshot_last_index() && index <= self.last_log_index(),
            "log index {} outside [{}, {}]",
            index,
            self.snapshot_last_index(),
            self.last_log_index()
        );
        self.log[(index - self.snapshot_last_index()) as usize].term
    }

    /// Entries from `from` (inclusive) to the end of the log.
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        if from > self.last_log_index() {
            return Vec::new();
        }
        assert!(
            from > self.snapshot_last_index(),
            "entries at {} already compacted into the snapshot",
            from
        );
        let slot = (from - self.snapshot_last_index()) as usize;
        self.log[slot..].to_vec()
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Candidate log comparison per the Raft "up-to-date" rule.
    pub fn is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Observable identity: (currentTerm, isLeader).
    pub fn get_state(&self) -> (u64, bool) {
        (self.current_term, self.role == Role::Leader)
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.me,
            term: self.current_term,
            role: self.role,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            snapshot_index: self.snapshot_last_index(),
        }
    }

    // === Role transitions ===

    /// Observed a higher term: adopt it and fall back to follower.
    pub fn step_down(&mut self, term: u64) {
        let old_role = self.role;
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.persist();
        self.last_reset_election = Instant::now();
        if old_role != Role::Follower {
            info!(me = self.me, term, from = ?old_role, "stepping down to follower");
        }
    }

    /// Begin a candidacy: bump the term, vote for self, persist, restart
    /// the election timer.
    pub fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.me);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.push(self.me);
        self.persist();
        self.last_reset_election = Instant::now();
        info!(me = self.me, term = self.current_term, "starting election");
    }

    /// Promote to leader: reinitialize replication indices. No entry is
    /// appended here; entries from earlier terms commit only once a
    /// current-term entry replicates above them.
    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.me);
        let next = self.last_log_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        self.last_reset_election = Instant::now();
        info!(me = self.me, term = self.current_term, "became leader");
    }

    // === Client-facing operations ===

    /// Append a client command to the leader's log. Returns the assigned
    /// `(index, term)` without waiting for commit, or `None` when this
    /// node is not the leader.
    pub fn start(&mut self, command: Vec<u8>) -> Option<(u64, u64)> {
        if self.dead || self.role != Role::Leader {
            return None;
        }
        let index = self.last_log_index() + 1;
        let term = self.current_term;
        self.log.push(LogEntry {
            term,
            index,
            command,
        });
        self.persist();
        debug!(me = self.me, index, term, "accepted command");
        Some((index, term))
    }

    /// Upper-layer snapshot request: compact the log through `index`,
    /// which must already be applied. The blob is the upper layer's own
    /// serialization of everything up to `index`.
    pub fn snapshot(&mut self, index: u64, data: &[u8]) {
        if index <= self.snapshot_last_index() {
            debug!(
                me = self.me,
                index,
                boundary = self.snapshot_last_index(),
                "ignoring snapshot at or below boundary"
            );
            return;
        }
        if index > self.last_applied {
            warn!(
                me = self.me,
                index,
                last_applied = self.last_applied,
                "refusing snapshot above last applied entry"
            );
            return;
        }
        let term = self.term_at(index);
        let slot = (index - self.snapshot_last_index()) as usize;
        let mut kept = self.log.split_off(slot);
        kept[0] = LogEntry {
            term,
            index,
            command: Vec::new(),
        };
        self.log = kept;
        self.persist_with_snapshot(data);
        info!(me = self.me, index, term, "took snapshot");
    }

    /// Offer a leader-shipped snapshot previously delivered on the apply
    /// channel. Installs it only when it moves this node forward.
    pub fn cond_install_snapshot(&mut self, last_term: u64, last_index: u64, data: &[u8]) -> bool {
        if last_index <= self.commit_index {
            debug!(
                me = self.me,
                last_index,
                commit_index = self.commit_index,
                "rejecting outdated snapshot"
            );
            return false;
        }

        if last_index <= self.last_log_index() && self.term_at(last_index) == last_term {
            // Our log extends past the snapshot; keep the suffix.
            let slot = (last_index - self.snapshot_last_index()) as usize;
            let mut kept = self.log.split_off(slot);
            kept[0] = LogEntry {
                term: last_term,
                index: last_index,
                command: Vec::new(),
            };
            self.log = kept;
        } else {
            self.log = vec![LogEntry {
                term: last_term,
                index: last_index,
                command: Vec::new(),
            }];
        }

        self.commit_index = last_index;
        self.last_applied = last_index;
        self.persist_with_snapshot(data);
        info!(me = self.me, last_index, last_term, "installed snapshot");
        true
    }

    // === RPC handlers (receiver side) ===

    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> RequestVoteReply {
        if self.dead {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                vote_state: VoteState::Killed,
            };
        }

        if args.term < self.current_term {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                vote_state: VoteState::Expire,
            };
        }

        if args.term > self.current_term {
            self.step_down(args.term);
        }

        if !self.is_up_to_date(args.last_log_term, args.last_log_index) {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                vote_state: VoteState::Expire,
            };
        }

        match self.voted_for {
            Some(candidate) if candidate != args.candidate_id => RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                vote_state: VoteState::Voted,
            },
            _ => {
                self.voted_for = Some(args.candidate_id);
                self.persist();
                self.last_reset_election = Instant::now();
                debug!(
                    me = self.me,
                    term = self.current_term,
                    candidate = args.candidate_id,
                    "granted vote"
                );
                RequestVoteReply {
                    term: self.current_term,
                    vote_granted: true,
                    vote_state: VoteState::Normal,
                }
            }
        }
    }

    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        if self.dead {
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: 0,
                app_state: AppendState::Disconnected,
            };
        }

        if args.term < self.current_term {
            // Stale leader; do not touch the election timer.
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: 0,
                app_state: AppendState::AppNormal,
            };
        }

        if args.term > self.current_term {
            self.step_down(args.term);
        }

        // Valid leader for the current term.
        self.role = Role::Follower;
        self.leader_id = Some(args.leader_id);
        self.last_reset_election = Instant::now();

        let snap_index = self.snapshot_last_index();
        if args.prev_log_index < snap_index {
            // The leader is behind our snapshot boundary; steer it there.
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: snap_index + 1,
                app_state: AppendState::AppNormal,
            };
        }

        if args.prev_log_index > self.last_log_index() {
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: self.last_log_index() + 1,
                app_state: AppendState::AppNormal,
            };
        }

        let local_term = self.term_at(args.prev_log_index);
        if local_term != args.prev_log_term {
            // Report the whole conflicting term so the leader can skip it.
            let mut first = args.prev_log_index;
            while first > snap_index + 1 && self.term_at(first - 1) == local_term {
                first -= 1;
            }
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: Some(local_term),
                conflict_index: first,
                app_state: AppendState::AppNormal,
            };
        }

        // Consistency check passed: reconcile the incoming entries.
        let mut changed = false;
        for entry in &args.entries {
            if entry.index <= snap_index {
                continue;
            }
            if entry.index <= self.last_log_index() {
                if self.term_at(entry.index) != entry.term {
                    let slot = (entry.index - snap_index) as usize;
                    self.log.truncate(slot);
                    self.log.push(entry.clone());
                    changed = true;
                }
                // Same term at the same index: already present, skip.
            } else {
                self.log.push(entry.clone());
                changed = true;
            }
        }
        if changed {
            self.persist();
        }

        if args.leader_commit > self.commit_index {
            let last_new = args
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or_else(|| self.last_log_index());
            let new_commit = args.leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
            }
        }

        AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_term: None,
            conflict_index: 0,
            app_state: AppendState::AppNormal,
        }
    }

    /// Receiver side of InstallSnapshot. The snapshot is staged for FIFO
    /// delivery on the apply channel; installation happens only when the
    /// upper layer calls `cond_install_snapshot` back.
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> InstallSnapshotReply {
        if self.dead || args.term < self.current_term {
            return InstallSnapshotReply {
                term: self.current_term,
            };
        }

        if args.term > self.current_term {
            self.step_down(args.term);
        }

        self.role = Role::Follower;
        self.leader_id = Some(args.leader_id);
        self.last_reset_election = Instant::now();

        if args.last_included_index <= self.commit_index {
            // Everything in this snapshot is already committed locally.
            return InstallSnapshotReply {
                term: self.current_term,
            };
        }

        let superseded = matches!(
            &self.pending_snapshot,
            Some(ApplyMsg::Snapshot { index, .. }) if args.last_included_index <= *index
        );
        if !superseded {
            debug!(
                me = self.me,
                index = args.last_included_index,
                term = args.last_included_term,
                "staging snapshot for delivery"
            );
            self.pending_snapshot = Some(ApplyMsg::Snapshot {
                data: args.data.clone(),
                index: args.last_included_index,
                term: args.last_included_term,
            });
        }

        InstallSnapshotReply {
            term: self.current_term,
        }
    }

    // === Reply handling (sender side, called with the lock re-acquired) ===

    /// Account a RequestVote reply for the candidacy started at
    /// `term_at_start`. Returns true when this node just won the election.
    pub fn handle_request_vote_reply(
        &mut self,
        peer: u64,
        term_at_start: u64,
        reply: &RequestVoteReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.step_down(reply.term);
            return false;
        }

        // Stale reply: the candidacy it answers is over.
        if self.role != Role::Candidate || self.current_term != term_at_start {
            return false;
        }

        if reply.vote_granted && !self.votes_received.contains(&peer) {
            self.votes_received.push(peer);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Account an AppendEntries reply for entries sent at `sent_term`
    /// with the given `prev_log_index` and entry count.
    pub fn handle_append_entries_reply(
        &mut self,
        peer: u64,
        sent_term: u64,
        prev_log_index: u64,
        sent_entries: u64,
        reply: &AppendEntriesReply,
    ) {
        if reply.term > self.current_term {
            self.step_down(reply.term);
            return;
        }

        // In-flight work from a previous leadership is void.
        if self.role != Role::Leader || sent_term != self.current_term {
            return;
        }

        if reply.success {
            let matched = prev_log_index + sent_entries;
            let current = self.match_index.get(&peer).copied().unwrap_or(0);
            if matched > current {
                self.match_index.insert(peer, matched);
            }
            let next = self.next_index.entry(peer).or_insert(1);
            if matched + 1 > *next {
                *next = matched + 1;
            }
            self.leader_update_commit_index();
            return;
        }

        // Rejected: back off using the follower's hint. A reply without a
        // hint (advisory-only rejection) leaves the indices untouched and
        // the next heartbeat simply retries.
        let hinted = match reply.conflict_term {
            Some(term) => self
                .last_index_of_term(term)
                .map(|i| i + 1)
                .unwrap_or(reply.conflict_index),
            None => reply.conflict_index,
        };
        if hinted > 0 {
            self.next_index.insert(peer, hinted.max(1));
            debug!(me = self.me, peer, next = hinted, "backing off next index");
        }
    }

    /// Record a successfully installed remote snapshot for `peer`.
    pub fn handle_install_snapshot_reply(
        &mut self,
        peer: u64,
        sent_term: u64,
        last_included_index: u64,
        reply: &InstallSnapshotReply,
    ) {
        if reply.term > self.current_term {
            self.step_down(reply.term);
            return;
        }
        if self.role != Role::Leader || sent_term != self.current_term {
            return;
        }
        let current = self.match_index.get(&peer).copied().unwrap_or(0);
        if last_included_index > current {
            self.match_index.insert(peer, last_included_index);
        }
        let next = self.next_index.entry(peer).or_insert(1);
        if last_included_index + 1 > *next {
            *next = last_included_index + 1;
        }
    }

    /// Advance commitIndex to the highest index replicated on a majority,
    /// but only through an entry of the current term (the Figure 8
    /// constraint).
    pub fn leader_update_commit_index(&mut self) {
        let mut matches: Vec<u64> = self
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matches.push(self.last_log_index());
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matches[matches.len() / 2];
        if candidate > self.commit_index && self.term_at(candidate) == self.current_term {
            debug!(me = self.me, commit = candidate, "advancing commit index");
            self.commit_index = candidate;
        }
    }

    // === Apply pipeline ===

    /// Drain deliverable messages. A staged snapshot is delivered alone so
    /// the channel order stays monotone across the installation; otherwise
    /// committed entries are handed out in index order, advancing
    /// `last_applied`.
    pub fn take_apply_messages(&mut self) -> Vec<ApplyMsg> {
        if let Some(msg) = self.pending_snapshot.take() {
            return vec![msg];
        }

        let mut out = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let slot = (self.last_applied - self.snapshot_last_index()) as usize;
            let entry = &self.log[slot];
            out.push(ApplyMsg::Command {
                data: entry.command.clone(),
                index: entry.index,
                term: entry.term,
            });
        }
        out
    }
}
