//! Cluster-level integration tests over the in-memory transport.
//!
//! Each test drives one of the load-bearing behaviors of the replication
//! core: election, ordered replication, partition recovery, snapshot
//! catch-up, log divergence repair, and crash recovery.

use std::time::Duration;

use tokio::time::sleep;

use raft_kv::core::raft_core::{
    AppendEntriesArgs, RaftCore, RequestVoteArgs, RequestVoteReply, Role, VoteState,
};
use raft_kv::persist::memory::MemoryPersister;
use raft_kv::testing::TestCluster;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Commit a put through whoever currently leads, riding out leadership
/// changes. Puts are idempotent, so retrying after a timeout is safe.
async fn put_with_retry(cluster: &TestCluster, key: &str, value: &str) {
    for _ in 0..40 {
        if let Some(leader) = cluster.leader_index().await {
            if cluster.nodes[leader].kv.put(key, value).await.is_ok() {
                return;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("could not commit {}={}", key, value);
}

#[tokio::test]
async fn scenario_bootstrap_elects_single_stable_leader() {
    init_tracing();
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader within one second of bootstrap");
    let term = cluster.nodes[leader].status().await.term;
    assert!(term >= 1);

    // The leader stays stable (and unique for its term) for two seconds.
    for _ in 0..20 {
        sleep(Duration::from_millis(100)).await;
        let leaders = cluster.leaders_at_term(term).await;
        assert_eq!(leaders, vec![leader], "exactly one stable leader at term {}", term);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn scenario_replication_applies_in_order_on_all_nodes() {
    init_tracing();
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    cluster.nodes[leader].kv.put("x", "1").await.unwrap();
    cluster.nodes[leader].kv.put("y", "2").await.unwrap();

    // Both entries reach every state machine.
    let mut converged = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(25)).await;
        converged = (0..3).all(|i| {
            let kv = cluster.kv_snapshot(i);
            kv.get("x") == Some(&"1".to_string()) && kv.get("y") == Some(&"2".to_string())
        });
        if converged {
            break;
        }
    }
    assert!(converged, "all nodes apply both commands");

    // Index order: x=1 took the first slot, y=2 the second, everywhere.
    for node in &cluster.nodes {
        let status = node.status().await;
        assert!(status.last_applied >= 2);
        assert!(status.commit_index >= status.last_applied);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn scenario_partitioned_leader_steps_down_and_converges() {
    init_tracing();
    let cluster = TestCluster::new(3).await;

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("initial leader");
    let old_term = cluster.nodes[old_leader].status().await.term;

    put_with_retry(&cluster, "pre", "partition").await;

    cluster.isolate(old_leader);

    // The remaining pair elects a fresh leader at a higher term.
    let mut new_leader = None;
    for _ in 0..100 {
        sleep(Duration::from_millis(50)).await;
        for i in 0..cluster.nodes.len() {
            if i == old_leader {
                continue;
            }
            let status = cluster.nodes[i].status().await;
            if status.role == Role::Leader {
                new_leader = Some(i);
            }
        }
        if new_leader.is_some() {
            break;
        }
    }
    let new_leader = new_leader.expect("majority side elects a new leader");
    let new_term = cluster.nodes[new_leader].status().await.term;
    assert!(new_term > old_term, "new leadership uses a newer term");

    // The majority side accepts and commits new writes.
    cluster.nodes[new_leader].kv.put("z", "3").await.unwrap();

    // The isolated leader is stuck at its old term, unable to commit.
    assert_eq!(cluster.nodes[old_leader].status().await.term, old_term);
    assert_eq!(cluster.kv_snapshot(old_leader).get("z"), None);

    cluster.heal(old_leader);

    // After healing, the old leader steps down and its log converges.
    let mut converged = false;
    for _ in 0..200 {
        sleep(Duration::from_millis(25)).await;
        let kv = cluster.kv_snapshot(old_leader);
        if kv.get("z") == Some(&"3".to_string()) {
            converged = true;
            break;
        }
    }
    assert!(converged, "healed node catches up with the new leader's log");

    let status = cluster.nodes[old_leader].status().await;
    assert!(status.term >= new_term);

    cluster.shutdown().await;
}

#[tokio::test]
async fn scenario_lagging_follower_catches_up_via_snapshot() {
    init_tracing();
    // Small threshold: nodes compact their logs almost immediately.
    let cluster = TestCluster::with_snapshot_threshold(3, 512).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    let follower = (0..3).find(|&i| i != leader).unwrap();
    let lagger = (0..3).find(|&i| i != leader && i != follower).unwrap();

    // The lagger misses everything from here on.
    cluster.isolate(lagger);

    for i in 0..30 {
        put_with_retry(&cluster, &format!("key-{}", i), &format!("value-{}", i)).await;
    }

    // Wait for the majority side to compact past its log head.
    let mut compacted = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(25)).await;
        if cluster.nodes[leader].status().await.snapshot_index > 0 {
            compacted = true;
            break;
        }
    }
    assert!(compacted, "writes beyond the threshold trigger compaction");

    let lagger_log_head = cluster.nodes[lagger].status().await.last_log_index;
    assert!(
        lagger_log_head < cluster.nodes[leader].status().await.snapshot_index,
        "the lagger is behind the leader's compaction boundary"
    );

    cluster.heal(lagger);

    // The lagger re-joins (possibly after an election round it provoked),
    // receives the snapshot, then the log tail, and ends up identical.
    let mut converged = false;
    for _ in 0..400 {
        sleep(Duration::from_millis(25)).await;
        let reference = cluster.kv_snapshot(leader);
        let caught_up = cluster.kv_snapshot(lagger);
        if reference.len() == 30 && caught_up == reference {
            converged = true;
            break;
        }
    }
    assert!(converged, "lagging follower converges to the leader's state");
    assert!(
        cluster.nodes[lagger].status().await.snapshot_index > 0,
        "the early keys can only have arrived inside a snapshot"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn scenario_conflicting_follower_log_is_repaired() {
    init_tracing();
    // Follower holds [t1, t1, t2, t2]; the leader's log is [t1, t1, t3].
    // After the backoff round-trips, the follower ends at [t1, t1, t3].
    let mut follower = RaftCore::new(1, vec![2, 3], Box::new(MemoryPersister::new()));
    let mut leader = RaftCore::new(2, vec![1, 3], Box::new(MemoryPersister::new()));

    let entry = |term: u64, index: u64, tag: &str| raft_kv::core::raft_core::LogEntry {
        term,
        index,
        command: tag.as_bytes().to_vec(),
    };

    // Seed both logs from a common term-1 prefix.
    let seed = AppendEntriesArgs {
        term: 1,
        leader_id: 9,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![entry(1, 1, "a"), entry(1, 2, "b")],
        leader_commit: 0,
    };
    assert!(follower.handle_append_entries(&seed).success);
    assert!(leader.handle_append_entries(&seed).success);

    // The follower then took two term-2 entries that never committed.
    let stale = AppendEntriesArgs {
        term: 2,
        leader_id: 9,
        prev_log_index: 2,
        prev_log_term: 1,
        entries: vec![entry(2, 3, "lost-1"), entry(2, 4, "lost-2")],
        leader_commit: 0,
    };
    assert!(follower.handle_append_entries(&stale).success);

    // The leader wins term 3 and appends one entry of its own.
    leader.start_election(); // term 2
    leader.start_election(); // term 3
    let mut term = leader.current_term;
    let granted = RequestVoteReply {
        term,
        vote_granted: true,
        vote_state: VoteState::Normal,
    };
    assert!(leader.handle_request_vote_reply(3, term, &granted));
    assert_eq!(leader.role, Role::Leader);
    leader.start(b"new".to_vec()).unwrap();
    assert_eq!(leader.last_log_index(), 3);

    // It is re-elected at term 4, so replication now probes from the log
    // head rather than from where the old leadership left off.
    leader.start_election();
    term = leader.current_term;
    let granted = RequestVoteReply {
        term,
        vote_granted: true,
        vote_state: VoteState::Normal,
    };
    assert!(leader.handle_request_vote_reply(3, term, &granted));
    assert_eq!(leader.next_index[&1], 4);

    // Round 1: probe at the leader's head. The follower reports its
    // conflicting term 2 starting at index 3.
    let next = leader.next_index[&1];
    let probe = AppendEntriesArgs {
        term,
        leader_id: 2,
        prev_log_index: next - 1,
        prev_log_term: leader.term_at(next - 1),
        entries: leader.entries_from(next),
        leader_commit: leader.commit_index,
    };
    let reply = follower.handle_append_entries(&probe);
    assert!(!reply.success);
    assert_eq!(reply.conflict_term, Some(2));
    assert_eq!(reply.conflict_index, 3);
    leader.handle_append_entries_reply(
        1,
        term,
        probe.prev_log_index,
        probe.entries.len() as u64,
        &reply,
    );
    // The leader has no term-2 entries, so it falls back to the hint.
    assert_eq!(leader.next_index[&1], 3);

    // Round 2: resend from the hint; the divergent suffix is replaced.
    let next = leader.next_index[&1];
    let repair = AppendEntriesArgs {
        term,
        leader_id: 2,
        prev_log_index: next - 1,
        prev_log_term: leader.term_at(next - 1),
        entries: leader.entries_from(next),
        leader_commit: leader.commit_index,
    };
    let reply = follower.handle_append_entries(&repair);
    assert!(reply.success);

    assert_eq!(follower.last_log_index(), 3);
    assert_eq!(follower.term_at(1), 1);
    assert_eq!(follower.term_at(2), 1);
    assert_eq!(follower.term_at(3), 3);
}

#[tokio::test]
async fn scenario_restart_rehydrates_persisted_state() {
    init_tracing();
    let persister = MemoryPersister::new();

    {
        let mut core = RaftCore::new(1, vec![2, 3], Box::new(persister.clone()));

        // Vote for node 2 in term 5.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 5,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(reply.vote_granted);

        // Accept ten entries from that leader.
        let entries: Vec<_> = (1..=10)
            .map(|i| raft_kv::core::raft_core::LogEntry {
                term: 5,
                index: i,
                command: format!("cmd-{}", i).into_bytes(),
            })
            .collect();
        let append = AppendEntriesArgs {
            term: 5,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 5,
        };
        assert!(core.handle_append_entries(&append).success);
        // Node crashes here; nothing was cleanly shut down.
    }

    let mut restarted = RaftCore::new(1, vec![2, 3], Box::new(persister));
    assert_eq!(restarted.current_term, 5);
    assert_eq!(restarted.voted_for, Some(2));
    assert_eq!(restarted.role, Role::Follower);
    assert_eq!(restarted.last_log_index(), 10);
    assert_eq!(restarted.term_at(10), 5);
    // Volatile state reset to the snapshot boundary, not the old commit.
    assert_eq!(restarted.commit_index, 0);
    assert_eq!(restarted.last_applied, 0);

    // The persisted vote still binds: no second grant in term 5.
    let reply = restarted.handle_request_vote(&RequestVoteArgs {
        term: 5,
        candidate_id: 3,
        last_log_index: 20,
        last_log_term: 5,
    });
    assert!(!reply.vote_granted);
    assert_eq!(reply.vote_state, VoteState::Voted);
}
