mod common;

use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_leader_is_elected_in_a_fresh_cluster() {
    let cluster = common::start_raft_only_cluster(3, 31100, None).await;
    let leader = common::wait_for_leader(&cluster.rafts).await;

    let mut leaders = 0;
    for raft in &cluster.rafts {
        if raft.is_leader().await {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1, "exactly one leader should be recognized cluster-wide");
    assert!(cluster.rafts[leader].is_leader().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_two_of_three_quorum_still_elects_a_leader() {
    // Node 2 never starts: the remaining two form exactly a majority of three.
    let cluster = common::start_raft_only_cluster(3, 31200, Some(2)).await;
    let leader = common::wait_for_leader(&cluster.rafts).await;
    assert!(cluster.rafts[leader].is_leader().await);

    let (index, _term, ok) = cluster.rafts[leader].start(b"alive-with-quorum".to_vec()).await;
    assert!(ok);
    assert!(index >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_lone_node_elects_itself() {
    let cluster = common::start_raft_only_cluster(1, 31300, None).await;
    let leader = common::wait_for_leader(&cluster.rafts).await;
    assert_eq!(leader, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_resumes_its_persisted_term_and_vote() {
    use raftkv::raft::{Raft, RaftConfig};
    use raftkv::storage::MemoryStorage;
    use std::sync::Arc;

    let storage = Arc::new(MemoryStorage::new());
    let addrs = vec!["127.0.0.1:31401".to_string()];
    let (raft, _apply_rx) = Raft::new(addrs.clone(), 0, storage.clone(), RaftConfig::default());
    Arc::clone(&raft).run().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(raft.is_leader().await);
    raft.start(b"before-restart".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let term_before = raft.current_term().await;
    let log_index_before = raft.last_log_index().await;
    assert!(log_index_before >= 1);

    // "Restart": construct a fresh Raft over the same storage handle.
    let (restarted, _apply_rx2) = Raft::new(addrs, 0, storage, RaftConfig::default());
    assert!(!restarted.is_leader().await, "a freshly constructed node always starts as Follower");
    assert_eq!(restarted.current_term().await, term_before, "term must survive reconstruction from storage");
    assert_eq!(restarted.last_log_index().await, log_index_before, "log must survive reconstruction from storage");
}
