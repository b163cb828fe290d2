mod common;

use std::time::Duration;

use raftkv::raft::ApplyMsg;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_entries_are_delivered_to_every_node_in_order() {
    let mut cluster = common::start_raft_only_cluster(3, 31500, None).await;
    let leader = common::wait_for_leader(&cluster.rafts).await;

    let (i1, t1, ok1) = cluster.rafts[leader].start(b"one".to_vec()).await;
    assert!(ok1);
    let (i2, _t2, ok2) = cluster.rafts[leader].start(b"two".to_vec()).await;
    assert!(ok2);
    assert_eq!(i2, i1 + 1);

    for apply_rx in cluster.applies.iter_mut() {
        let first = tokio::time::timeout(Duration::from_secs(2), apply_rx.recv())
            .await
            .expect("apply stream should not stall")
            .expect("apply channel should not close");
        match first {
            ApplyMsg::Command { index, term, command } => {
                assert_eq!(index, i1);
                assert_eq!(term, t1);
                assert_eq!(command, b"one");
            }
            ApplyMsg::Snapshot { .. } => panic!("unexpected snapshot before any was taken"),
        }

        let second = tokio::time::timeout(Duration::from_secs(2), apply_rx.recv())
            .await
            .expect("apply stream should not stall")
            .expect("apply channel should not close");
        match second {
            ApplyMsg::Command { index, command, .. } => {
                assert_eq!(index, i2);
                assert_eq!(command, b"two");
            }
            ApplyMsg::Snapshot { .. } => panic!("unexpected snapshot before any was taken"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_majority_keeps_committing_while_one_node_never_applies() {
    // Without a network-partition primitive, the closest equivalent we can
    // exercise is a follower whose apply stream is never drained: thanks to
    // the unbounded apply channel this must not back-pressure replication,
    // so the majority keeps committing regardless.
    let mut cluster = common::start_raft_only_cluster(3, 31600, None).await;
    let leader = common::wait_for_leader(&cluster.rafts).await;
    let stalled = (leader + 1) % 3;

    let mut last_index = 0;
    for n in 0..100 {
        let (index, _term, ok) = cluster.rafts[leader].start(format!("key-{n}").into_bytes()).await;
        assert!(ok);
        last_index = index;
    }

    for (id, apply_rx) in cluster.applies.iter_mut().enumerate() {
        if id == stalled {
            continue;
        }
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), apply_rx.recv())
                .await
                .expect("apply stream should not stall")
                .expect("apply channel should not close");
            if let ApplyMsg::Command { index, .. } = msg {
                if index == last_index {
                    break;
                }
            }
        }
    }
}
