mod common;

use std::time::Duration;

use raftkv::kv::transport::{self as kv_transport, KvRpc, KvRpcReply};
use raftkv::Clerk;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_put_and_get() {
    let cluster = common::start_cluster(3, 31900).await;
    let clerk = Clerk::new(cluster.kv_addrs.clone());

    clerk.put("x", "1").await;
    clerk.put("y", "2").await;
    assert_eq!(clerk.get("x").await, Some("1".to_string()));
    assert_eq!(clerk.get("z").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_leader_bounces_to_the_right_peer() {
    let cluster = common::start_cluster(3, 32000).await;
    // A brand-new clerk always starts pointed at peer 0, which is the
    // leader only by chance -- exercising the bounce is the point.
    let clerk = Clerk::new(cluster.kv_addrs.clone());
    clerk.put("a", "A").await;
    assert_eq!(clerk.get("a").await, Some("A".to_string()));
}

async fn put_direct(addrs: &[String], client_id: u64, request_id: u64, key: &str, value: &str) {
    loop {
        for addr in addrs {
            if let Ok(KvRpcReply::Put(Ok(()))) = kv_transport::call(
                addr,
                KvRpc::Put { key: key.to_string(), value: value.to_string(), client_id, request_id },
            )
            .await
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_request_id_is_not_double_applied() {
    let cluster = common::start_cluster(3, 32100).await;
    let client_id = 42;

    put_direct(&cluster.kv_addrs, client_id, 7, "k", "v1").await;
    // Resubmitting the identical (client_id, request_id) pair, as a client
    // would after a leader failover, must be a no-op that still reports OK.
    put_direct(&cluster.kv_addrs, client_id, 7, "k", "v1").await;

    let clerk = Clerk::new(cluster.kv_addrs.clone());
    assert_eq!(clerk.get("k").await, Some("v1".to_string()));

    put_direct(&cluster.kv_addrs, client_id, 8, "k", "v2").await;
    assert_eq!(clerk.get("k").await, Some("v2".to_string()));
}
