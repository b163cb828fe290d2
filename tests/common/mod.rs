use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use raftkv::kv::server::KvServer;
use raftkv::kv::transport as kv_transport;
use raftkv::raft::{transport as raft_transport, ApplyMsg, Raft, RaftConfig};
use raftkv::storage::MemoryStorage;

/// Timers shrunk well below the 150-300ms/50ms production defaults so tests
/// settle quickly without being flaky under load.
pub fn test_raft_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(60),
        election_timeout_max: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
    }
}

pub fn raft_addrs(n: usize, base_port: u16) -> Vec<String> {
    (0..n).map(|i| format!("127.0.0.1:{}", base_port + i as u16)).collect()
}

/// Construct, run, and start serving one raft node against an already-agreed
/// peer address list. Safe to call after the rest of the cluster is already
/// running, to simulate a node joining or rejoining late.
pub async fn start_raft_node(raft_addrs: &[String], id: usize) -> (Arc<Raft>, mpsc::UnboundedReceiver<ApplyMsg>) {
    let (raft, apply_rx) =
        Raft::new(raft_addrs.to_vec(), id, Arc::new(MemoryStorage::new()), test_raft_config());
    Arc::clone(&raft).run().await;
    let addr = raft_addrs[id].clone();
    let r = Arc::clone(&raft);
    tokio::spawn(async move {
        let _ = raft_transport::serve(&addr, r).await;
    });
    (raft, apply_rx)
}

pub struct RaftOnlyCluster {
    pub addrs: Vec<String>,
    pub rafts: Vec<Arc<Raft>>,
    pub applies: Vec<mpsc::UnboundedReceiver<ApplyMsg>>,
}

/// Every node started immediately. `skip` is excluded (constructed addresses
/// exist for it, but no node is actually running at that slot) so a test can
/// bring it online later with `start_raft_node`.
pub async fn start_raft_only_cluster(n: usize, base_port: u16, skip: Option<usize>) -> RaftOnlyCluster {
    let addrs = raft_addrs(n, base_port);
    let mut rafts = Vec::new();
    let mut applies = Vec::new();
    for id in 0..n {
        if Some(id) == skip {
            continue;
        }
        let (raft, apply_rx) = start_raft_node(&addrs, id).await;
        rafts.push(raft);
        applies.push(apply_rx);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    RaftOnlyCluster { addrs, rafts, applies }
}

pub async fn wait_for_leader(rafts: &[Arc<Raft>]) -> usize {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            for (i, r) in rafts.iter().enumerate() {
                if r.is_leader().await {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("a leader should be elected within 5s")
}

pub struct Cluster {
    pub kv_addrs: Vec<String>,
}

pub async fn start_cluster(n: usize, base_port: u16) -> Cluster {
    let raft_peer_addrs = raft_addrs(n, base_port);
    let kv_addrs = raft_addrs(n, base_port + 100);

    for id in 0..n {
        let (raft, apply_rx) = start_raft_node(&raft_peer_addrs, id).await;
        let kv = KvServer::new(id, raft, apply_rx, None);
        let kaddr = kv_addrs[id].clone();
        tokio::spawn(async move {
            let _ = kv_transport::serve(&kaddr, kv).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    Cluster { kv_addrs }
}
