use std::env;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::info;

use raftkv::kv::{server::KvServer, transport as kv_transport};
use raftkv::raft::{Raft, RaftConfig};
use raftkv::storage::{FileStorage, MemoryStorage, Storage};

const RAFT_PORT_OFFSET: u16 = 1000; // raft runs on kv_port + 1000, per node

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("Usage: server <server_id> <kv_addr_0> <kv_addr_1> ... [--max-state N] [--data-dir DIR]");
    }

    let server_id: usize = args[1].parse()?;
    let mut kv_addrs = Vec::new();
    let mut max_raft_state: Option<usize> = None;
    let mut data_dir: Option<String> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--max-state" => {
                i += 1;
                max_raft_state = Some(args.get(i).ok_or_else(|| anyhow::anyhow!("--max-state needs a value"))?.parse()?);
            }
            "--data-dir" => {
                i += 1;
                data_dir = Some(args.get(i).ok_or_else(|| anyhow::anyhow!("--data-dir needs a value"))?.clone());
            }
            addr => kv_addrs.push(addr.to_string()),
        }
        i += 1;
    }

    if server_id >= kv_addrs.len() {
        bail!("server_id {server_id} out of range for {} peers", kv_addrs.len());
    }

    let raft_addrs: Vec<String> = kv_addrs.iter().map(|a| with_port_offset(a, RAFT_PORT_OFFSET)).collect();
    info!("node {server_id}: kv addrs {kv_addrs:?}");
    info!("node {server_id}: raft addrs {raft_addrs:?}");

    let storage: Arc<dyn Storage> = match data_dir {
        Some(dir) => Arc::new(FileStorage::new(dir, server_id)?),
        None => Arc::new(MemoryStorage::new()),
    };

    let (raft, apply_rx) = Raft::new(raft_addrs.clone(), server_id, storage, RaftConfig::default());
    Arc::clone(&raft).run().await;

    let raft_addr = raft_addrs[server_id].clone();
    let raft_for_listener = Arc::clone(&raft);
    tokio::spawn(async move {
        if let Err(e) = raftkv::raft::transport::serve(&raft_addr, raft_for_listener).await {
            log::error!("raft transport exited: {e}");
        }
    });

    let kv = KvServer::new(server_id, raft, apply_rx, max_raft_state);
    let kv_addr = kv_addrs[server_id].clone();
    info!("node {server_id}: kv server listening on {kv_addr}");
    kv_transport::serve(&kv_addr, kv).await?;

    Ok(())
}

fn with_port_offset(addr: &str, offset: u16) -> String {
    let (host, port) = addr.rsplit_once(':').expect("addr must be host:port");
    let port: u16 = port.parse().expect("port must be numeric");
    format!("{host}:{}", port + offset)
}
