//! The KV client stub ("Clerk"): finds the leader and stamps each request
//! with a stable client id and a request id that does not advance across
//! retries of the same logical operation.
//!
//! Grounded on `original_source/cmd/kvraft.go`'s `MakeClerk`/`ck.Put`/`ck.Get`
//! round-robin-with-remembered-leader loop, re-targeted at this crate's
//! `kv::transport` wire protocol instead of gRPC.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::debug;
use rand::Rng;

use crate::error::KvError;
use crate::kv::transport::{self, KvRpc, KvRpcReply};

pub struct Clerk {
    servers: Vec<String>,
    client_id: u64,
    next_request_id: AtomicU64,
    leader_hint: AtomicUsize,
}

impl Clerk {
    /// `servers` is the kv-facing address of every node, in a stable order
    /// shared by all clerks (the order itself carries no meaning beyond
    /// giving every clerk the same round-robin path).
    pub fn new(servers: Vec<String>) -> Self {
        assert!(!servers.is_empty(), "a clerk needs at least one server");
        Self {
            servers,
            client_id: rand::thread_rng().gen(),
            next_request_id: AtomicU64::new(1),
            leader_hint: AtomicUsize::new(0),
        }
    }

    /// Retries indefinitely until the put is acknowledged. Dropping the
    /// clerk (or the future) is the caller's only way to abandon it.
    pub async fn put(&self, key: &str, value: &str) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        loop {
            let peer = self.current_peer();
            let rpc = KvRpc::Put {
                key: key.to_string(),
                value: value.to_string(),
                client_id: self.client_id,
                request_id,
            };
            match transport::call(&self.servers[peer], rpc).await {
                Ok(KvRpcReply::Put(Ok(()))) => return,
                Ok(KvRpcReply::Put(Err(_))) => self.advance(peer),
                Ok(KvRpcReply::Get(_)) => unreachable!("kv transport replied Get to a Put"),
                Err(e) => {
                    debug!("put to {} failed: {e}", self.servers[peer]);
                    self.advance(peer);
                }
            }
        }
    }

    /// `None` means the key has no value (`KvError::NoKey`, terminal).
    /// Any other failure is retried against the next peer.
    pub async fn get(&self, key: &str) -> Option<String> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        loop {
            let peer = self.current_peer();
            let rpc = KvRpc::Get { key: key.to_string(), client_id: self.client_id, request_id };
            match transport::call(&self.servers[peer], rpc).await {
                Ok(KvRpcReply::Get(Ok(value))) => return Some(value),
                Ok(KvRpcReply::Get(Err(KvError::NoKey))) => return None,
                Ok(KvRpcReply::Get(Err(_))) => self.advance(peer),
                Ok(KvRpcReply::Put(_)) => unreachable!("kv transport replied Put to a Get"),
                Err(e) => {
                    debug!("get from {} failed: {e}", self.servers[peer]);
                    self.advance(peer);
                }
            }
        }
    }

    fn current_peer(&self) -> usize {
        self.leader_hint.load(Ordering::Relaxed) % self.servers.len()
    }

    fn advance(&self, from: usize) {
        let next = (from + 1) % self.servers.len();
        self.leader_hint.store(next, Ordering::Relaxed);
    }
}
