//! The linearizable key/value state machine sitting on top of raft's apply
//! stream.
//!
//! Grounded on `original_source/kvraft/server.go`'s `KVServer`: the
//! `waitCh`/`lastApplied` pair, the dedup-by-`(clientId, requestId)` rule in
//! `applier`, and the `StateSize() > maxraftstate` snapshot trigger. The
//! one-shot-channel-of-1 waiter becomes `tokio::sync::oneshot` here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::KvError;
use crate::raft::{ApplyMsg, Raft};

use super::op::{KvSnapshot, Op, OpType};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

struct KvState {
    db: HashMap<String, String>,
    last_applied: HashMap<u64, u64>,
    waiters: HashMap<u64, oneshot::Sender<Result<String, KvError>>>,
}

/// One node's key/value server. Holds no network listeners itself —
/// `kv::transport::serve` wraps a `KvServer` for RPC.
pub struct KvServer {
    id: usize,
    raft: Arc<Raft>,
    state: Mutex<KvState>,
    max_raft_state: Option<usize>,
    request_timeout: Duration,
}

impl KvServer {
    pub fn new(
        id: usize,
        raft: Arc<Raft>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        max_raft_state: Option<usize>,
    ) -> Arc<KvServer> {
        Self::with_timeout(id, raft, apply_rx, max_raft_state, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        id: usize,
        raft: Arc<Raft>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        max_raft_state: Option<usize>,
        request_timeout: Duration,
    ) -> Arc<KvServer> {
        // The initial snapshot is read directly from storage, not delivered
        // over the apply channel: a freshly constructed raft never replays
        // history the snapshot already subsumes.
        let (db, last_applied) = decode_snapshot(&raft.read_snapshot());

        let kv = Arc::new(KvServer {
            id,
            raft,
            state: Mutex::new(KvState { db, last_applied, waiters: HashMap::new() }),
            max_raft_state,
            request_timeout,
        });

        let applier = Arc::clone(&kv);
        tokio::spawn(async move { applier.run_applier(apply_rx).await });
        kv
    }

    pub async fn put(&self, key: String, value: String, client_id: u64, request_id: u64) -> Result<(), KvError> {
        let op = Op { op_type: OpType::Put, key, value, client_id, request_id };
        self.submit(op).await.map(|_| ())
    }

    pub async fn get(&self, key: String, client_id: u64, request_id: u64) -> Result<String, KvError> {
        let op = Op { op_type: OpType::Get, key, value: String::new(), client_id, request_id };
        self.submit(op).await
    }

    async fn submit(&self, op: Op) -> Result<String, KvError> {
        let (index, _term, is_leader) = self.raft.start(op.encode()).await;
        if !is_leader {
            return Err(KvError::WrongLeader);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            // An index collision on leadership churn is legitimate: the
            // older waiter's sender is dropped here, which resolves its
            // `rx.await` immediately with `RecvError` rather than making it
            // wait out the full timeout. We treat that the same as a
            // timeout below — the caller retries either way.
            state.waiters.insert(index, tx);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvError::Timeout),
            Err(_) => {
                self.state.lock().await.waiters.remove(&index);
                Err(KvError::Timeout)
            }
        }
    }

    async fn run_applier(self: Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, term: _, command } => {
                    let result = match Op::decode(&command) {
                        Ok(op) => self.apply_op(index, op).await,
                        Err(e) => {
                            error!("[{}] failed to decode log entry at index {index}: {e}", self.id);
                            Err(KvError::Corrupt)
                        }
                    };
                    self.notify_waiter(index, result).await;
                    self.maybe_snapshot(index).await;
                }
                ApplyMsg::Snapshot { index, term: _, data } => {
                    debug!("[{}] installing snapshot through index {index}", self.id);
                    self.apply_snapshot(&data).await;
                    // Waiters with index <= this snapshot's index are left
                    // untouched: their linearization point is unknowable, so
                    // they time out and the client retries, per spec.
                }
            }
        }
    }

    async fn apply_op(&self, index: u64, op: Op) -> Result<String, KvError> {
        let mut state = self.state.lock().await;
        match op.op_type {
            OpType::Put => {
                let dup = state
                    .last_applied
                    .get(&op.client_id)
                    .is_some_and(|&last| last >= op.request_id);
                if !dup {
                    state.db.insert(op.key.clone(), op.value.clone());
                    state.last_applied.insert(op.client_id, op.request_id);
                    debug!("[{}] applied Put key={} at index {index}", self.id, op.key);
                }
                Ok(String::new())
            }
            OpType::Get => state.db.get(&op.key).cloned().ok_or(KvError::NoKey),
        }
    }

    async fn notify_waiter(&self, index: u64, result: Result<String, KvError>) {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.waiters.remove(&index) {
            let _ = tx.send(result); // receiver may already have timed out
        }
    }

    async fn maybe_snapshot(&self, index: u64) {
        let Some(threshold) = self.max_raft_state else { return };
        if self.raft.raft_state_size() <= threshold {
            return;
        }
        let (db, last_applied) = {
            let state = self.state.lock().await;
            (state.db.clone(), state.last_applied.clone())
        };
        let bytes = bincode::serialize(&KvSnapshot { db, last_applied }).expect("KvSnapshot always encodes");
        self.raft.snapshot(index, bytes).await;
    }

    async fn apply_snapshot(&self, data: &[u8]) {
        let (db, last_applied) = decode_snapshot(data);
        let mut state = self.state.lock().await;
        state.db = db;
        state.last_applied = last_applied;
    }
}

fn decode_snapshot(data: &[u8]) -> (HashMap<String, String>, HashMap<u64, u64>) {
    if data.is_empty() {
        return (HashMap::new(), HashMap::new());
    }
    match bincode::deserialize::<KvSnapshot>(data) {
        Ok(snap) => (snap.db, snap.last_applied),
        Err(e) => {
            error!("failed to decode kv snapshot, starting empty: {e}");
            (HashMap::new(), HashMap::new())
        }
    }
}
