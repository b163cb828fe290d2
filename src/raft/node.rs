//! The consensus module: leader election, log replication, snapshotting.
//!
//! Structurally grounded in the source repository's `RaftNode`/`RaftState`
//! (the `Arc<Mutex<RaftState>>` node, the persist-before-replying discipline,
//! the drop-lock-before-RPC pattern in replication) but extended with full
//! log-matching AppendEntries (the source only ever sent heartbeats),
//! snapshotting, and InstallSnapshot, none of which the source implements.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::storage::Storage;

use super::transport::{self, RaftRpc, RaftRpcReply};
use super::types::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    LogEntry, PersistentState, RequestVoteArgs, RequestVoteReply, Role,
};

/// Election/heartbeat timing. Fields are `Duration`s so test harnesses can
/// shrink them far below the 150-300ms/50ms recommendations.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

struct RaftState {
    current_term: u64,
    voted_for: Option<usize>,
    log: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,

    commit_index: u64,
    last_applied: u64,
    role: Role,
    leader_id: Option<usize>,
    last_heartbeat: Instant,
    votes_received: HashSet<usize>,

    next_index: HashMap<usize, u64>,
    match_index: HashMap<usize, u64>,

    /// Set by `install_snapshot` when a snapshot was just adopted; drained by
    /// the apply loop, which must deliver it before any further command.
    pending_snapshot: Option<(u64, u64, Vec<u8>)>,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.snapshot_index + self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`, or `None` if `index` is outside what we
    /// can answer for (beyond our log, or truncated below the snapshot).
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index < self.snapshot_index || index > self.last_log_index() {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        self.log.get(pos).map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        self.log.get(pos)
    }

    /// Last log index carrying `term`, searching only entries above the
    /// snapshot boundary (entries folded into a snapshot have no index of
    /// their own to report to a conflicting leader).
    fn last_index_with_term(&self, term: u64) -> Option<u64> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    fn to_persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            snapshot_index: self.snapshot_index,
            snapshot_term: self.snapshot_term,
        }
    }
}

enum Outbound {
    Append(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// One raft node. `peers[id]` is every node's raft-transport address,
/// including this node's own (at index `id`) — majority and index-map
/// bookkeeping is simplest when "self" is just another slot in the list.
pub struct Raft {
    id: usize,
    peers: Vec<String>,
    storage: Arc<dyn Storage>,
    state: Mutex<RaftState>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    apply_notify: Notify,
    replicate_notify: Notify,
    config: RaftConfig,
    /// Set once a storage write fails; background loops stop participating
    /// in the cluster rather than risk further divergence.
    poisoned: AtomicBool,
}

impl Raft {
    /// Load any persisted state and construct a node. Does not start any
    /// background task; call `run` on the returned `Arc` for that.
    pub fn new(
        peers: Vec<String>,
        id: usize,
        storage: Arc<dyn Storage>,
        config: RaftConfig,
    ) -> (Arc<Raft>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let persisted = storage.read_state();
        let ps: PersistentState = if persisted.is_empty() {
            PersistentState::new()
        } else {
            match bincode::deserialize(&persisted) {
                Ok(ps) => ps,
                Err(e) => {
                    error!("[{id}] failed to decode persisted raft state, starting fresh: {e}");
                    PersistentState::new()
                }
            }
        };

        let state = RaftState {
            current_term: ps.current_term,
            voted_for: ps.voted_for,
            log: ps.log,
            snapshot_index: ps.snapshot_index,
            snapshot_term: ps.snapshot_term,
            commit_index: ps.snapshot_index,
            last_applied: ps.snapshot_index,
            role: Role::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_snapshot: None,
        };

        info!(
            "[{id}] loaded raft state: term={} snapshot_index={} log_len={}",
            state.current_term,
            state.snapshot_index,
            state.log.len()
        );

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let raft = Arc::new(Raft {
            id,
            peers,
            storage,
            state: Mutex::new(state),
            apply_tx,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            config,
            poisoned: AtomicBool::new(false),
        });
        (raft, apply_rx)
    }

    /// Spawn the election timer, replication driver, and apply loop.
    pub async fn run(self: Arc<Self>) {
        let a = Arc::clone(&self);
        tokio::spawn(async move { a.run_election_timer().await });
        let b = Arc::clone(&self);
        tokio::spawn(async move { b.run_replication_driver().await });
        let c = Arc::clone(&self);
        tokio::spawn(async move { c.run_apply_loop().await });
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    /// Persist the durable fields only (no snapshot blob change).
    fn persist(&self, state: &RaftState) {
        let bytes = match bincode::serialize(&state.to_persistent()) {
            Ok(b) => b,
            Err(e) => {
                error!("[{}] failed to encode raft state: {e}", self.id);
                self.poisoned.store(true, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = self.storage.save(Some(&bytes), None) {
            error!("[{}] fatal: failed to persist raft state: {e}", self.id);
            self.poisoned.store(true, Ordering::Relaxed);
        }
    }

    /// Persist durable fields and the snapshot blob atomically.
    fn persist_with_snapshot(&self, state: &RaftState, snapshot: &[u8]) {
        let bytes = match bincode::serialize(&state.to_persistent()) {
            Ok(b) => b,
            Err(e) => {
                error!("[{}] failed to encode raft state: {e}", self.id);
                self.poisoned.store(true, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = self.storage.save(Some(&bytes), Some(snapshot)) {
            error!("[{}] fatal: failed to persist raft state+snapshot: {e}", self.id);
            self.poisoned.store(true, Ordering::Relaxed);
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let lo = self.config.election_timeout_min.as_millis() as u64;
        let hi = self.config.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(lo..=hi.max(lo));
        Duration::from_millis(ms)
    }

    /// Steps down to follower if `term` is newer than ours. Returns whether
    /// a step-down happened (the caller should treat the RPC/reply as stale
    /// if it already held different expectations about our role/term).
    fn maybe_step_down(state: &mut RaftState, term: u64) -> bool {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            state.role = Role::Follower;
            state.leader_id = None;
            true
        } else {
            false
        }
    }

    // --- Public API ---------------------------------------------------

    /// Append `command` to the log if we're the leader. Returns
    /// `(index, term, is_leader)`, matching the source protocol's
    /// `Start(cmd) → (index, term, isLeader)` signature.
    pub async fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        let mut state = self.state.lock().await;
        if state.role != Role::Leader {
            return (0, 0, false);
        }
        let index = state.last_log_index() + 1;
        let term = state.current_term;
        state.log.push(LogEntry { term, index, command });
        state.match_index.insert(self.id, index);
        self.persist(&state);
        // A single-node cluster has no peer replies to trigger this from;
        // recompute here so `start()` alone can advance `commit_index`.
        self.advance_commit_index(&mut state);
        drop(state);
        self.replicate_notify.notify_one();
        (index, term, true)
    }

    /// Discard log entries with index ≤ `index` and persist `data` as the
    /// new snapshot blob. Guarded per spec: `index` must already be
    /// committed and must strictly advance the snapshot.
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut state = self.state.lock().await;
        if index <= state.snapshot_index || index > state.commit_index {
            return;
        }
        let Some(term) = state.term_at(index) else {
            return;
        };
        let cut = (index - state.snapshot_index) as usize;
        state.log = state.log.split_off(cut);
        state.snapshot_index = index;
        state.snapshot_term = term;
        self.persist_with_snapshot(&state, &data);
    }

    pub fn read_snapshot(&self) -> Vec<u8> {
        self.storage.read_snapshot()
    }

    pub fn raft_state_size(&self) -> usize {
        self.storage.state_size()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn leader_id(&self) -> Option<usize> {
        self.state.lock().await.leader_id
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    pub async fn last_log_index(&self) -> u64 {
        self.state.lock().await.last_log_index()
    }

    // --- Peer RPC handlers ----------------------------------------------

    pub async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;
        if args.term < state.current_term {
            return RequestVoteReply { term: state.current_term, vote_granted: false };
        }
        Self::maybe_step_down(&mut state, args.term);

        let log_ok = args.last_log_term > state.last_log_term()
            || (args.last_log_term == state.last_log_term()
                && args.last_log_index >= state.last_log_index());

        let mut vote_granted = false;
        if log_ok && matches!(state.voted_for, None | Some(c) if c == args.candidate_id) {
            state.voted_for = Some(args.candidate_id);
            state.last_heartbeat = Instant::now();
            vote_granted = true;
            info!(
                "[{}] granted vote to {} for term {}",
                self.id, args.candidate_id, args.term
            );
        }
        self.persist(&state);
        RequestVoteReply { term: state.current_term, vote_granted }
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            };
        }
        Self::maybe_step_down(&mut state, args.term);
        state.role = Role::Follower;
        state.leader_id = Some(args.leader_id);
        state.last_heartbeat = Instant::now();

        let success;
        let mut conflict_index = 0u64;
        let mut conflict_term = 0u64;

        if args.prev_log_index < state.snapshot_index {
            success = true;
        } else if args.prev_log_index == state.snapshot_index {
            success = args.prev_log_term == state.snapshot_term;
            if !success {
                conflict_index = state.snapshot_index + 1;
            }
        } else {
            match state.term_at(args.prev_log_index) {
                None => {
                    success = false;
                    conflict_index = state.last_log_index() + 1;
                }
                Some(t) if t != args.prev_log_term => {
                    success = false;
                    conflict_term = t;
                    let mut idx = args.prev_log_index;
                    while idx > state.snapshot_index + 1 && state.term_at(idx - 1) == Some(t) {
                        idx -= 1;
                    }
                    conflict_index = idx;
                }
                Some(_) => {
                    success = true;
                }
            }
        }

        if success {
            let mut last_new_index = args.prev_log_index.max(state.snapshot_index);
            for entry in &args.entries {
                if entry.index <= state.snapshot_index {
                    continue;
                }
                let pos = (entry.index - state.snapshot_index - 1) as usize;
                if pos < state.log.len() {
                    if state.log[pos].term != entry.term {
                        state.log.truncate(pos);
                        state.log.push(entry.clone());
                    }
                } else {
                    state.log.push(entry.clone());
                }
                last_new_index = entry.index;
            }
            if args.leader_commit > state.commit_index {
                state.commit_index = args.leader_commit.min(last_new_index);
                self.apply_notify.notify_one();
            }
        }

        self.persist(&state);
        let term = state.current_term;
        AppendEntriesReply { term, success, conflict_index, conflict_term }
    }

    pub async fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut state = self.state.lock().await;
        if args.term < state.current_term {
            return InstallSnapshotReply { term: state.current_term };
        }
        Self::maybe_step_down(&mut state, args.term);
        state.role = Role::Follower;
        state.leader_id = Some(args.leader_id);
        state.last_heartbeat = Instant::now();

        if args.last_included_index > state.snapshot_index {
            let retain = state.term_at(args.last_included_index) == Some(args.last_included_term);
            if retain {
                let keep: Vec<LogEntry> = state
                    .log
                    .iter()
                    .filter(|e| e.index > args.last_included_index)
                    .cloned()
                    .collect();
                state.log = keep;
            } else {
                state.log.clear();
            }
            state.snapshot_index = args.last_included_index;
            state.snapshot_term = args.last_included_term;
            if state.commit_index < state.snapshot_index {
                state.commit_index = state.snapshot_index;
            }
            state.last_applied = state.snapshot_index;
            state.pending_snapshot =
                Some((args.last_included_index, args.last_included_term, args.data.clone()));
            self.persist_with_snapshot(&state, &args.data);
            self.apply_notify.notify_one();
        } else {
            self.persist(&state);
        }

        InstallSnapshotReply { term: state.current_term }
    }

    // --- Background tasks -------------------------------------------------

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            if self.is_poisoned() {
                return;
            }
            let timeout = self.random_election_timeout();
            tokio::time::sleep(timeout).await;
            let should_elect = {
                let state = self.state.lock().await;
                state.role != Role::Leader && state.last_heartbeat.elapsed() >= timeout
            };
            if should_elect {
                info!("[{}] election timeout, starting election", self.id);
                Arc::clone(&self).start_election().await;
            }
        }
    }

    async fn start_election(self: Arc<Self>) {
        let (current_term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id);
            state.votes_received.clear();
            state.votes_received.insert(self.id);
            state.last_heartbeat = Instant::now();
            self.persist(&state);
            (state.current_term, state.last_log_index(), state.last_log_term())
        };

        info!("[{}] starting election for term {current_term}", self.id);
        let majority = self.peers.len() / 2 + 1;
        if majority <= 1 {
            Arc::clone(&self).become_leader(current_term).await;
            return;
        }

        let mut handles = Vec::new();
        for (peer_id, addr) in self.peers.iter().enumerate() {
            if peer_id == self.id {
                continue;
            }
            let addr = addr.clone();
            let args = RequestVoteArgs {
                term: current_term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            };
            handles.push(tokio::spawn(async move {
                transport::call(&addr, RaftRpc::RequestVote(args)).await
            }));
        }

        let mut votes = 1usize;
        for handle in handles {
            let Ok(Ok(RaftRpcReply::RequestVote(reply))) = handle.await else {
                continue;
            };
            let mut state = self.state.lock().await;
            if Self::maybe_step_down(&mut state, reply.term) {
                self.persist(&state);
                return;
            }
            if state.role != Role::Candidate || state.current_term != current_term {
                return;
            }
            if reply.vote_granted {
                votes += 1;
                debug!("[{}] vote {votes}/{majority} in term {current_term}", self.id);
                if votes >= majority {
                    drop(state);
                    Arc::clone(&self).become_leader(current_term).await;
                    return;
                }
            }
        }
    }

    async fn become_leader(self: Arc<Self>, election_term: u64) {
        {
            let mut state = self.state.lock().await;
            if state.role != Role::Candidate || state.current_term != election_term {
                return; // stale: lost the race or already stepped down
            }
            state.role = Role::Leader;
            state.leader_id = Some(self.id);
            let last_index = state.last_log_index();
            for peer_id in 0..self.peers.len() {
                if peer_id == self.id {
                    continue;
                }
                state.next_index.insert(peer_id, last_index + 1);
                state.match_index.insert(peer_id, 0);
            }
            state.match_index.insert(self.id, last_index);
            info!("[{}] became leader for term {election_term}", self.id);
        }
        self.replicate_notify.notify_one();
    }

    async fn run_replication_driver(self: Arc<Self>) {
        loop {
            if self.is_poisoned() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = self.replicate_notify.notified() => {}
            }
            let is_leader = self.state.lock().await.role == Role::Leader;
            if is_leader {
                Arc::clone(&self).replicate_to_all().await;
            }
        }
    }

    async fn replicate_to_all(self: Arc<Self>) {
        let mut handles = Vec::new();
        for peer_id in 0..self.peers.len() {
            if peer_id == self.id {
                continue;
            }
            let raft = Arc::clone(&self);
            handles.push(tokio::spawn(async move { raft.replicate_to_peer(peer_id).await }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    async fn replicate_to_peer(&self, peer_id: usize) {
        let (term, outbound) = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            let current_term = state.current_term;
            let next_index = *state
                .next_index
                .get(&peer_id)
                .unwrap_or(&(state.last_log_index() + 1));

            if next_index <= state.snapshot_index {
                let args = InstallSnapshotArgs {
                    term: current_term,
                    leader_id: self.id,
                    last_included_index: state.snapshot_index,
                    last_included_term: state.snapshot_term,
                    data: self.storage.read_snapshot(),
                };
                (current_term, Outbound::InstallSnapshot(args))
            } else {
                let prev_log_index = next_index - 1;
                let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
                let entries: Vec<LogEntry> =
                    state.log.iter().filter(|e| e.index >= next_index).cloned().collect();
                let args = AppendEntriesArgs {
                    term: current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: state.commit_index,
                };
                (current_term, Outbound::Append(args))
            }
        };

        let addr = self.peers[peer_id].clone();
        match outbound {
            Outbound::Append(args) => {
                let sent_prev = args.prev_log_index;
                let sent_len = args.entries.len() as u64;
                let result = transport::call(&addr, RaftRpc::AppendEntries(args)).await;
                let Ok(RaftRpcReply::AppendEntries(reply)) = result else {
                    return;
                };
                let mut state = self.state.lock().await;
                if Self::maybe_step_down(&mut state, reply.term) {
                    self.persist(&state);
                    return;
                }
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
                if reply.success {
                    let new_match = sent_prev + sent_len;
                    let cur = state.match_index.get(&peer_id).copied().unwrap_or(0);
                    if new_match > cur {
                        state.match_index.insert(peer_id, new_match);
                        state.next_index.insert(peer_id, new_match + 1);
                        self.advance_commit_index(&mut state);
                    }
                } else {
                    let cur = state.next_index.get(&peer_id).copied().unwrap_or(1);
                    let suggested = if reply.conflict_term != 0 {
                        match state.last_index_with_term(reply.conflict_term) {
                            Some(idx) => idx + 1,
                            None => reply.conflict_index,
                        }
                    } else {
                        reply.conflict_index
                    };
                    let new_next = suggested.max(1);
                    if new_next < cur {
                        state.next_index.insert(peer_id, new_next);
                    }
                }
            }
            Outbound::InstallSnapshot(args) => {
                let last_included_index = args.last_included_index;
                let result = transport::call(&addr, RaftRpc::InstallSnapshot(args)).await;
                let Ok(RaftRpcReply::InstallSnapshot(reply)) = result else {
                    return;
                };
                let mut state = self.state.lock().await;
                if Self::maybe_step_down(&mut state, reply.term) {
                    self.persist(&state);
                    return;
                }
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
                let cur = state.match_index.get(&peer_id).copied().unwrap_or(0);
                if last_included_index > cur {
                    state.match_index.insert(peer_id, last_included_index);
                    state.next_index.insert(peer_id, last_included_index + 1);
                    self.advance_commit_index(&mut state);
                }
            }
        }
    }

    /// Raft §5.4.2: a leader may only commit by counting replicas for
    /// entries from its own term; earlier-term entries ride along once a
    /// current-term entry past them reaches majority.
    fn advance_commit_index(&self, state: &mut RaftState) {
        let majority = self.peers.len() / 2 + 1;
        let last_index = state.last_log_index();
        let mut candidate = state.commit_index;
        let mut n = state.commit_index + 1;
        while n <= last_index {
            // `match_index` already carries an entry for `self.id` (seeded
            // in `become_leader`, updated in `start()`), so counting it
            // again here would double-count the leader's own copy.
            let count = state.match_index.values().filter(|&&m| m >= n).count();
            if count < majority {
                break;
            }
            if state.term_at(n) == Some(state.current_term) {
                candidate = n;
            }
            n += 1;
        }
        if candidate > state.commit_index {
            state.commit_index = candidate;
            info!("[{}] commit index advanced to {candidate}", self.id);
            self.apply_notify.notify_one();
        }
    }

    async fn run_apply_loop(self: Arc<Self>) {
        loop {
            if self.is_poisoned() {
                return;
            }
            let to_send = {
                let mut state = self.state.lock().await;
                if let Some((index, term, data)) = state.pending_snapshot.take() {
                    Some(ApplyMsg::Snapshot { index, term, data })
                } else if state.last_applied < state.commit_index {
                    let next = state.last_applied + 1;
                    let msg = state.entry_at(next).map(|e| ApplyMsg::Command {
                        index: e.index,
                        term: e.term,
                        command: e.command.clone(),
                    });
                    state.last_applied = next;
                    msg
                } else {
                    None
                }
            };
            match to_send {
                Some(msg) => {
                    if self.apply_tx.send(msg).is_err() {
                        return;
                    }
                }
                None => self.apply_notify.notified().await,
            }
        }
    }
}
