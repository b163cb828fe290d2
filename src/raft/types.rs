//! Wire and on-disk types for the raft module: log entries, RPC argument/reply
//! shapes, the persistent-state envelope, and the apply-stream message.

use serde::{Deserialize, Serialize};

/// One entry in the replicated log. `index` is carried explicitly (rather
/// than implied by position) because snapshotting truncates the log prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Everything that must be durable before replying to an RPC or returning
/// from `Start`/`Snapshot`/`InstallSnapshot`. Encoded whole with `bincode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<usize>,
    /// Only entries with `index > snapshot_index` are kept here.
    pub log: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

impl PersistentState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
        }
    }
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

/// What the snapshot blob itself contains is opaque to raft; this struct is
/// only here so `Snapshot::new`/install know the shape of the *metadata*
/// raft itself tracks about the most recent snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Conflict hints used by the leader to jump `nextIndex` back further
    /// than one step per round trip.
    pub conflict_index: u64,
    pub conflict_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: usize,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// A committed entry delivered to the state machine, in strictly increasing
/// `index` order. Delivered over an unbounded `mpsc` channel, one producer
/// (the raft apply task), one consumer (the KV applier).
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command { index: u64, term: u64, command: Vec<u8> },
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}
