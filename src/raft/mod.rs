//! A from-scratch raft consensus implementation: leader election, log
//! replication with conflict-index backtracking, and snapshot install/catch-up.

pub mod node;
pub mod transport;
pub mod types;

pub use node::{Raft, RaftConfig};
pub use transport::{RaftRpc, RaftRpcReply, RPC_TIMEOUT};
pub use types::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    LogEntry, PersistentState, RequestVoteArgs, RequestVoteReply, Role,
};
