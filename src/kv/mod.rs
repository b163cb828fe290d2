//! The linearizable key/value state machine built on the raft log.

pub mod op;
pub mod server;
pub mod transport;

pub use op::{KvSnapshot, Op, OpType};
pub use server::KvServer;
pub use transport::{KvRpc, KvRpcReply};
