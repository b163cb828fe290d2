//! Protocol-level errors returned to KV clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The small, closed set of outcomes a `Put`/`Get` can report besides success.
///
/// Mirrors the `{"OK","ErrNoKey","ErrWrongLeader","ErrTimeout"}` string tags
/// of the source protocol, but as a typed enum instead of bare strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum KvError {
    /// The key has no value in the store (only returned for `Get`).
    #[error("no such key")]
    NoKey,
    /// This node is not the raft leader; the client should try another peer.
    #[error("not the leader")]
    WrongLeader,
    /// No result arrived before the client-facing wait interval elapsed.
    #[error("request timed out")]
    Timeout,
    /// The log entry decoded to something other than a valid `Op`.
    ///
    /// Never expected in correct operation; exists so a waiter blocked on a
    /// corrupt entry resolves instead of hanging for the full timeout.
    #[error("corrupt log entry")]
    Corrupt,
}
