//! The command schema carried as opaque bytes on the raft log.
//!
//! Grounded on `original_source/kvraft/server.go`'s `Op`/`OpType`, with the
//! `gob` encoding replaced by `bincode` (raft itself never inspects this
//! schema; it only ever sees `Vec<u8>`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Put,
    Get,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub op_type: OpType,
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub request_id: u64,
}

impl Op {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Op always encodes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Op, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// What the snapshot blob holds: the whole state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvSnapshot {
    pub db: std::collections::HashMap<String, String>,
    pub last_applied: std::collections::HashMap<u64, u64>,
}
