//! Peer-to-peer RPC transport: length-prefixed `bincode` frames over TCP.
//!
//! Grounded on the source repository's `send_raft_message` /
//! `handle_raft_message` pair (`tokio::net::TcpStream`, a `u32` length
//! prefix, then a serialized body), generalized from its two-variant
//! `RaftMessage` enum to the full three-RPC raft peer protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::node::Raft;
use super::types::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// Tag union of the three peer RPC requests, dispatched over one TCP port.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RaftRpc {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
}

/// Round-trip time budget for a single peer RPC; a follower that doesn't
/// answer within this window is treated the same as one that is down.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(1000);

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Dial `addr`, send `rpc`, and wait for a reply, bounded by `RPC_TIMEOUT`.
pub async fn call(addr: &str, rpc: RaftRpc) -> Result<RaftRpcReply> {
    tokio::time::timeout(RPC_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &rpc).await?;
        read_frame(&mut stream).await
    })
    .await
    .map_err(|_| anyhow!("rpc to {addr} timed out"))?
}

/// Bind `addr` and serve raft peer RPCs against `raft` until the process
/// exits. One task per connection, matching the source repository's
/// `start_raft_listener`/`handle_raft_message` accept loop.
pub async fn serve(addr: &str, raft: Arc<Raft>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!("raft transport listening on {addr}");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("raft transport accept failed: {e}");
                continue;
            }
        };
        let raft = Arc::clone(&raft);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, raft).await {
                debug!("raft transport connection from {peer} failed: {e}");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, raft: Arc<Raft>) -> Result<()> {
    let rpc: RaftRpc = read_frame(&mut stream).await?;
    let reply = match rpc {
        RaftRpc::RequestVote(args) => RaftRpcReply::RequestVote(raft.request_vote(args).await),
        RaftRpc::AppendEntries(args) => {
            RaftRpcReply::AppendEntries(raft.append_entries(args).await)
        }
        RaftRpc::InstallSnapshot(args) => {
            RaftRpcReply::InstallSnapshot(raft.install_snapshot(args).await)
        }
    };
    write_frame(&mut stream, &reply).await
}
