//! Client-facing RPC transport: same length-prefixed `bincode` framing as
//! the peer transport, on a separate TCP port (mirroring the source
//! repository's raft-port/app-port split via `RAFT_PORT_OFFSET`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::KvError;

use super::server::KvServer;

pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum KvRpc {
    Put { key: String, value: String, client_id: u64, request_id: u64 },
    Get { key: String, client_id: u64, request_id: u64 },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum KvRpcReply {
    Put(Result<(), KvError>),
    Get(Result<String, KvError>),
}

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
pub async fn call(addr: &str, rpc: KvRpc) -> Result<KvRpcReply> {
    tokio::time::timeout(RPC_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &rpc).await?;
        read_frame(&mut stream).await
    })
    .await
    .map_err(|_| anyhow!("kv rpc to {addr} timed out"))?
}

/// Bind `addr` and serve `Put`/`Get` against `kv` until the process exits.
pub async fn serve(addr: &str, kv: Arc<KvServer>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!("kv transport listening on {addr}");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("kv transport accept failed: {e}");
                continue;
            }
        };
        let kv = Arc::clone(&kv);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, kv).await {
                debug!("kv transport connection from {peer} failed: {e}");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, kv: Arc<KvServer>) -> Result<()> {
    let rpc: KvRpc = read_frame(&mut stream).await?;
    let reply = match rpc {
        KvRpc::Put { key, value, client_id, request_id } => {
            KvRpcReply::Put(kv.put(key, value, client_id, request_id).await)
        }
        KvRpc::Get { key, client_id, request_id } => {
            KvRpcReply::Get(kv.get(key, client_id, request_id).await)
        }
    };
    write_frame(&mut stream, &reply).await
}
