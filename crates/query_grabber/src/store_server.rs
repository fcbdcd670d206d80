//! Minimal RESP2 set-store server over a `MemorySetStore`.
//!
//! Understands the handful of commands the grabber and its helpers issue
//! (PING, AUTH, SELECT, SPOP, SCARD, SADD, SMEMBERS, DEL, SET, GET). There is
//! one keyspace: SELECT and AUTH are accepted and ignored.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::memory::MemorySetStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Ping,
    Auth,
    Select,
    SPop { key: String },
    SCard { key: String },
    SAdd { key: String, members: Vec<Vec<u8>> },
    SMembers { key: String },
    Del { keys: Vec<String> },
    Set { key: String, value: Vec<u8> },
    Get { key: String },
}

/// Bind `addr` and serve until the task is dropped.
pub async fn run(addr: SocketAddr, store: MemorySetStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "set store listening");
    serve(listener, store).await
}

pub async fn serve(listener: TcpListener, store: MemorySetStore) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, store).await {
                tracing::debug!(%peer, error = ?err, "set store connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, store: MemorySetStore) -> anyhow::Result<()> {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, Resp2::default());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let resp = match parse_command(frame) {
            Ok(Some(op)) => apply(&store, op),
            Ok(None) => continue,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(resp).await?;
    }
    Ok(())
}

/// Execute one command against the store and build its reply.
pub fn apply(store: &MemorySetStore, op: StoreOp) -> BytesFrame {
    match op {
        StoreOp::Ping => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        StoreOp::Auth | StoreOp::Select => BytesFrame::SimpleString(Bytes::from_static(b"OK")),
        StoreOp::SPop { key } => match store.spop(&key) {
            Some(member) => BytesFrame::BulkString(Bytes::from(member)),
            None => BytesFrame::Null,
        },
        StoreOp::SCard { key } => BytesFrame::Integer(store.scard(&key) as i64),
        StoreOp::SAdd { key, members } => {
            let added = members
                .iter()
                .filter(|member| store.sadd(&key, member))
                .count();
            BytesFrame::Integer(added as i64)
        }
        StoreOp::SMembers { key } => BytesFrame::Array(
            store
                .smembers(&key)
                .into_iter()
                .map(|member| BytesFrame::BulkString(Bytes::from(member)))
                .collect(),
        ),
        StoreOp::Del { keys } => {
            let removed: u64 = keys.iter().map(|key| store.del(key)).sum();
            BytesFrame::Integer(removed as i64)
        }
        StoreOp::Set { key, value } => {
            store.set(&key, &value);
            BytesFrame::SimpleString(Bytes::from_static(b"OK"))
        }
        StoreOp::Get { key } => match store.get(&key) {
            Some(value) => BytesFrame::BulkString(Bytes::from(value)),
            None => BytesFrame::Null,
        },
    }
}

pub fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<StoreOp>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };

    if parts.is_empty() {
        return Ok(None);
    }

    let cmd = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    let args = &parts[1..];
    match cmd.as_str() {
        "PING" => Ok(Some(StoreOp::Ping)),
        "AUTH" => {
            anyhow::ensure!(!args.is_empty(), "AUTH expects a password");
            Ok(Some(StoreOp::Auth))
        }
        "SELECT" => {
            anyhow::ensure!(args.len() == 1, "SELECT expects 1 argument");
            let db = frame_string(&args[0]).ok_or_else(|| anyhow::anyhow!("invalid db"))?;
            anyhow::ensure!(db.parse::<u32>().is_ok(), "invalid DB index");
            Ok(Some(StoreOp::Select))
        }
        "SPOP" => {
            anyhow::ensure!(args.len() == 1, "SPOP expects 1 argument");
            Ok(Some(StoreOp::SPop { key: key_arg(&args[0])? }))
        }
        "SCARD" => {
            anyhow::ensure!(args.len() == 1, "SCARD expects 1 argument");
            Ok(Some(StoreOp::SCard { key: key_arg(&args[0])? }))
        }
        "SADD" => {
            anyhow::ensure!(args.len() >= 2, "SADD expects at least 2 arguments");
            let key = key_arg(&args[0])?;
            let members = args[1..]
                .iter()
                .map(|frame| frame_bytes(frame).ok_or_else(|| anyhow::anyhow!("invalid member")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Some(StoreOp::SAdd { key, members }))
        }
        "SMEMBERS" => {
            anyhow::ensure!(args.len() == 1, "SMEMBERS expects 1 argument");
            Ok(Some(StoreOp::SMembers { key: key_arg(&args[0])? }))
        }
        "DEL" => {
            anyhow::ensure!(!args.is_empty(), "DEL expects at least 1 argument");
            let keys = args.iter().map(key_arg).collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Some(StoreOp::Del { keys }))
        }
        "SET" => {
            anyhow::ensure!(args.len() == 2, "SET expects 2 arguments");
            let key = key_arg(&args[0])?;
            let value = frame_bytes(&args[1]).ok_or_else(|| anyhow::anyhow!("invalid value"))?;
            Ok(Some(StoreOp::Set { key, value }))
        }
        "GET" => {
            anyhow::ensure!(args.len() == 1, "GET expects 1 argument");
            Ok(Some(StoreOp::Get { key: key_arg(&args[0])? }))
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn key_arg(frame: &BytesFrame) -> anyhow::Result<String> {
    frame_string(frame).ok_or_else(|| anyhow::anyhow!("invalid key"))
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_string(frame: &BytesFrame) -> Option<String> {
    frame_bytes(frame).and_then(|bytes| String::from_utf8(bytes).ok())
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}
