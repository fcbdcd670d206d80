//! RESP2 client for the shared set store.
//!
//! One `RespQueueStore` owns one TCP connection. Commands are sent one at a
//! time and each reply is awaited before the next command goes out, so a
//! worker's store operations are observed by the server in program order.
//! A send or receive that fails or times out leaves the reply stream out of
//! step with the commands, so the connection refuses every later command.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::config::QueueStoreLogin;
use crate::dispatcher::Connect;
use crate::error::{GrabError, Result};
use crate::queue_store::QueueStore;

const STORE_NAME: &str = "redis";

pub struct RespQueueStore {
    conn: Framed<TcpStream, Resp2>,
    addr: String,
    op_timeout: Duration,
    broken: Option<String>,
}

impl RespQueueStore {
    /// Connect, authenticate, select the logical database and ping.
    ///
    /// Any failure here is a connection error rather than a store error.
    pub async fn connect(login: &QueueStoreLogin, op_timeout: Duration) -> Result<Self> {
        let socket = match time::timeout(op_timeout, TcpStream::connect(login.addr.as_str())).await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                return Err(GrabError::connection(
                    STORE_NAME,
                    format!("connect to {}: {err}", login.addr),
                ))
            }
            Err(_) => {
                return Err(GrabError::connection(
                    STORE_NAME,
                    format!("connect to {} timed out", login.addr),
                ))
            }
        };
        socket.set_nodelay(true).ok();

        let mut store = Self {
            conn: Framed::new(socket, Resp2::default()),
            addr: login.addr.clone(),
            op_timeout,
            broken: None,
        };
        store
            .handshake(login)
            .await
            .map_err(|err| GrabError::connection(STORE_NAME, err))?;
        Ok(store)
    }

    async fn handshake(&mut self, login: &QueueStoreLogin) -> Result<()> {
        if !login.password.is_empty() {
            let reply = self.request(&[b"AUTH", login.password.as_bytes()]).await?;
            expect_ok("AUTH", reply)?;
        }
        if login.db != 0 {
            let db = login.db.to_string();
            let reply = self.request(&[b"SELECT", db.as_bytes()]).await?;
            expect_ok("SELECT", reply)?;
        }
        self.ping().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.request(&[b"PING"]).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&mut self, parts: &[&[u8]]) -> Result<BytesFrame> {
        let name = String::from_utf8_lossy(parts.first().copied().unwrap_or_default()).to_string();
        if let Some(reason) = &self.broken {
            return Err(GrabError::Store(format!(
                "{name}: connection to {} is unusable after an earlier failure: {reason}",
                self.addr
            )));
        }

        match time::timeout(self.op_timeout, self.conn.send(make_command(parts))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let message = format!("{name} send to {} failed: {err}", self.addr);
                return Err(self.poison(message));
            }
            Err(_) => {
                let message = format!("{name} send to {} timed out", self.addr);
                return Err(self.poison(message));
            }
        }

        match time::timeout(self.op_timeout, self.conn.next()).await {
            Ok(Some(Ok(BytesFrame::Error(err)))) => {
                Err(GrabError::Store(format!("{name} rejected: {err}")))
            }
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(err))) => {
                let message = format!("{name} recv from {} failed: {err}", self.addr);
                Err(self.poison(message))
            }
            Ok(None) => {
                let message = format!("{name}: connection to {} closed", self.addr);
                Err(self.poison(message))
            }
            Err(_) => {
                let message = format!("{name} recv from {} timed out", self.addr);
                Err(self.poison(message))
            }
        }
    }

    /// Mark the connection unusable; a reply may still be in flight.
    fn poison(&mut self, message: String) -> GrabError {
        tracing::warn!(addr = %self.addr, error = %message, "queue store connection poisoned");
        self.broken = Some(message.clone());
        GrabError::Store(message)
    }
}

#[async_trait]
impl QueueStore for RespQueueStore {
    async fn pop_member(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.request(&[b"SPOP", key.as_bytes()]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(bytes) => Ok(Some(bytes.to_vec())),
            other => Err(unexpected("SPOP", &other)),
        }
    }

    async fn cardinality(&mut self, key: &str) -> Result<u64> {
        match self.request(&[b"SCARD", key.as_bytes()]).await? {
            BytesFrame::Integer(n) => Ok(n.max(0) as u64),
            other => Err(unexpected("SCARD", &other)),
        }
    }

    async fn add_member(&mut self, key: &str, member: &[u8]) -> Result<()> {
        match self.request(&[b"SADD", key.as_bytes(), member]).await? {
            BytesFrame::Integer(_) => Ok(()),
            other => Err(unexpected("SADD", &other)),
        }
    }

    async fn delete_key(&mut self, key: &str) -> Result<()> {
        match self.request(&[b"DEL", key.as_bytes()]).await? {
            BytesFrame::Integer(_) => Ok(()),
            other => Err(unexpected("DEL", &other)),
        }
    }

    async fn set_value(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let reply = self.request(&[b"SET", key.as_bytes(), value]).await?;
        expect_ok("SET", reply)
    }

    fn is_healthy(&self) -> bool {
        self.broken.is_none()
    }
}

/// Opens one `RespQueueStore` per worker.
#[derive(Debug, Clone)]
pub struct RespConnector {
    login: QueueStoreLogin,
    op_timeout: Duration,
}

impl RespConnector {
    pub fn new(login: QueueStoreLogin, op_timeout: Duration) -> Self {
        Self { login, op_timeout }
    }
}

#[async_trait]
impl Connect for RespConnector {
    type Conn = RespQueueStore;

    async fn connect(&self, worker: usize) -> Result<RespQueueStore> {
        let store = RespQueueStore::connect(&self.login, self.op_timeout).await?;
        tracing::debug!(worker, addr = %self.login.addr, db = self.login.db, "connected to queue store");
        Ok(store)
    }
}

/// Build a RESP command array out of raw arguments.
pub(crate) fn make_command(parts: &[&[u8]]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part)))
            .collect(),
    )
}

fn expect_ok(command: &str, reply: BytesFrame) -> Result<()> {
    match reply {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, frame: &BytesFrame) -> GrabError {
    GrabError::Store(format!("unexpected {command} response: {frame:?}"))
}
