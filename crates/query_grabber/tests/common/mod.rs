//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use query_grabber::store_server::{parse_command, StoreOp};
use query_grabber::{encode_job, MemorySetStore, QueryJob, ResultRow};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Build `n` distinct rows whose work ids start with `prefix`.
pub fn rows(prefix: &str, n: usize) -> Vec<ResultRow> {
    (0..n)
        .map(|i| ResultRow {
            work_id: format!("{prefix}_w{i:04}"),
            table_index: i as i64,
            level_1: "1".into(),
            level_0: i.to_string(),
            accented: format!("line {i} of {prefix}"),
            stripped: format!("line {i} of {prefix}"),
            ..ResultRow::default()
        })
        .collect()
}

/// A job whose query text doubles as its script key in `ScriptedExecutor`.
pub fn job(query: &str) -> QueryJob {
    QueryJob::new("", query, "ανδρ")
}

pub fn push_jobs(store: &MemorySetStore, key: &str, jobs: &[QueryJob]) {
    for job in jobs {
        store.sadd(key, &encode_job(job).expect("encode job"));
    }
}

/// Start the bundled RESP set-store server on an ephemeral port.
pub async fn spawn_store_server(store: MemorySetStore) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind set store");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = query_grabber::store_server::serve(listener, store).await;
    });
    addr
}

/// Start a RESP server that answers PING at once, delays every SET reply by
/// `set_delay` and hands out `job` to each SPOP.
pub async fn spawn_slow_set_server(set_delay: Duration, job: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind slow server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, Resp2::default());
                while let Some(Ok(frame)) = framed.next().await {
                    let reply = match parse_command(frame) {
                        Ok(Some(StoreOp::Set { .. })) => {
                            tokio::time::sleep(set_delay).await;
                            BytesFrame::SimpleString(Bytes::from_static(b"OK"))
                        }
                        Ok(Some(StoreOp::SPop { .. })) => {
                            BytesFrame::BulkString(Bytes::from_static(job))
                        }
                        Ok(Some(StoreOp::SCard { .. })) => BytesFrame::Integer(1),
                        Ok(Some(_)) => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
                        _ => break,
                    };
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}
