//! The RESP2 adapter against the bundled set-store server.

mod common;

use std::time::Duration;

use anyhow::Result;
use query_grabber::{
    run_batch, transfer, BatchConfig, FailurePolicy, GrabError, MemorySetStore, QueueStore,
    QueueStoreLogin, RespConnector, RespQueueStore, ScriptedExecutor,
};

use common::{job, push_jobs, rows, spawn_slow_set_server, spawn_store_server};

const OP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_operations_round_trip() -> Result<()> {
    let backing = MemorySetStore::new();
    let addr = spawn_store_server(backing.clone()).await;
    let login = QueueStoreLogin::new(addr.to_string(), "secret", 9);
    let mut store = RespQueueStore::connect(&login, OP_TIMEOUT).await?;

    store.add_member("q", b"job-1").await?;
    store.add_member("q", b"job-2").await?;
    store.add_member("q", b"job-2").await?;
    assert_eq!(store.cardinality("q").await?, 2);
    assert_eq!(store.cardinality("absent").await?, 0);

    let first = store.pop_member("q").await?.expect("first member");
    let second = store.pop_member("q").await?.expect("second member");
    assert_ne!(first, second);
    assert_eq!(store.pop_member("q").await?, None);

    store.add_member("q", b"job-3").await?;
    store.delete_key("q").await?;
    store.delete_key("q").await?;
    assert!(!backing.exists("q"));

    store.set_value("q_hitcount", b"12").await?;
    assert_eq!(backing.get("q_hitcount"), Some(b"12".to_vec()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_over_the_wire_respects_best_effort_cap() -> Result<()> {
    let backing = MemorySetStore::new();
    push_jobs(&backing, "wire", &[job("SELECT a"), job("SELECT b"), job("SELECT c")]);
    let addr = spawn_store_server(backing.clone()).await;

    let exec = ScriptedExecutor::builder()
        .rows("SELECT a", rows("a", 100))
        .rows("SELECT b", rows("b", 100))
        .rows("SELECT c", rows("c", 100))
        .build();
    let connector = RespConnector::new(QueueStoreLogin::new(addr.to_string(), "", 0), OP_TIMEOUT);

    let report = run_batch(BatchConfig::new("wire", 200, 2), connector, exec).await?;

    assert_eq!(report.result_key, "wire_results");
    let n = backing.scard("wire_results");
    assert!((200..=299).contains(&n), "result count {n}");
    assert!(!backing.exists("wire"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_and_collect_through_the_server() -> Result<()> {
    let backing = MemorySetStore::new();
    let addr = spawn_store_server(backing.clone()).await;
    let login = QueueStoreLogin::new(addr.to_string(), "", 0);
    let mut store = RespQueueStore::connect(&login, OP_TIMEOUT).await?;

    transfer::submit_jobs(&mut store, "c", &[job("SELECT a"), job("SELECT b")], false).await?;
    assert_eq!(backing.scard("c"), 2);

    let exec = ScriptedExecutor::builder()
        .rows("SELECT a", rows("a", 2))
        .rows("SELECT b", rows("b", 3))
        .build();
    let report = run_batch(
        BatchConfig::new("c", 100, 2),
        RespConnector::new(login, OP_TIMEOUT),
        exec,
    )
    .await?;

    let collected = transfer::drain_results(&mut store, &report.result_key).await?;
    assert_eq!(collected.len(), 5);
    assert!(!backing.exists("c_results"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_store_fails_with_connection_error() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let connector = RespConnector::new(QueueStoreLogin::new(addr.to_string(), "", 0), OP_TIMEOUT);
    let err = run_batch(BatchConfig::new("q", 10, 2), connector, ScriptedExecutor::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GrabError::Connection { .. }), "{err}");
    Ok(())
}

const QUEUED_JOB: &[u8] = br#"{"TempTable":"","PsqlQuery":"SELECT a","PsqlData":"x"}"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_reply_is_never_read_as_the_next_answer() -> Result<()> {
    let addr = spawn_slow_set_server(Duration::from_millis(400), QUEUED_JOB).await;
    let login = QueueStoreLogin::new(addr.to_string(), "", 0);
    let mut store = RespQueueStore::connect(&login, Duration::from_millis(100)).await?;

    let err = store.set_value("q_hitcount", b"1").await.unwrap_err();
    assert!(matches!(err, GrabError::Store(_)), "{err}");
    assert!(!store.is_healthy());

    // Let the delayed +OK reach the client socket.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let popped = store.pop_member("q").await;
    assert!(
        matches!(popped, Err(GrabError::Store(_))),
        "stale reply handed out as a job: {popped:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_timeout_fails_batch_even_when_skipping_jobs() -> Result<()> {
    let addr = spawn_slow_set_server(Duration::from_millis(400), QUEUED_JOB).await;
    let connector = RespConnector::new(
        QueueStoreLogin::new(addr.to_string(), "", 0),
        Duration::from_millis(100),
    );
    let exec = ScriptedExecutor::builder().rows("SELECT a", rows("a", 2)).build();
    let config = BatchConfig::new("q", 10, 1)
        .with_failure_policy(FailurePolicy::SkipFailedJob)
        .with_progress(true);

    let err = run_batch(config, connector, exec).await.unwrap_err();
    assert!(matches!(err, GrabError::Store(_)), "{err}");
    Ok(())
}
