//! Fan-out/fan-in coordination for one batch.
//!
//! The dispatcher never touches either store. It opens nothing itself, it
//! only hands each worker task the connectors so the worker can open its
//! own dedicated connections, then waits for all of them.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;

use crate::config::BatchConfig;
use crate::error::{GrabError, Result};
use crate::executor::QueryExecutor;
use crate::queue_store::QueueStore;
use crate::worker::{SkippedJob, Worker, WorkerReport};

/// Opens one connection for one worker.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self, worker: usize) -> Result<Self::Conn>;
}

/// What a finished batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Key of the result set left in the queue store.
    pub result_key: String,
    /// One entry per worker, ordered by worker ordinal.
    pub workers: Vec<WorkerReport>,
}

impl BatchReport {
    pub fn jobs_claimed(&self) -> u64 {
        self.workers.iter().map(|w| w.jobs_claimed).sum()
    }

    pub fn rows_added(&self) -> u64 {
        self.workers.iter().map(|w| w.rows_added).sum()
    }

    /// True when at least one worker saw the result count reach the cap.
    pub fn cap_reached(&self) -> bool {
        self.workers.iter().any(|w| w.cap_reached)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedJob> {
        self.workers.iter().flat_map(|w| w.skipped.iter())
    }
}

/// Run `config.workers` workers against `config.search_key` until every one
/// of them has drained the queue.
///
/// The first worker error aborts the remaining workers and is returned.
/// Rows already stored stay in the result set.
pub async fn run_batch<QC, EC>(config: BatchConfig, queues: QC, executors: EC) -> Result<BatchReport>
where
    QC: Connect,
    QC::Conn: QueueStore,
    EC: Connect,
    EC::Conn: QueryExecutor,
{
    config.validate()?;
    let started = Instant::now();
    let config = Arc::new(config);
    let queues = Arc::new(queues);
    let executors = Arc::new(executors);

    tracing::info!(
        search_key = %config.search_key,
        hit_cap = config.hit_cap,
        workers = config.workers,
        policy = ?config.failure_policy,
        "dispatching batch"
    );

    let mut handles = Vec::with_capacity(config.workers);
    for worker in 0..config.workers {
        let config = config.clone();
        let queues = queues.clone();
        let executors = executors.clone();
        handles.push(tokio::spawn(async move {
            let queue = queues.connect(worker).await?;
            let executor = executors.connect(worker).await?;
            Worker::new(worker, config, queue, executor).run().await
        }));
    }

    let aborts = handles
        .iter()
        .map(|handle| handle.abort_handle())
        .collect::<Vec<_>>();
    let mut running = handles
        .into_iter()
        .enumerate()
        .map(|(worker, handle)| handle.map(move |joined| (worker, joined)))
        .collect::<FuturesUnordered<_>>();

    let mut reports = Vec::with_capacity(config.workers);
    while let Some((worker, joined)) = running.next().await {
        let failure = match joined {
            Ok(Ok(report)) => {
                reports.push(report);
                continue;
            }
            Ok(Err(err)) => err,
            Err(join_err) => GrabError::WorkerPanicked {
                worker,
                message: join_err.to_string(),
            },
        };
        tracing::error!(
            worker,
            search_key = %config.search_key,
            error = %failure,
            "worker failed, aborting batch"
        );
        for abort in &aborts {
            abort.abort();
        }
        return Err(failure);
    }

    reports.sort_by_key(|report| report.worker);
    let report = BatchReport {
        result_key: config.result_key(),
        workers: reports,
    };
    tracing::info!(
        result_key = %report.result_key,
        jobs = report.jobs_claimed(),
        rows = report.rows_added(),
        cap_reached = report.cap_reached(),
        skipped = report.skipped().count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch complete"
    );
    Ok(report)
}
