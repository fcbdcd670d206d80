//! The claim-execute-cap loop run by every worker.
//!
//! Workers never talk to each other. A worker that reads a result count at
//! or above the cap deletes the job queue; every worker then finds the queue
//! empty on its next pop and drains. The count read and the following add
//! are separate store calls, so several workers can add past the cap before
//! the delete lands. The cap is a target, not a hard limit.

use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;

use crate::codec::{decode_job, encode_row};
use crate::config::{BatchConfig, FailurePolicy};
use crate::error::{GrabError, Result};
use crate::executor::QueryExecutor;
use crate::progress::ProgressPoll;
use crate::queue_store::QueueStore;

const JOB_DESCRIPTION_MAX: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ClaimingJob,
    DecodingJob,
    RunningSetup,
    ExecutingQuery,
    ConsumingRows,
    Drained,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::ClaimingJob => "claiming_job",
            WorkerState::DecodingJob => "decoding_job",
            WorkerState::RunningSetup => "running_setup",
            WorkerState::ExecutingQuery => "executing_query",
            WorkerState::ConsumingRows => "consuming_rows",
            WorkerState::Drained => "drained",
        };
        f.write_str(name)
    }
}

/// Outcome of one claimed job.
#[derive(Debug)]
pub enum JobOutcome {
    Success { rows_added: u64, cap_reached: bool },
    Skipped { reason: String },
    Fatal(GrabError),
}

/// A job that failed and was passed over under `FailurePolicy::SkipFailedJob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedJob {
    pub worker: usize,
    /// Query text of the job, or a short note when the payload did not decode.
    pub job: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub rows_added: u64,
    pub cap_reached: bool,
    pub skipped: Vec<SkippedJob>,
}

/// One worker with its own queue-store and relational connections.
///
/// Both connections are owned by the worker and dropped when `run` returns.
pub struct Worker<Q, E> {
    id: usize,
    batch: Arc<BatchConfig>,
    result_key: String,
    queue: Q,
    executor: E,
    progress: ProgressPoll,
    state: WorkerState,
    report: WorkerReport,
}

impl<Q, E> Worker<Q, E>
where
    Q: QueueStore,
    E: QueryExecutor,
{
    pub fn new(id: usize, batch: Arc<BatchConfig>, queue: Q, executor: E) -> Self {
        let progress = ProgressPoll::new(&batch.search_key, batch.progress);
        Self {
            id,
            result_key: batch.result_key(),
            batch,
            queue,
            executor,
            progress,
            state: WorkerState::Idle,
            report: WorkerReport {
                worker: id,
                ..WorkerReport::default()
            },
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Claim and run jobs until the queue is empty or gone.
    pub async fn run(mut self) -> Result<WorkerReport> {
        tracing::debug!(worker = self.id, search_key = %self.batch.search_key, "worker started");

        loop {
            self.transition(WorkerState::ClaimingJob);
            let Some(payload) = self.queue.pop_member(&self.batch.search_key).await? else {
                break;
            };
            self.report.jobs_claimed += 1;
            self.progress.publish_remaining(&mut self.queue).await?;

            match self.run_job(&payload).await {
                JobOutcome::Success {
                    rows_added,
                    cap_reached,
                } => {
                    self.report.jobs_completed += 1;
                    self.report.rows_added += rows_added;
                    self.report.cap_reached |= cap_reached;
                }
                JobOutcome::Skipped { reason } => {
                    let job = describe_payload(&payload);
                    tracing::warn!(worker = self.id, job = %job, reason = %reason, "skipping failed job");
                    self.report.skipped.push(SkippedJob {
                        worker: self.id,
                        job,
                        reason,
                    });
                }
                JobOutcome::Fatal(err) => {
                    tracing::error!(
                        worker = self.id,
                        state = %self.state,
                        job = %describe_payload(&payload),
                        error = %err,
                        "job failed"
                    );
                    return Err(err);
                }
            }
        }

        self.transition(WorkerState::Drained);
        tracing::debug!(
            worker = self.id,
            jobs = self.report.jobs_claimed,
            rows = self.report.rows_added,
            "worker drained"
        );
        Ok(self.report)
    }

    async fn run_job(&mut self, payload: &[u8]) -> JobOutcome {
        match self.execute_job(payload).await {
            Ok((rows_added, cap_reached)) => JobOutcome::Success {
                rows_added,
                cap_reached,
            },
            Err(err)
                if self.batch.failure_policy == FailurePolicy::SkipFailedJob
                    && err.is_job_scoped() =>
            {
                JobOutcome::Skipped {
                    reason: err.to_string(),
                }
            }
            Err(err) => JobOutcome::Fatal(err),
        }
    }

    /// Returns the number of rows stored and whether the cap stopped the job.
    async fn execute_job(&mut self, payload: &[u8]) -> Result<(u64, bool)> {
        self.transition(WorkerState::DecodingJob);
        let job = decode_job(payload)?;

        if job.needs_setup() {
            self.transition(WorkerState::RunningSetup);
            self.executor.run_setup(&job.setup_statement).await?;
        }

        self.transition(WorkerState::ExecutingQuery);
        let mut rows = self
            .executor
            .query(&job.query_text, &job.query_parameter)
            .await?;

        self.transition(WorkerState::ConsumingRows);
        let mut rows_added = 0u64;
        while let Some(row) = rows.next().await {
            let row = row?;
            let hits = self.queue.cardinality(&self.result_key).await?;
            if hits >= self.batch.hit_cap {
                // Other workers may have deleted the queue already; DEL is idempotent.
                self.queue.delete_key(&self.batch.search_key).await?;
                tracing::debug!(
                    worker = self.id,
                    hits,
                    hit_cap = self.batch.hit_cap,
                    "hit cap reached, stopping batch"
                );
                return Ok((rows_added, true));
            }
            let encoded = encode_row(&row)?;
            self.queue.add_member(&self.result_key, &encoded).await?;
            rows_added += 1;
            self.progress
                .publish_hits(&mut self.queue, &self.result_key)
                .await?;
        }

        Ok((rows_added, false))
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(worker = self.id, from = %self.state, to = %next, "worker state");
        self.state = next;
    }
}

/// Short human-readable label for a job payload, used in logs and reports.
pub fn describe_payload(payload: &[u8]) -> String {
    match decode_job(payload) {
        Ok(job) => truncate(&job.query_text, JOB_DESCRIPTION_MAX),
        Err(_) => format!("<undecodable job: {} bytes>", payload.len()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_job, QueryJob, ResultRow};
    use crate::memory::{MemorySetStore, ScriptedExecutor};

    fn rows(prefix: &str, n: usize) -> Vec<ResultRow> {
        (0..n)
            .map(|i| ResultRow {
                work_id: format!("{prefix}w{i:03}"),
                table_index: i as i64,
                ..ResultRow::default()
            })
            .collect()
    }

    fn push_job(store: &MemorySetStore, key: &str, job: &QueryJob) {
        store.sadd(key, &encode_job(job).unwrap());
    }

    #[tokio::test]
    async fn drains_queue_and_stores_rows() {
        let store = MemorySetStore::new();
        push_job(&store, "q", &QueryJob::new("", "SELECT a", "x"));
        push_job(&store, "q", &QueryJob::new("", "SELECT b", "x"));
        let exec = ScriptedExecutor::builder()
            .rows("SELECT a", rows("a", 3))
            .rows("SELECT b", rows("b", 2))
            .build();

        let batch = Arc::new(BatchConfig::new("q", 100, 1));
        let worker = Worker::new(0, batch, store.clone(), exec);
        assert_eq!(worker.state(), WorkerState::Idle);
        let report = worker.run().await.unwrap();

        assert_eq!(report.jobs_claimed, 2);
        assert_eq!(report.jobs_completed, 2);
        assert_eq!(report.rows_added, 5);
        assert!(!report.cap_reached);
        assert_eq!(store.scard("q_results"), 5);
        assert!(!store.exists("q"));
    }

    #[tokio::test]
    async fn cap_deletes_queue_and_stops_job() {
        let store = MemorySetStore::new();
        push_job(&store, "q", &QueryJob::new("", "SELECT a", "x"));
        push_job(&store, "q", &QueryJob::new("", "SELECT b", "x"));
        let exec = ScriptedExecutor::builder()
            .rows("SELECT a", rows("a", 10))
            .rows("SELECT b", rows("b", 10))
            .build();

        let batch = Arc::new(BatchConfig::new("q", 4, 1));
        let report = Worker::new(0, batch, store.clone(), exec).run().await.unwrap();

        assert!(report.cap_reached);
        assert_eq!(report.jobs_claimed, 1, "queue deleted before second claim");
        assert_eq!(report.rows_added, 4);
        assert_eq!(store.scard("q_results"), 4);
        assert!(!store.exists("q"));
    }

    #[tokio::test]
    async fn zero_cap_stores_nothing() {
        let store = MemorySetStore::new();
        push_job(&store, "q", &QueryJob::new("", "SELECT a", "x"));
        let exec = ScriptedExecutor::builder().rows("SELECT a", rows("a", 3)).build();

        let report = Worker::new(0, Arc::new(BatchConfig::new("q", 0, 1)), store.clone(), exec)
            .run()
            .await
            .unwrap();
        assert!(report.cap_reached);
        assert_eq!(store.scard("q_results"), 0);
    }

    #[tokio::test]
    async fn setup_runs_before_query_and_empty_setup_is_skipped() {
        let store = MemorySetStore::new();
        push_job(&store, "q", &QueryJob::new("CREATE TEMP t", "SELECT a", "x"));
        let exec = ScriptedExecutor::builder().build();
        let journal = exec.clone();

        Worker::new(0, Arc::new(BatchConfig::new("q", 10, 1)), store.clone(), exec)
            .run()
            .await
            .unwrap();
        assert_eq!(journal.journal(), vec!["CREATE TEMP t", "SELECT a"]);

        push_job(&store, "q", &QueryJob::new("  ", "SELECT b", "x"));
        Worker::new(0, Arc::new(BatchConfig::new("q", 10, 1)), store, journal.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(journal.journal().last().map(String::as_str), Some("SELECT b"));
        assert_eq!(journal.journal().len(), 3);
    }

    #[tokio::test]
    async fn malformed_job_is_fatal_by_default() {
        let store = MemorySetStore::new();
        store.sadd("q", b"{not json");
        let err = Worker::new(
            0,
            Arc::new(BatchConfig::new("q", 10, 1)),
            store,
            ScriptedExecutor::default(),
        )
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, GrabError::MalformedPayload(_)), "{err}");
    }

    #[tokio::test]
    async fn skip_policy_records_and_continues() {
        let store = MemorySetStore::new();
        store.sadd("q", b"{not json");
        push_job(&store, "q", &QueryJob::new("", "SELECT bad", "x"));
        push_job(&store, "q", &QueryJob::new("", "SELECT a", "x"));
        let exec = ScriptedExecutor::builder()
            .rows("SELECT a", rows("a", 2))
            .fail_query("SELECT bad")
            .build();

        let batch = BatchConfig::new("q", 10, 1).with_failure_policy(FailurePolicy::SkipFailedJob);
        let report = Worker::new(3, Arc::new(batch), store.clone(), exec)
            .run()
            .await
            .unwrap();

        assert_eq!(report.jobs_claimed, 3);
        assert_eq!(report.jobs_completed, 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().all(|s| s.worker == 3));
        assert!(report.skipped.iter().any(|s| s.job == "SELECT bad"));
        assert!(report
            .skipped
            .iter()
            .any(|s| s.job.starts_with("<undecodable job")));
        assert_eq!(store.scard("q_results"), 2);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ἄνδρα", 2), "ἄν...");
        assert_eq!(truncate("abc", 5), "abc");
    }
}
