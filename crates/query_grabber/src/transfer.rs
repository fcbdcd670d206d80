//! Helpers for the two ends around a batch: loading a job queue and draining
//! a result set.

use std::io::BufRead;

use crate::codec::{decode_row, encode_job, QueryJob, ResultRow};
use crate::error::{GrabError, Result};
use crate::queue_store::QueueStore;

/// Parse one job per non-blank line.
pub fn read_job_lines<R: BufRead>(reader: R) -> Result<Vec<QueryJob>> {
    let mut jobs = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            GrabError::MalformedPayload(format!("line {}: read failed: {err}", lineno + 1))
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let job = serde_json::from_str::<QueryJob>(line)
            .map_err(|err| GrabError::MalformedPayload(format!("line {}: {err}", lineno + 1)))?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Put `jobs` into the set at `search_key`. Unless `append` is set the key is
/// cleared first so stale jobs from an earlier search cannot leak in.
///
/// Returns the number of jobs written; identical jobs collapse into one member.
pub async fn submit_jobs<Q: QueueStore>(
    store: &mut Q,
    search_key: &str,
    jobs: &[QueryJob],
    append: bool,
) -> Result<usize> {
    if !append {
        store.delete_key(search_key).await?;
    }
    for job in jobs {
        store.add_member(search_key, &encode_job(job)?).await?;
    }
    tracing::info!(search_key, jobs = jobs.len(), append, "submitted jobs");
    Ok(jobs.len())
}

/// Pop every member of `result_key` and decode it. The key is empty afterwards.
pub async fn drain_results<Q: QueueStore>(store: &mut Q, result_key: &str) -> Result<Vec<ResultRow>> {
    let mut rows = Vec::new();
    while let Some(member) = store.pop_member(result_key).await? {
        rows.push(decode_row(&member)?);
    }
    Ok(rows)
}
