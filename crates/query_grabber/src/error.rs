//! Error types shared by the grabber library.

use thiserror::Error;

/// Errors raised while running a batch.
///
/// An empty job queue is not represented here: a pop that finds nothing is
/// the normal end of a worker's loop and is reported as `None`.
#[derive(Debug, Error)]
pub enum GrabError {
    /// A store connection could not be established or did not answer its ping.
    #[error("connection error ({store}): {message}")]
    Connection {
        store: &'static str,
        message: String,
    },

    /// A job or row did not match the fixed wire schema.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The relational store rejected the setup statement or the main query.
    #[error("query execution error: {0}")]
    QueryExecution(String),

    /// A queue-store round trip failed after the connection was established.
    #[error("queue store error: {0}")]
    Store(String),

    /// The coordinator was handed inputs it cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker task panicked or was cancelled before reporting.
    #[error("worker {worker} did not finish: {message}")]
    WorkerPanicked { worker: usize, message: String },
}

impl GrabError {
    pub fn connection(store: &'static str, err: impl std::fmt::Display) -> Self {
        GrabError::Connection {
            store,
            message: err.to_string(),
        }
    }

    /// True for failures confined to a single job, which the skip policy may
    /// record and move past. Store and connection failures never are.
    pub fn is_job_scoped(&self) -> bool {
        matches!(
            self,
            GrabError::MalformedPayload(_) | GrabError::QueryExecution(_)
        )
    }
}

impl From<serde_json::Error> for GrabError {
    fn from(err: serde_json::Error) -> Self {
        GrabError::MalformedPayload(err.to_string())
    }
}

pub type Result<T, E = GrabError> = std::result::Result<T, E>;
