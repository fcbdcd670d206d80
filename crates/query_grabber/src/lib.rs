//! Query grabber: a fixed pool of workers that claim pre-built SQL jobs from
//! a shared set store, run them against PostgreSQL, and collect the rows into
//! a capped result set in the same store.
//!
//! The pieces, leaves first:
//! - [`codec`]: JSON wire format of jobs and result rows.
//! - [`queue_store`] / [`resp`]: the set-store capability and its RESP2 client.
//! - [`executor`]: one PostgreSQL session per worker.
//! - [`worker`]: the claim-execute-cap loop.
//! - [`dispatcher`]: fan-out/fan-in over N workers.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod memory;
pub mod progress;
pub mod queue_store;
pub mod resp;
pub mod store_server;
pub mod transfer;
pub mod worker;

pub use codec::{decode_job, decode_row, encode_job, encode_row, QueryJob, ResultRow};
pub use config::{
    result_key_for, BatchConfig, FailurePolicy, QueueStoreLogin, RelationalLogin,
};
pub use dispatcher::{run_batch, BatchReport, Connect};
pub use error::GrabError;
pub use executor::{PgConnector, PgExecutor, QueryExecutor};
pub use memory::{MemorySetStore, ScriptedExecutor};
pub use queue_store::QueueStore;
pub use resp::{RespConnector, RespQueueStore};
pub use worker::{JobOutcome, SkippedJob, Worker, WorkerReport, WorkerState};
