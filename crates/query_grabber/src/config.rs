//! Explicit batch configuration threaded from the caller into every worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GrabError, Result};

/// Suffix appended to a search key to name its result set.
pub const RESULT_KEY_SUFFIX: &str = "_results";

/// Default login strings, in the JSON shape existing callers pass.
pub const DEFAULT_QUEUE_LOGIN: &str = r#"{"Addr": "localhost:6379", "Password": "", "DB": 0}"#;
pub const DEFAULT_RELATIONAL_LOGIN: &str =
    r#"{"Host": "localhost", "Port": 5432, "User": "hippa_rd", "Pass": "", "DBName": "hipparchiaDB"}"#;

/// Per-operation timeout for queue-store round trips.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Result set key for a batch. Pure function of the search key.
pub fn result_key_for(search_key: &str) -> String {
    format!("{search_key}{RESULT_KEY_SUFFIX}")
}

/// How to reach the shared set store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueStoreLogin {
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "DB", default)]
    pub db: i64,
}

impl QueueStoreLogin {
    pub fn new(addr: impl Into<String>, password: impl Into<String>, db: i64) -> Self {
        Self {
            addr: addr.into(),
            password: password.into(),
            db,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| GrabError::InvalidConfig(format!("queue store login: {err}")))
    }
}

/// How to reach the relational store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelationalLogin {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Pass", default)]
    pub password: String,
    #[serde(rename = "DBName")]
    pub dbname: String,
}

impl RelationalLogin {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        dbname: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            dbname: dbname.into(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| GrabError::InvalidConfig(format!("relational login: {err}")))
    }

    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("query-grabber");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

/// What a worker does when a single job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The first failure ends the whole batch.
    #[default]
    AbortBatch,
    /// Malformed jobs and rejected queries are recorded and skipped.
    SkipFailedJob,
}

/// Everything a batch run needs besides the store connectors.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub search_key: String,
    pub hit_cap: u64,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    /// Publish `<search_key>_remaining` and `<search_key>_hitcount` while running.
    pub progress: bool,
}

impl BatchConfig {
    pub fn new(search_key: impl Into<String>, hit_cap: u64, workers: usize) -> Self {
        Self {
            search_key: search_key.into(),
            hit_cap,
            workers,
            failure_policy: FailurePolicy::AbortBatch,
            progress: false,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn result_key(&self) -> String {
        result_key_for(&self.search_key)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GrabError::InvalidConfig("worker count must be >= 1".into()));
        }
        if self.search_key.is_empty() {
            return Err(GrabError::InvalidConfig("search key must not be empty".into()));
        }
        Ok(())
    }
}
