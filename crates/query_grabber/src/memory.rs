//! In-process backends for local dry runs, the bundled set-store server and
//! tests.
//!
//! `MemorySetStore` handles share one map, so every worker sees the same
//! sets the way they would through a network store. Each trait method takes
//! the lock once, which keeps the same per-operation atomicity (and the same
//! check-then-add race) as the real store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;

use crate::codec::ResultRow;
use crate::dispatcher::Connect;
use crate::error::{GrabError, Result};
use crate::executor::{QueryExecutor, RowStream};
use crate::queue_store::QueueStore;

#[derive(Debug, Default)]
struct SetStoreInner {
    sets: HashMap<String, HashSet<Vec<u8>>>,
    values: HashMap<String, Vec<u8>>,
    pops: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySetStore {
    inner: Arc<Mutex<SetStoreInner>>,
}

impl MemorySetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SetStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a member, returning true when it was not already present.
    pub fn sadd(&self, key: &str, member: &[u8]) -> bool {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_vec())
    }

    /// Remove and return a random member. Empty sets are dropped, as a
    /// Redis server does.
    pub fn spop(&self, key: &str) -> Option<Vec<u8>> {
        let mut guard = self.lock();
        let set = guard.sets.get_mut(key)?;
        let pick = rand::thread_rng().gen_range(0..set.len().max(1));
        let member = set.iter().nth(pick).cloned();
        if let Some(member) = member.as_ref() {
            set.remove(member);
        }
        if set.is_empty() {
            guard.sets.remove(key);
        }
        if member.is_some() {
            guard.pops += 1;
        }
        member
    }

    pub fn scard(&self, key: &str) -> u64 {
        self.lock().sets.get(key).map_or(0, |set| set.len() as u64)
    }

    pub fn smembers(&self, key: &str) -> Vec<Vec<u8>> {
        self.lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete a set or plain value. Returns how many keys were removed.
    pub fn del(&self, key: &str) -> u64 {
        let mut guard = self.lock();
        let removed_set = guard.sets.remove(key).is_some();
        let removed_value = guard.values.remove(key).is_some();
        u64::from(removed_set || removed_value)
    }

    pub fn set(&self, key: &str, value: &[u8]) {
        let mut guard = self.lock();
        guard.sets.remove(key);
        guard.values.insert(key.to_string(), value.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().values.get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        let guard = self.lock();
        guard.sets.contains_key(key) || guard.values.contains_key(key)
    }

    /// Total number of successful pops across all handles.
    pub fn pop_count(&self) -> u64 {
        self.lock().pops
    }
}

#[async_trait]
impl QueueStore for MemorySetStore {
    async fn pop_member(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let member = self.spop(key);
        tokio::task::yield_now().await;
        Ok(member)
    }

    async fn cardinality(&mut self, key: &str) -> Result<u64> {
        let n = self.scard(key);
        tokio::task::yield_now().await;
        Ok(n)
    }

    async fn add_member(&mut self, key: &str, member: &[u8]) -> Result<()> {
        self.sadd(key, member);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn delete_key(&mut self, key: &str) -> Result<()> {
        self.del(key);
        Ok(())
    }

    async fn set_value(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.set(key, value);
        Ok(())
    }
}

#[async_trait]
impl Connect for MemorySetStore {
    type Conn = MemorySetStore;

    async fn connect(&self, _worker: usize) -> Result<MemorySetStore> {
        Ok(self.clone())
    }
}

#[derive(Debug, Default)]
struct Script {
    rows: HashMap<String, Vec<ResultRow>>,
    failing_setup: HashSet<String>,
    setup_delays: HashMap<String, Duration>,
    failing_queries: HashSet<String>,
    unreachable: bool,
}

/// Executor that answers each query text with a fixed list of rows.
///
/// Unknown query texts yield no rows. Every executed statement is appended
/// to a shared journal so callers can check what ran and in which order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Script>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn builder() -> ScriptedExecutorBuilder {
        ScriptedExecutorBuilder::default()
    }

    /// Statements run so far, setup and main queries alike.
    pub fn journal(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, statement: &str) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement.to_string());
    }
}

#[derive(Debug, Default)]
pub struct ScriptedExecutorBuilder {
    script: Script,
}

impl ScriptedExecutorBuilder {
    pub fn rows(mut self, query_text: impl Into<String>, rows: Vec<ResultRow>) -> Self {
        self.script.rows.insert(query_text.into(), rows);
        self
    }

    pub fn fail_setup(mut self, statement: impl Into<String>) -> Self {
        self.script.failing_setup.insert(statement.into());
        self
    }

    /// Hold `statement` for `delay` before it succeeds or fails.
    pub fn delay_setup(mut self, statement: impl Into<String>, delay: Duration) -> Self {
        self.script.setup_delays.insert(statement.into(), delay);
        self
    }

    pub fn fail_query(mut self, query_text: impl Into<String>) -> Self {
        self.script.failing_queries.insert(query_text.into());
        self
    }

    /// Make every `connect` fail, as an unreachable database would.
    pub fn unreachable(mut self) -> Self {
        self.script.unreachable = true;
        self
    }

    pub fn build(self) -> ScriptedExecutor {
        ScriptedExecutor {
            script: Arc::new(self.script),
            journal: Arc::default(),
        }
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn run_setup(&mut self, statement: &str) -> Result<()> {
        self.record(statement);
        if let Some(delay) = self.script.setup_delays.get(statement) {
            tokio::time::sleep(*delay).await;
        }
        if self.script.failing_setup.contains(statement) {
            return Err(GrabError::QueryExecution(format!(
                "setup statement failed: {statement}"
            )));
        }
        Ok(())
    }

    async fn query(&mut self, query_text: &str, _parameter: &str) -> Result<RowStream> {
        self.record(query_text);
        if self.script.failing_queries.contains(query_text) {
            return Err(GrabError::QueryExecution(format!(
                "query failed: {query_text}"
            )));
        }
        let rows = self.script.rows.get(query_text).cloned().unwrap_or_default();
        Ok(futures_util::stream::iter(rows)
            .then(|row| async move {
                tokio::task::yield_now().await;
                Ok::<_, GrabError>(row)
            })
            .boxed())
    }
}

#[async_trait]
impl Connect for ScriptedExecutor {
    type Conn = ScriptedExecutor;

    async fn connect(&self, _worker: usize) -> Result<ScriptedExecutor> {
        if self.script.unreachable {
            return Err(GrabError::connection("postgres", "scripted executor is unreachable"));
        }
        Ok(self.clone())
    }
}
