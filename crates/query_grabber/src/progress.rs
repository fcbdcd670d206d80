//! Best-effort progress keys for an external status reader.
//!
//! A batch under `<search_key>` publishes `<search_key>_remaining` (jobs
//! still queued) and `<search_key>_hitcount` (result set size). Write
//! failures are logged and otherwise ignored, unless the store connection
//! can no longer be trusted; that error is returned.

use crate::error::{GrabError, Result};
use crate::queue_store::QueueStore;

#[derive(Debug, Clone)]
pub struct ProgressPoll {
    search_key: String,
    remaining_key: String,
    hitcount_key: String,
    enabled: bool,
}

impl ProgressPoll {
    pub fn new(search_key: &str, enabled: bool) -> Self {
        Self {
            search_key: search_key.to_string(),
            remaining_key: format!("{search_key}_remaining"),
            hitcount_key: format!("{search_key}_hitcount"),
            enabled,
        }
    }

    pub fn remaining_key(&self) -> &str {
        &self.remaining_key
    }

    pub fn hitcount_key(&self) -> &str {
        &self.hitcount_key
    }

    /// Publish how many jobs are still queued.
    pub async fn publish_remaining<Q: QueueStore>(&self, store: &mut Q) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let remaining = match store.cardinality(&self.search_key).await {
            Ok(n) => n,
            Err(err) => return self.tolerate(store, &self.search_key, err),
        };
        self.write(store, &self.remaining_key, remaining).await
    }

    /// Publish the current size of `result_key`.
    ///
    /// The count is read fresh, but workers write it without ordering, so a
    /// reader can briefly see an older, smaller value.
    pub async fn publish_hits<Q: QueueStore>(&self, store: &mut Q, result_key: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let hits = match store.cardinality(result_key).await {
            Ok(n) => n,
            Err(err) => return self.tolerate(store, result_key, err),
        };
        self.write(store, &self.hitcount_key, hits).await
    }

    async fn write<Q: QueueStore>(&self, store: &mut Q, key: &str, value: u64) -> Result<()> {
        match store.set_value(key, value.to_string().as_bytes()).await {
            Ok(()) => Ok(()),
            Err(err) => self.tolerate(store, key, err),
        }
    }

    /// Swallow a progress failure unless it left the store connection unusable.
    fn tolerate<Q: QueueStore>(&self, store: &Q, key: &str, err: GrabError) -> Result<()> {
        if !store.is_healthy() {
            return Err(err);
        }
        tracing::warn!(key, error = %err, "progress: write failed");
        Ok(())
    }
}
