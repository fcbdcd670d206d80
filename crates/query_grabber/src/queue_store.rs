use async_trait::async_trait;

use crate::error::Result;

/// Capability surface of the shared set store.
///
/// Every method is a single store round trip. There are no transactions
/// spanning calls: a worker that reads `cardinality` and then calls
/// `add_member` races with every other worker doing the same.
#[async_trait]
pub trait QueueStore: Send + 'static {
    /// Remove and return one arbitrary member of the set at `key`.
    ///
    /// `None` means the set is empty or the key does not exist.
    async fn pop_member(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Number of members in the set at `key`; zero when absent.
    async fn cardinality(&mut self, key: &str) -> Result<u64>;

    /// Insert `member` into the set at `key`. Re-adding an existing member is a no-op.
    async fn add_member(&mut self, key: &str, member: &[u8]) -> Result<()>;

    /// Remove `key` entirely. Deleting an absent key is not an error.
    async fn delete_key(&mut self, key: &str) -> Result<()>;

    /// Overwrite the plain value stored at `key`.
    async fn set_value(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// False once a failed round trip has left the connection unusable.
    fn is_healthy(&self) -> bool {
        true
    }
}
