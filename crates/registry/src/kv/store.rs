//! Key-value store abstraction.
//!
//! [`KeyValueStore`] is the minimal interface a distributed cache or key-value database must
//! offer to host tickets through [`KeyValueTicketBackend`](super::KeyValueTicketBackend):
//!
//! - **Keys and values are bytes**: no assumptions about serialization format
//! - **Compare-and-set**: insert-if-absent and update-if-unchanged in one atomic step
//! - **Native TTL**: keys vanish on their own once their time-to-live elapses
//! - **Ordered range scans**: used to enumerate one key prefix
//!
//! See [`MemoryKeyValueStore`](super::MemoryKeyValueStore) for a reference implementation.

use std::{ops::RangeBounds, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// A key-value pair returned by range scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a pair.
    #[must_use]
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Abstract key-value store with TTL and compare-and-set.
///
/// Implementations are thread-safe and support concurrent operations. A key whose TTL has
/// elapsed behaves exactly like an absent key for every method.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](KeyValueStore::get) | Retrieve a single value |
/// | [`set`](KeyValueStore::set) | Store without expiry |
/// | [`set_with_ttl`](KeyValueStore::set_with_ttl) | Store with expiry |
/// | [`compare_and_set`](KeyValueStore::compare_and_set) | Atomic conditional write |
/// | [`delete`](KeyValueStore::delete) | Remove a key |
/// | [`get_range`](KeyValueStore::get_range) | Ordered scan |
/// | [`clear_range`](KeyValueStore::clear_range) | Remove a range |
/// | [`health_check`](KeyValueStore::health_check) | Verify availability |
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Retrieves a value by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a value without expiry, clearing any existing TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a value that expires after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically writes `new_value` if the current value matches `expected`.
    ///
    /// - **`expected: None`**: insert-if-absent. Fails if any live value is present.
    /// - **`expected: Some(value)`**: update-if-unchanged. Fails if the key is absent or holds
    ///   different bytes.
    ///
    /// On success the key's TTL is replaced by `ttl` (`None` makes it non-expiring).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if the precondition
    /// does not hold. Conflicts are not transient: callers loop at the application level.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Removes a key. Returns `true` if a live value was removed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<bool>;

    /// Retrieves every live pair within `range`, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Removes every key within `range`. Returns how many live values were removed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<u64>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Verifies that the store is reachable.
    #[must_use = "health check results indicate store availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
