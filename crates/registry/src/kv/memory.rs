//! In-memory key-value store.
//!
//! This module provides [`MemoryKeyValueStore`], an in-memory implementation of
//! [`KeyValueStore`] that behaves like a single-node distributed cache: ordered keys, native
//! TTL and atomic compare-and-set.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for range queries
//! - **TTL support**: Expired keys are invisible immediately and reaped by a background task
//!
//! Expiry is measured with [`tokio::time::Instant`], so tests running on a paused runtime can
//! advance time deterministically.
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | get | O(log n) |
//! | set | O(log n) |
//! | delete | O(log n) |
//! | get_range | O(log n + k) where k is result size |

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep},
};

use super::store::{KeyValue, KeyValueStore};
use crate::error::{StorageError, StorageResult};

/// How often the background task reaps expired keys.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the reaper task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Best-effort signal; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory key-value store using [`BTreeMap`].
///
/// # Cloning
///
/// Cheaply cloneable via [`Arc`]. All clones share the same data.
///
/// # Shutdown
///
/// The background reaper stops when all clones are dropped, or explicitly via
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
    ttl_data: Arc<RwLock<BTreeMap<Vec<u8>, Instant>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyValueStore").field("keys", &self.data.read().len()).finish_non_exhaustive()
    }
}

impl MemoryKeyValueStore {
    /// Creates an empty store and spawns its reaper task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            ttl_data: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task does not hold the guard, so dropping the last clone stops it.
        let data = Arc::clone(&store.data);
        let ttl_data = Arc::clone(&store.ttl_data);
        tokio::spawn(async move {
            reap_expired_keys(data, ttl_data, shutdown_rx).await;
        });

        store
    }

    /// Stops the background reaper.
    ///
    /// Expired keys remain invisible to readers; they are just no longer reclaimed.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of keys physically held, including expired keys not yet reaped.
    #[must_use]
    pub fn physical_len(&self) -> usize {
        self.data.read().len()
    }

    fn is_expired(&self, key: &[u8]) -> bool {
        self.ttl_data.read().get(key).is_some_and(|expiry| *expiry <= Instant::now())
    }

    fn set_ttl(&self, key: &[u8], ttl: Option<Duration>) {
        let mut ttl_guard = self.ttl_data.write();
        match ttl {
            Some(ttl) => {
                ttl_guard.insert(key.to_vec(), Instant::now() + ttl);
            },
            None => {
                ttl_guard.remove(key);
            },
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically removes expired keys until shutdown is signalled.
async fn reap_expired_keys(
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
    ttl_data: Arc<RwLock<BTreeMap<Vec<u8>, Instant>>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(REAP_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let now = Instant::now();
        let expired: Vec<Vec<u8>> =
            ttl_data.read().iter().filter(|(_, expiry)| **expiry <= now).map(|(key, _)| key.clone()).collect();

        if !expired.is_empty() {
            // Lock order: data, then ttl_data.
            let mut data_guard = data.write();
            let mut ttl_guard = ttl_data.write();
            for key in expired {
                // A concurrent write may have refreshed the TTL since the scan.
                if ttl_guard.get(&key).is_some_and(|expiry| *expiry <= now) {
                    data_guard.remove(&key);
                    ttl_guard.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if self.is_expired(key) {
            return Ok(None);
        }
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mut data = self.data.write();
        self.set_ttl(&key, None);
        data.insert(key, Bytes::from(value));
        Ok(())
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let mut data = self.data.write();
        self.set_ttl(&key, Some(ttl));
        data.insert(key, Bytes::from(value));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();

        let current = if self.is_expired(key) { None } else { data.get(key).cloned() };
        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::conflict(String::from_utf8_lossy(key)));
        }

        self.set_ttl(key, ttl);
        data.insert(key.to_vec(), Bytes::from(new_value));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        let mut data = self.data.write();
        let live = !self.is_expired(key);
        let removed = data.remove(key).is_some();
        self.ttl_data.write().remove(key);
        Ok(removed && live)
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let start = match range.start_bound() {
            Bound::Included(b) => Bound::Included(b.as_slice()),
            Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let end = match range.end_bound() {
            Bound::Included(b) => Bound::Included(b.as_slice()),
            Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((start, end))
            .filter(|(key, _)| !self.is_expired(key))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    async fn clear_range<R>(&self, range: R) -> StorageResult<u64>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        // Collect under the read lock so concurrent readers proceed during the scan.
        let keys: Vec<Vec<u8>> = self.data.read().range(range).map(|(k, _)| k.clone()).collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let mut data = self.data.write();
        let mut ttl_guard = self.ttl_data.write();
        let mut removed = 0;
        for key in &keys {
            let live = ttl_guard.get(key).is_none_or(|expiry| *expiry > now);
            if data.remove(key).is_some() && live {
                removed += 1;
            }
            ttl_guard.remove(key);
        }
        Ok(removed)
    }

    async fn health_check(&self) -> StorageResult<()> {
        fail_point!("kv-health-check", |_| Err(StorageError::connection("injected health check failure")));
        let _unused = self.data.read();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryKeyValueStore::new();

        store.set(b"key1".to_vec(), b"value1".to_vec()).await.unwrap();
        assert_eq!(store.get(b"key1").await.unwrap(), Some(Bytes::from("value1")));

        assert!(store.delete(b"key1").await.unwrap());
        assert!(!store.delete(b"key1").await.unwrap());
        assert_eq!(store.get(b"key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn range_is_ordered_and_exclusive() {
        let store = MemoryKeyValueStore::new();
        for key in ["c", "a", "b"] {
            store.set(key.as_bytes().to_vec(), b"v".to_vec()).await.unwrap();
        }

        let range = store.get_range(b"a".to_vec()..b"c".to_vec()).await.unwrap();
        let keys: Vec<_> = range.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b")]);

        assert_eq!(store.clear_range(b"a".to_vec()..b"c".to_vec()).await.unwrap(), 2);
        assert_eq!(store.get(b"c").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_hides_then_reaps() {
        let store = MemoryKeyValueStore::new();
        store.set_with_ttl(b"temp".to_vec(), b"value".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert!(store.get(b"temp").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(store.get(b"temp").await.unwrap(), None);
        assert!(!store.delete(b"temp").await.unwrap(), "expired key counts as absent");

        store.set_with_ttl(b"temp2".to_vec(), b"value".to_vec(), Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.physical_len(), 0, "reaper removed the expired key");
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_clears_ttl() {
        let store = MemoryKeyValueStore::new();
        store.set_with_ttl(b"key".to_vec(), b"temp".to_vec(), Duration::from_secs(1)).await.unwrap();
        store.set(b"key".to_vec(), b"permanent".to_vec()).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(b"key").await.unwrap(), Some(Bytes::from("permanent")));
    }

    #[tokio::test]
    async fn compare_and_set_semantics() {
        let store = MemoryKeyValueStore::new();

        store.compare_and_set(b"key", None, b"v1".to_vec(), None).await.unwrap();
        assert!(store.compare_and_set(b"key", None, b"v2".to_vec(), None).await.unwrap_err().is_conflict());
        assert!(store.compare_and_set(b"key", Some(b"wrong"), b"v2".to_vec(), None).await.unwrap_err().is_conflict());
        store.compare_and_set(b"key", Some(b"v1"), b"v2".to_vec(), None).await.unwrap();
        assert_eq!(store.get(b"key").await.unwrap(), Some(Bytes::from("v2")));

        assert!(
            store.compare_and_set(b"missing", Some(b"v"), b"new".to_vec(), None).await.unwrap_err().is_conflict()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_set_replaces_ttl() {
        let store = MemoryKeyValueStore::new();
        store.set_with_ttl(b"key".to_vec(), b"v1".to_vec(), Duration::from_secs(3600)).await.unwrap();
        store.compare_and_set(b"key", Some(b"v1"), b"v2".to_vec(), Some(Duration::from_secs(1))).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(b"key").await.unwrap(), None);
        store.compare_and_set(b"key", None, b"v3".to_vec(), None).await.unwrap();
        assert_eq!(store.get(b"key").await.unwrap(), Some(Bytes::from("v3")));
    }

    #[tokio::test]
    async fn clones_share_data() {
        let a = MemoryKeyValueStore::new();
        let b = a.clone();
        a.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
        assert_eq!(b.get(b"key").await.unwrap(), Some(Bytes::from("value")));
        assert!(b.health_check().await.is_ok());
    }

    proptest! {
        #[test]
        fn range_scan_matches_btreemap(keys in proptest::collection::btree_set("[a-z]{1,4}", 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = MemoryKeyValueStore::new();
                for key in &keys {
                    store.set(key.as_bytes().to_vec(), key.as_bytes().to_vec()).await.unwrap();
                }
                let scanned: Vec<String> = store
                    .get_range(b"b".to_vec()..b"m".to_vec())
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|kv| String::from_utf8(kv.key.to_vec()).unwrap())
                    .collect();
                let expected: Vec<String> =
                    keys.iter().filter(|k| k.as_str() >= "b" && k.as_str() < "m").cloned().collect();
                assert_eq!(scanned, expected);
            });
        }
    }
}
