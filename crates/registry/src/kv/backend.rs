//! [`TicketBackend`] over any [`KeyValueStore`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use super::store::KeyValueStore;
use crate::{
    backend::{TicketBackend, TicketRecord},
    clock::{Clock, SystemClock},
    error::{StorageError, StorageResult},
};

/// Key prefix under which every record lives.
const KEY_PREFIX: &[u8] = b"tickets/";

/// Exclusive upper bound of the prefix range (`'/' + 1`).
const KEY_PREFIX_END: &[u8] = b"tickets0";

/// Attempts an update makes before reporting a conflict.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Stores ticket records as JSON values in a key-value store.
///
/// Records with an expiry are written with a native TTL equal to the time left, so the store
/// drops them on its own even if the cleaner never runs. Updates use compare-and-set so that an
/// update racing with a removal never resurrects the record.
pub struct KeyValueTicketBackend<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> KeyValueTicketBackend<S> {
    /// Wraps `store`, computing TTLs against the system clock.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Wraps `store`, computing TTLs against `clock`.
    #[must_use]
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn storage_key(key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_PREFIX.len() + key.len());
        out.extend_from_slice(KEY_PREFIX);
        out.extend_from_slice(key.as_bytes());
        out
    }

    fn encode(record: &TicketRecord) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(record)
            .map_err(|e| StorageError::serialization_with_source(format!("encode record {}", record.key), e))
    }

    fn decode(bytes: &Bytes) -> StorageResult<TicketRecord> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::serialization_with_source("decode record", e))
    }
}

impl<S> fmt::Debug for KeyValueTicketBackend<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueTicketBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: KeyValueStore + 'static> TicketBackend for KeyValueTicketBackend<S> {
    fn name(&self) -> &'static str {
        "key-value"
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key, kind = %record.kind))]
    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        let ttl = record.time_to_live(self.clock.now());
        let value = Self::encode(&record)?;
        match self.store.compare_and_set(&Self::storage_key(&record.key), None, value, ttl).await {
            Err(StorageError::Conflict { .. }) => Err(StorageError::conflict(record.key)),
            other => other,
        }
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        let key = Self::storage_key(&record.key);
        let value = Self::encode(&record)?;

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(false);
            };
            let ttl = record.time_to_live(self.clock.now());
            match self.store.compare_and_set(&key, Some(&current[..]), value.clone(), ttl).await {
                Ok(()) => return Ok(true),
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(attempt, "update lost compare-and-set race, retrying");
                },
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::conflict(record.key))
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        let key = Self::storage_key(&record.key);
        let value = Self::encode(&record)?;
        match record.time_to_live(self.clock.now()) {
            Some(ttl) => self.store.set_with_ttl(key, value, ttl).await,
            None => self.store.set(key, value).await,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        self.store.get(&Self::storage_key(key)).await?.map(|bytes| Self::decode(&bytes)).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, key: &str) -> StorageResult<bool> {
        self.store.delete(&Self::storage_key(key)).await
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        let pairs = self.store.get_range(KEY_PREFIX.to_vec()..KEY_PREFIX_END.to_vec()).await?;
        let mut records = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match Self::decode(&pair.value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&pair.key), error = %e, "skipping unreadable record");
                },
            }
        }
        Ok(records)
    }

    #[tracing::instrument(skip(self))]
    async fn clear(&self) -> StorageResult<u64> {
        self.store.clear_range(KEY_PREFIX.to_vec()..KEY_PREFIX_END.to_vec()).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::{kv::MemoryKeyValueStore, ticket::TicketKind};

    fn record(key: &str, expires_in: Option<i64>) -> TicketRecord {
        TicketRecord {
            key: key.to_owned(),
            kind: TicketKind::Service,
            parent_key: Some("TGT-1".to_owned()),
            principal_key: None,
            expires_at: expires_in.map(|s| Utc::now() + TimeDelta::seconds(s)),
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn records_live_under_prefix() {
        let store = MemoryKeyValueStore::new();
        let backend = KeyValueTicketBackend::new(store.clone());
        backend.insert(record("ST-1", None)).await.unwrap();
        store.set(b"other/key".to_vec(), b"x".to_vec()).await.unwrap();

        assert!(store.get(b"tickets/ST-1").await.unwrap().is_some());
        assert_eq!(backend.scan().await.unwrap().len(), 1);
        assert_eq!(backend.clear().await.unwrap(), 1);
        assert!(store.get(b"other/key").await.unwrap().is_some(), "clear stays within the prefix");
    }

    #[tokio::test]
    async fn insert_conflict_reports_ticket_key() {
        let backend = KeyValueTicketBackend::new(MemoryKeyValueStore::new());
        backend.insert(record("ST-1", None)).await.unwrap();
        let err = backend.insert(record("ST-1", None)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { ref key } if key == "ST-1"));
    }

    #[tokio::test]
    async fn update_of_missing_key_writes_nothing() {
        let backend = KeyValueTicketBackend::new(MemoryKeyValueStore::new());
        assert!(!backend.update(record("ST-1", None)).await.unwrap());
        assert!(backend.get("ST-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_records_get_native_ttl() {
        let backend = KeyValueTicketBackend::new(MemoryKeyValueStore::new());
        backend.insert(record("ST-1", Some(5))).await.unwrap();
        backend.upsert(record("ST-2", Some(5))).await.unwrap();
        backend.insert(record("ST-3", None)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("ST-1").await.unwrap().is_none());
        assert!(backend.get("ST-2").await.unwrap().is_none());
        assert!(backend.get("ST-3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_values_are_skipped_by_scan() {
        let store = MemoryKeyValueStore::new();
        let backend = KeyValueTicketBackend::new(store.clone());
        backend.insert(record("ST-1", None)).await.unwrap();
        store.set(b"tickets/garbage".to_vec(), b"not json".to_vec()).await.unwrap();

        assert_eq!(backend.scan().await.unwrap().len(), 1);
        assert!(backend.get("garbage").await.is_err());
    }
}
