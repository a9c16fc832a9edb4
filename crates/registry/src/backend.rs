//! Storage backend trait for tickets.
//!
//! A [`TicketBackend`] stores opaque [`TicketRecord`]s: the registry has already hashed the ids
//! and encrypted the payloads, so backends never see a raw ticket. The metadata fields on a
//! record (kind, parent, principal, expiry) are what a backend may index.
//!
//! # Implementations
//!
//! | Backend | Crate | Notes |
//! |---------|-------|-------|
//! | [`MemoryTicketBackend`](crate::MemoryTicketBackend) | this crate | Default, replication target |
//! | [`KeyValueTicketBackend`](crate::kv::KeyValueTicketBackend) | this crate | Any [`KeyValueStore`](crate::kv::KeyValueStore), native TTL |
//! | `SqlTicketBackend` | `tessera-registry-sql` | Transactional cascade, indexed counters |
//!
//! Every implementation must pass the [`conformance`](crate::conformance) suite.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StorageResult, ticket::TicketKind};

/// A ticket as stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Storage key: the ticket id, or its digest when the cipher is enabled.
    pub key: String,
    /// Concrete ticket kind.
    pub kind: TicketKind,
    /// Storage key of the issuing ticket.
    #[serde(default)]
    pub parent_key: Option<String>,
    /// Principal id (or digest) for granting tickets.
    #[serde(default)]
    pub principal_key: Option<String>,
    /// Last instant at which the ticket can be valid, if time-bounded.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Serialized, optionally encrypted ticket.
    #[serde(with = "crate::codec::base64_bytes")]
    pub payload: Bytes,
}

impl TicketRecord {
    /// Returns `true` if the record's time bound has passed at `now`.
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Time left until the record's time bound, for stores with native TTL.
    ///
    /// `None` means the record should be stored without a TTL.
    #[must_use]
    pub fn time_to_live(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Per-key results of [`TicketBackend::remove_cascade`].
#[derive(Debug)]
pub struct CascadeRemoval {
    /// Result for each descendant key, in the order requested.
    pub descendants: Vec<(String, StorageResult<bool>)>,
    /// Result for the parent key.
    pub parent: StorageResult<bool>,
}

/// Storage contract for ticket records.
///
/// Implementations must be safe for concurrent use on different keys without a global lock.
/// For the same key, writes are at least last-writer-wins.
#[async_trait]
pub trait TicketBackend: Send + Sync + fmt::Debug {
    /// Short backend name used in logs and spans.
    fn name(&self) -> &'static str;

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if the key already
    /// exists.
    async fn insert(&self, record: TicketRecord) -> StorageResult<()>;

    /// Replaces an existing record. Returns `false` without writing if the key is absent.
    ///
    /// The existence check and the write must be atomic so that an update racing with a
    /// deletion cannot resurrect the record.
    async fn update(&self, record: TicketRecord) -> StorageResult<bool>;

    /// Writes a record whether or not the key exists.
    async fn upsert(&self, record: TicketRecord) -> StorageResult<()>;

    /// Reads a record.
    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>>;

    /// Removes a record. Returns `false` if it did not exist.
    async fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Removes `descendants` in order, then `parent`.
    ///
    /// A failing descendant does not stop the remaining removals or the parent's. The default
    /// implementation removes keys one at a time; backends with transactions override it.
    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        let mut results = Vec::with_capacity(descendants.len());
        for key in descendants {
            results.push((key.clone(), self.remove(key).await));
        }
        CascadeRemoval { descendants: results, parent: self.remove(parent).await }
    }

    /// Returns every stored record. May be an eventually consistent snapshot.
    async fn scan(&self) -> StorageResult<Vec<TicketRecord>>;

    /// Removes every record. Returns how many were removed.
    async fn clear(&self) -> StorageResult<u64>;

    /// Number of records of `kind`, or `None` if the backend cannot count cheaply.
    async fn count(&self, _kind: TicketKind) -> StorageResult<Option<u64>> {
        Ok(None)
    }

    /// Records whose principal key equals `principal_key`.
    ///
    /// The default implementation filters a full scan.
    async fn find_by_principal(&self, principal_key: &str) -> StorageResult<Vec<TicketRecord>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|record| record.principal_key.as_deref() == Some(principal_key))
            .collect())
    }

    /// Bulk-removes records whose time bound passed before `now`.
    ///
    /// Returns `None` if the backend has no efficient way to do this.
    async fn remove_expired(&self, _now: DateTime<Utc>) -> StorageResult<Option<u64>> {
        Ok(None)
    }

    /// Verifies that the backend is reachable.
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<B: TicketBackend + ?Sized> TicketBackend for Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        (**self).insert(record).await
    }

    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        (**self).update(record).await
    }

    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        (**self).upsert(record).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        (**self).get(key).await
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        (**self).remove(key).await
    }

    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        (**self).remove_cascade(descendants, parent).await
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        (**self).scan().await
    }

    async fn clear(&self) -> StorageResult<u64> {
        (**self).clear().await
    }

    async fn count(&self, kind: TicketKind) -> StorageResult<Option<u64>> {
        (**self).count(kind).await
    }

    async fn find_by_principal(&self, principal_key: &str) -> StorageResult<Vec<TicketRecord>> {
        (**self).find_by_principal(principal_key).await
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<Option<u64>> {
        (**self).remove_expired(now).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
