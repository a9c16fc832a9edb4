//! In-memory ticket backend.
//!
//! [`MemoryTicketBackend`] keeps records in a [`HashMap`] behind a [`parking_lot::RwLock`]. It is
//! the default backend and the local target of [`replication`](crate::replication) on nodes
//! without a shared store.
//!
//! A cascade removal happens under one write lock, so concurrent readers never observe a
//! parent without some of its already-removed children or vice versa.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    backend::{CascadeRemoval, TicketBackend, TicketRecord},
    error::{StorageError, StorageResult},
    ticket::TicketKind,
};

/// Concurrent in-memory map of ticket records.
///
/// Cheaply cloneable; clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct MemoryTicketBackend {
    records: Arc<RwLock<HashMap<String, TicketRecord>>>,
}

impl MemoryTicketBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl TicketBackend for MemoryTicketBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key, kind = %record.kind))]
    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.key) {
            return Err(StorageError::conflict(record.key));
        }
        records.insert(record.key.clone(), record);
        Ok(())
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        let mut records = self.records.write();
        match records.get_mut(&record.key) {
            Some(existing) => {
                *existing = record;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        self.records.write().insert(record.key.clone(), record);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, key: &str) -> StorageResult<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    #[tracing::instrument(skip(self, descendants), fields(descendants = descendants.len()))]
    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        let mut records = self.records.write();
        let descendants =
            descendants.iter().map(|key| (key.clone(), Ok(records.remove(key).is_some()))).collect();
        CascadeRemoval { descendants, parent: Ok(records.remove(parent).is_some()) }
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    #[tracing::instrument(skip(self))]
    async fn clear(&self) -> StorageResult<u64> {
        let mut records = self.records.write();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn count(&self, kind: TicketKind) -> StorageResult<Option<u64>> {
        Ok(Some(self.records.read().values().filter(|record| record.kind == kind).count() as u64))
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Acquire the read lock to verify no writer is stuck holding it.
        let _unused = self.records.read();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn record(key: &str, kind: TicketKind) -> TicketRecord {
        TicketRecord {
            key: key.to_owned(),
            kind,
            parent_key: None,
            principal_key: Some("casuser".to_owned()),
            expires_at: None,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn insert_rejects_existing_key() {
        let backend = MemoryTicketBackend::new();
        backend.insert(record("TGT-1", TicketKind::TicketGranting)).await.unwrap();
        let err = backend.insert(record("TGT-1", TicketKind::TicketGranting)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_requires_existing_key() {
        let backend = MemoryTicketBackend::new();
        assert!(!backend.update(record("TGT-1", TicketKind::TicketGranting)).await.unwrap());
        assert!(backend.is_empty());

        backend.insert(record("TGT-1", TicketKind::TicketGranting)).await.unwrap();
        let mut changed = record("TGT-1", TicketKind::TicketGranting);
        changed.payload = Bytes::from_static(b"changed");
        assert!(backend.update(changed).await.unwrap());
        assert_eq!(backend.get("TGT-1").await.unwrap().unwrap().payload, Bytes::from_static(b"changed"));
    }

    #[tokio::test]
    async fn cascade_reports_each_key() {
        let backend = MemoryTicketBackend::new();
        backend.insert(record("TGT-1", TicketKind::TicketGranting)).await.unwrap();
        backend.insert(record("ST-1", TicketKind::Service)).await.unwrap();

        let removal = backend.remove_cascade(&["ST-1".to_owned(), "ST-gone".to_owned()], "TGT-1").await;

        assert!(matches!(removal.descendants[0], (ref k, Ok(true)) if k == "ST-1"));
        assert!(matches!(removal.descendants[1], (ref k, Ok(false)) if k == "ST-gone"));
        assert!(matches!(removal.parent, Ok(true)));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn count_and_principal_lookup() {
        let backend = MemoryTicketBackend::new();
        backend.insert(record("TGT-1", TicketKind::TicketGranting)).await.unwrap();
        backend.insert(record("TGT-2", TicketKind::TicketGranting)).await.unwrap();
        backend.insert(record("ST-1", TicketKind::Service)).await.unwrap();

        assert_eq!(backend.count(TicketKind::TicketGranting).await.unwrap(), Some(2));
        assert_eq!(backend.count(TicketKind::Proxy).await.unwrap(), Some(0));
        assert_eq!(backend.find_by_principal("casuser").await.unwrap().len(), 3);
        assert_eq!(backend.clear().await.unwrap(), 3);
    }
}
