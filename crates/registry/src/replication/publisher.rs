//! Publishing side of replication.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use uuid::Uuid;

use super::{
    bus::MessageBus,
    event::{PublisherIdentifier, ReplicationEvent, ReplicationOperation},
};
use crate::{
    backend::{CascadeRemoval, TicketBackend, TicketRecord},
    error::StorageResult,
    metrics::RegistryMetrics,
    ticket::TicketKind,
};

/// Ids of events this node published recently.
///
/// Bounded by capacity and pruned by age, so echoes arriving long after publication are no
/// longer recognized. Clones share the same set.
#[derive(Clone)]
pub struct PublishedEvents {
    ids: Cache<Uuid, ()>,
}

impl PublishedEvents {
    /// Remembers up to `capacity` ids, each for `ttl`.
    #[must_use]
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self { ids: Cache::builder().max_capacity(capacity).time_to_live(ttl).build() }
    }

    /// Records a published event id.
    pub async fn track(&self, event_id: Uuid) {
        self.ids.insert(event_id, ()).await;
    }

    /// Returns `true` if `event_id` was published here and is still remembered.
    #[must_use]
    pub fn contains(&self, event_id: &Uuid) -> bool {
        self.ids.contains_key(event_id)
    }
}

impl fmt::Debug for PublishedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedEvents").field("tracked", &self.ids.entry_count()).finish()
    }
}

/// Backend decorator that publishes every successful write.
///
/// Reads pass straight through. Publication happens after the local write; a failed
/// publication is logged and does not fail the write, which already happened.
///
/// Bulk expiry through [`remove_expired`](TicketBackend::remove_expired) is not published:
/// every node sweeps its own copy against the same deadlines.
pub struct ReplicatingBackend<B> {
    inner: B,
    bus: Arc<dyn MessageBus>,
    origin: PublisherIdentifier,
    published: PublishedEvents,
    metrics: RegistryMetrics,
}

impl<B: TicketBackend> ReplicatingBackend<B> {
    /// Wraps `inner`, publishing as `origin` on `bus`.
    ///
    /// `published` should be shared with this node's
    /// [`ReplicationListener`](super::ReplicationListener).
    #[must_use]
    pub fn new(
        inner: B,
        bus: Arc<dyn MessageBus>,
        origin: PublisherIdentifier,
        published: PublishedEvents,
        metrics: RegistryMetrics,
    ) -> Self {
        Self { inner, bus, origin, published, metrics }
    }

    /// The undecorated backend.
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// This node's identifier.
    #[must_use]
    pub fn origin(&self) -> &PublisherIdentifier {
        &self.origin
    }

    async fn publish(&self, event: StorageResult<ReplicationEvent>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build replication event");
                return;
            },
        };
        self.published.track(event.event_id).await;

        let sent = match event.to_bytes() {
            Ok(bytes) => self.bus.publish(bytes).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                self.metrics.record_event_published();
                tracing::debug!(event_id = %event.event_id, operation = %event.operation, key = %event.ticket_id, "published replication event");
            },
            Err(e) => {
                tracing::warn!(event_id = %event.event_id, operation = %event.operation, error = %e, "failed to publish replication event");
            },
        }
    }

    async fn publish_write(&self, operation: ReplicationOperation, record: &TicketRecord) {
        self.publish(ReplicationEvent::write(&self.origin, operation, record)).await;
    }

    async fn publish_delete(&self, key: &str) {
        self.publish(Ok(ReplicationEvent::delete(&self.origin, key))).await;
    }
}

impl<B: fmt::Debug> fmt::Debug for ReplicatingBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatingBackend")
            .field("inner", &self.inner)
            .field("origin", &self.origin)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: TicketBackend> TicketBackend for ReplicatingBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        self.inner.insert(record.clone()).await?;
        self.publish_write(ReplicationOperation::Add, &record).await;
        Ok(())
    }

    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        let updated = self.inner.update(record.clone()).await?;
        if updated {
            self.publish_write(ReplicationOperation::Update, &record).await;
        }
        Ok(updated)
    }

    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        self.inner.upsert(record.clone()).await?;
        self.publish_write(ReplicationOperation::Add, &record).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let removed = self.inner.remove(key).await?;
        if removed {
            self.publish_delete(key).await;
        }
        Ok(removed)
    }

    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        let removal = self.inner.remove_cascade(descendants, parent).await;
        for (key, result) in &removal.descendants {
            if matches!(result, Ok(true)) {
                self.publish_delete(key).await;
            }
        }
        if matches!(removal.parent, Ok(true)) {
            self.publish_delete(parent).await;
        }
        removal
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        self.inner.scan().await
    }

    async fn clear(&self) -> StorageResult<u64> {
        let removed = self.inner.clear().await?;
        self.publish(Ok(ReplicationEvent::delete_all(&self.origin))).await;
        Ok(removed)
    }

    async fn count(&self, kind: TicketKind) -> StorageResult<Option<u64>> {
        self.inner.count(kind).await
    }

    async fn find_by_principal(&self, principal_key: &str) -> StorageResult<Vec<TicketRecord>> {
        self.inner.find_by_principal(principal_key).await
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<Option<u64>> {
        self.inner.remove_expired(now).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}
