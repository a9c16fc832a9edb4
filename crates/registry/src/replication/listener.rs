//! Applying side of replication.

use std::{fmt, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    bus::MessageBus,
    event::{PublisherIdentifier, ReplicationEvent, ReplicationOperation},
    publisher::PublishedEvents,
};
use crate::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditResult, NoopAuditLogger},
    backend::TicketBackend,
    error::StorageResult,
    metrics::RegistryMetrics,
};

/// Outcome of [`ReplicationListener::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event changed (or idempotently re-confirmed) local state.
    Applied,
    /// The event came from this node and was dropped.
    Ignored,
}

/// Applies peer events to the local, undecorated backend.
///
/// Writes go straight to the backend, never through a
/// [`ReplicatingBackend`](super::ReplicatingBackend), so applying an event publishes nothing.
pub struct ReplicationListener {
    backend: Arc<dyn TicketBackend>,
    origin: PublisherIdentifier,
    published: PublishedEvents,
    metrics: RegistryMetrics,
    audit: Arc<dyn AuditLogger>,
}

#[bon::bon]
impl ReplicationListener {
    /// Creates a listener for the node `origin`.
    #[builder]
    pub fn new(
        backend: Arc<dyn TicketBackend>,
        origin: PublisherIdentifier,
        published: PublishedEvents,
        #[builder(default)] metrics: RegistryMetrics,
        #[builder(default = Arc::new(NoopAuditLogger))] audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self { backend, origin, published, metrics, audit }
    }
}

impl ReplicationListener {
    /// Applies one event.
    ///
    /// Events from this node, or whose id this node published, are ignored. `ADD` overwrites
    /// the local record; `UPDATE` rewrites it only while it is still stored, so a ticket
    /// deleted here stays deleted. `DELETE` of an absent key and repeated `DELETE_ALL`
    /// succeed without effect.
    ///
    /// # Errors
    ///
    /// Returns the backend's error, or [`StorageError::Serialization`](crate::StorageError)
    /// for a write event with an unusable payload.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, operation = %event.operation, origin = %event.origin_id))]
    pub async fn apply(&self, event: &ReplicationEvent) -> StorageResult<Applied> {
        if event.origin_id == self.origin || self.published.contains(&event.event_id) {
            self.metrics.record_event_ignored();
            tracing::trace!("ignoring own replication event");
            return Ok(Applied::Ignored);
        }

        match event.operation {
            ReplicationOperation::Add => {
                self.backend.upsert(event.record()?).await?;
            },
            ReplicationOperation::Update => {
                let updated = self.backend.update(event.record()?).await?;
                if !updated {
                    tracing::debug!(key = %event.ticket_id, "replicated update for a ticket no longer stored, dropping");
                }
            },
            ReplicationOperation::Delete => {
                let removed = self.backend.remove(&event.ticket_id).await?;
                tracing::debug!(key = %event.ticket_id, removed, "applied replicated delete");
            },
            ReplicationOperation::DeleteAll => {
                let removed = self.backend.clear().await?;
                tracing::debug!(removed, "applied replicated delete-all");
            },
        }

        self.metrics.record_event_applied();
        let resource = if event.ticket_id.is_empty() { "*" } else { event.ticket_id.as_str() };
        let mut audit = AuditEvent::builder()
            .actor(self.origin.as_str())
            .action(AuditAction::ApplyReplicated)
            .resource(resource)
            .result(AuditResult::Success)
            .build();
        audit.metadata.insert("operation".to_owned(), event.operation.to_string());
        audit.metadata.insert("origin".to_owned(), event.origin_id.to_string());
        self.audit.log(&audit).await;
        Ok(Applied::Applied)
    }

    /// Consumes `bus` on a background task until `cancel` fires or the bus closes.
    ///
    /// The subscription is taken before this returns, so events published afterwards are not
    /// missed. Events are applied one at a time in arrival order; failures are logged and do
    /// not stop the task.
    pub fn spawn(self: Arc<Self>, bus: &dyn MessageBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut subscription = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = subscription.next() => message,
                };
                let Some(message) = message else {
                    tracing::debug!("replication bus closed");
                    break;
                };
                let event = match ReplicationEvent::from_bytes(&message) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed replication message");
                        continue;
                    },
                };
                if let Err(e) = self.apply(&event).await {
                    tracing::warn!(event_id = %event.event_id, operation = %event.operation, error = %e, "failed to apply replication event");
                }
            }
        })
    }
}

impl fmt::Debug for ReplicationListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationListener")
            .field("backend", &self.backend.name())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
