//! The ticket registry.
//!
//! [`TicketRegistry`] is the single entry point for storing, reading and revoking tickets. It
//! owns the codec (id hashing and payload protection), enforces expiry on read, cascades
//! deletions from granting tickets to everything they issued, and turns backend failures into
//! [`RegistryError::Unavailable`] instead of letting them look like missing tickets.
//!
//! # Cascade order
//!
//! Deleting a granting ticket removes, in this order:
//!
//! 1. every ticket in its service map, ascending by id
//! 2. every proxy-granting ticket it issued, ascending by id, each one depth-first (its own
//!    services, its own proxy-granting tickets, then itself)
//! 3. the ticket itself
//!
//! A descendant that cannot be removed does not stop the rest; the outcome is reported as
//! [`Deletion::PartiallyDeleted`].

use std::{
    collections::HashSet,
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    audit::{AsyncAuditLogger, AuditAction, AuditEvent, AuditLogger, AuditResult, NoopAuditLogger, TracingAuditLogger},
    backend::{TicketBackend, TicketRecord},
    cipher::cipher_executor_from_config,
    clock::{Clock, SystemClock},
    codec::TicketCodec,
    config::{AuditMode, DEFAULT_OPERATION_TIMEOUT, RegistryConfig, RetryConfig},
    error::{CascadeDeletionPartialFailure, ConfigError, RegistryError, RegistryResult, StorageError, StorageResult},
    metrics::RegistryMetrics,
    retry::with_retry_timeout,
    ticket::{Ticket, TicketGrantingTicket, TicketKind},
};

/// Number of per-ticket lock stripes.
const LOCK_STRIPES: usize = 64;

/// Outcome of [`TicketRegistry::delete_ticket`].
#[derive(Debug)]
#[must_use]
pub enum Deletion {
    /// Nothing was stored under the id.
    NotFound,
    /// The ticket and all its descendants were removed.
    Deleted {
        /// Records physically removed, the ticket itself included.
        removed: usize,
    },
    /// The ticket was removed but some descendants could not be.
    PartiallyDeleted {
        /// Records physically removed, the ticket itself included.
        removed: usize,
        /// Descendants left behind.
        failure: CascadeDeletionPartialFailure,
    },
}

impl Deletion {
    /// Returns `true` if the ticket itself was removed.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        !matches!(self, Self::NotFound)
    }

    /// Records physically removed.
    #[must_use]
    pub fn removed(&self) -> usize {
        match self {
            Self::NotFound => 0,
            Self::Deleted { removed } | Self::PartiallyDeleted { removed, .. } => *removed,
        }
    }
}

/// Stores tickets in a [`TicketBackend`].
///
/// Construct with [`TicketRegistry::builder`] or [`TicketRegistry::from_config`]. Share it
/// behind an [`Arc`]; every method takes `&self`.
pub struct TicketRegistry {
    backend: Arc<dyn TicketBackend>,
    codec: TicketCodec,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLogger>,
    audit_queue: Option<Arc<AsyncAuditLogger>>,
    actor: String,
    metrics: RegistryMetrics,
    operation_timeout: Duration,
    retry: RetryConfig,
    locks: Vec<Mutex<()>>,
}

#[bon::bon]
impl TicketRegistry {
    /// Creates a registry over `backend`.
    ///
    /// Defaults: no cipher, system clock, no audit, 5 second operation timeout, default
    /// retry policy.
    #[builder]
    pub fn new(
        backend: Arc<dyn TicketBackend>,
        #[builder(default)] codec: TicketCodec,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default = Arc::new(NoopAuditLogger))] audit: Arc<dyn AuditLogger>,
        #[builder(into, default = "registry".to_owned())] actor: String,
        #[builder(default)] metrics: RegistryMetrics,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            codec,
            clock,
            audit,
            audit_queue: None,
            actor,
            metrics,
            operation_timeout,
            retry,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl TicketRegistry {
    /// Creates a registry as described by `config`.
    ///
    /// Builds the cipher from the configured keys and the audit logger from the audit mode.
    /// Asynchronous audit spawns a task, so this must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the cipher keys are unusable.
    pub fn from_config(
        config: &RegistryConfig,
        backend: Arc<dyn TicketBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let codec = TicketCodec::new(cipher_executor_from_config(config.cipher())?);
        let actor = config.replication().node_id.clone().unwrap_or_else(|| "registry".to_owned());

        let (audit, audit_queue): (Arc<dyn AuditLogger>, _) = match (config.audit().enabled, config.audit().mode) {
            (false, _) => (Arc::new(NoopAuditLogger), None),
            (true, AuditMode::Synchronous) => (Arc::new(TracingAuditLogger), None),
            (true, AuditMode::Asynchronous) => {
                let queue = Arc::new(AsyncAuditLogger::new(Arc::new(TracingAuditLogger)));
                (Arc::clone(&queue) as Arc<dyn AuditLogger>, Some(queue))
            },
        };

        let mut registry = Self::builder()
            .backend(backend)
            .codec(codec)
            .clock(clock)
            .audit(audit)
            .actor(actor)
            .operation_timeout(config.operation_timeout())
            .retry(config.retry().clone())
            .build();
        registry.audit_queue = audit_queue;
        Ok(registry)
    }

    /// Stores a new ticket.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateTicket`] if the id is taken
    /// - [`RegistryError::Encoding`] if the ticket cannot be encoded
    /// - [`RegistryError::Unavailable`] if the backend fails
    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    pub async fn add_ticket(&self, ticket: &Ticket) -> RegistryResult<()> {
        let start = Instant::now();
        let record = self.codec.to_record(ticket)?;
        let key = record.key.clone();

        match self.call("add_ticket", || self.backend.insert(record.clone())).await {
            Ok(()) => {},
            Err(StorageError::Conflict { .. }) => {
                self.metrics.record_duplicate();
                return Err(RegistryError::DuplicateTicket { id: ticket.id().to_owned() });
            },
            Err(e) => return Err(self.unavailable("add_ticket", e)),
        }

        self.metrics.record_add(start.elapsed());
        tracing::debug!("ticket added");
        self.audit_write(AuditAction::AddTicket, &key, ticket.kind()).await;
        Ok(())
    }

    /// Reads a ticket, requiring it to be assignable to `expected`.
    ///
    /// Returns `None` if the ticket is absent, expired (it is deleted with its descendants) or
    /// unreadable (logged at warn).
    ///
    /// # Errors
    ///
    /// - [`RegistryError::TicketTypeMismatch`] if the stored kind is not assignable to `expected`
    /// - [`RegistryError::Unavailable`] if the backend fails
    #[tracing::instrument(skip(self))]
    pub async fn get_ticket(&self, id: &str, expected: TicketKind) -> RegistryResult<Option<Ticket>> {
        self.lookup(id, Some(expected)).await
    }

    /// Reads a ticket of any kind. Same expiry and decoding rules as
    /// [`get_ticket`](Self::get_ticket).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn find_ticket(&self, id: &str) -> RegistryResult<Option<Ticket>> {
        self.lookup(id, None).await
    }

    /// Replaces a stored ticket. Returns `false` without writing if it no longer exists.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ConcurrentModification`] if conditional writes kept conflicting
    /// - [`RegistryError::Unavailable`] if the backend fails
    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id()))]
    pub async fn update_ticket(&self, ticket: &Ticket) -> RegistryResult<bool> {
        let start = Instant::now();
        let record = self.codec.to_record(ticket)?;
        let key = record.key.clone();

        let updated = match self.call("update_ticket", || self.backend.update(record.clone())).await {
            Ok(updated) => updated,
            Err(StorageError::Conflict { .. }) => {
                return Err(RegistryError::ConcurrentModification { id: ticket.id().to_owned() });
            },
            Err(e) => return Err(self.unavailable("update_ticket", e)),
        };

        if updated {
            self.metrics.record_update(start.elapsed());
            self.audit_write(AuditAction::UpdateTicket, &key, ticket.kind()).await;
        } else {
            tracing::debug!("update skipped, ticket no longer exists");
        }
        Ok(updated)
    }

    /// Reads a ticket, applies `mutate` and writes it back, serialized with other calls on the
    /// same id in this process.
    ///
    /// Returns the updated ticket, or `None` if the ticket was absent, expired, or deleted
    /// before the write.
    ///
    /// # Errors
    ///
    /// Propagates lookup and update errors, and any error returned by `mutate` (in which case
    /// nothing is written).
    pub async fn update_with<F>(&self, id: &str, expected: TicketKind, mutate: F) -> RegistryResult<Option<Ticket>>
    where
        F: FnOnce(&mut Ticket) -> RegistryResult<()> + Send,
    {
        let _guard = self.lock_for(id).lock().await;
        let Some(mut ticket) = self.lookup(id, Some(expected)).await? else {
            return Ok(None);
        };
        mutate(&mut ticket)?;
        Ok(self.update_ticket(&ticket).await?.then_some(ticket))
    }

    /// Deletes a ticket and, for granting tickets, everything it issued.
    ///
    /// Deleting an absent ticket returns [`Deletion::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the ticket itself cannot be read or removed.
    /// Descendant failures are reported through [`Deletion::PartiallyDeleted`].
    #[tracing::instrument(skip(self))]
    pub async fn delete_ticket(&self, id: &str) -> RegistryResult<Deletion> {
        if id.is_empty() {
            return Ok(Deletion::NotFound);
        }
        let key = self.codec.encode_ticket_id(id);
        self.delete_key(&key, AuditAction::DeleteTicket).await
    }

    /// Removes every ticket. Returns how many records were removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn delete_all(&self) -> RegistryResult<u64> {
        let removed =
            self.call("delete_all", || self.backend.clear()).await.map_err(|e| self.unavailable("delete_all", e))?;
        tracing::info!(removed, "registry cleared");
        let mut event = self.event(AuditAction::DeleteAll, "*", AuditResult::Success);
        event.metadata.insert("removed".to_owned(), removed.to_string());
        self.audit.log(&event).await;
        Ok(removed)
    }

    /// Every readable ticket, expired ones included. Unreadable records are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    pub async fn get_tickets(&self) -> RegistryResult<Vec<Ticket>> {
        self.get_tickets_matching(|_| true).await
    }

    /// Every readable ticket accepted by `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    pub async fn get_tickets_matching<P>(&self, predicate: P) -> RegistryResult<Vec<Ticket>>
    where
        P: Fn(&Ticket) -> bool + Send,
    {
        let records = self.scan_records().await?;
        Ok(records.iter().filter_map(|record| self.decode(record)).filter(|ticket| predicate(ticket)).collect())
    }

    /// Number of stored session tickets (TGTs), or `None` if the backend cannot count.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    pub async fn session_count(&self) -> RegistryResult<Option<u64>> {
        self.count(TicketKind::TicketGranting).await
    }

    /// Number of stored service and proxy tickets, or `None` if the backend cannot count.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    pub async fn service_ticket_count(&self) -> RegistryResult<Option<u64>> {
        let services = self.count(TicketKind::Service).await?;
        let proxies = self.count(TicketKind::Proxy).await?;
        Ok(services.zip(proxies).map(|(s, p)| s + p))
    }

    /// Number of sessions (TGTs) held by `principal_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn count_sessions_for(&self, principal_id: &str) -> RegistryResult<u64> {
        Ok(self.session_keys_for(principal_id).await?.len() as u64)
    }

    /// Deletes every session held by `principal_id`, with cascade. Returns how many sessions
    /// were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn delete_sessions_for(&self, principal_id: &str) -> RegistryResult<u64> {
        let mut deleted = 0;
        for key in self.session_keys_for(principal_id).await? {
            if self.delete_key(&key, AuditAction::DeleteTicket).await?.is_deleted() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Verifies that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if it is not.
    pub async fn health_check(&self) -> RegistryResult<()> {
        self.call("health_check", || self.backend.health_check())
            .await
            .map_err(|e| self.unavailable("health_check", e))
    }

    /// Flushes queued audit events. Call before process exit.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.audit_queue {
            queue.shutdown().await;
        }
    }

    /// Operation counters.
    #[must_use]
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// The codec used for storage keys and payloads.
    #[must_use]
    pub fn codec(&self) -> &TicketCodec {
        &self.codec
    }

    /// The registry's time source.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn TicketBackend> {
        &self.backend
    }

    /// Every stored record, undecoded.
    pub(crate) async fn scan_records(&self) -> RegistryResult<Vec<TicketRecord>> {
        self.call("scan", || self.backend.scan()).await.map_err(|e| self.unavailable("scan", e))
    }

    /// Reads one record by storage key.
    pub(crate) async fn get_record(&self, key: &str) -> RegistryResult<Option<TicketRecord>> {
        self.call("get_record", || self.backend.get(key)).await.map_err(|e| self.unavailable("get_record", e))
    }

    /// Removes one record by storage key without cascading.
    pub(crate) async fn remove_record(&self, key: &str, action: AuditAction) -> RegistryResult<bool> {
        let removed =
            self.call("remove_record", || self.backend.remove(key)).await.map_err(|e| self.unavailable("remove", e))?;
        if removed {
            self.audit.log(&self.event(action, key, AuditResult::Success)).await;
        }
        Ok(removed)
    }

    /// Bulk-removes expired records where the backend supports it.
    pub(crate) async fn remove_expired(&self, now: DateTime<Utc>) -> RegistryResult<Option<u64>> {
        self.call("remove_expired", || self.backend.remove_expired(now))
            .await
            .map_err(|e| self.unavailable("remove_expired", e))
    }

    /// Decodes a record, logging and counting failures.
    pub(crate) fn decode(&self, record: &TicketRecord) -> Option<Ticket> {
        match self.codec.from_record(record) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                self.metrics.record_decode_failure();
                tracing::warn!(key = %record.key, error = %e, "skipping undecodable ticket record");
                None
            },
        }
    }

    /// Deletes the ticket stored under `key` with cascade.
    pub(crate) async fn delete_key(&self, key: &str, action: AuditAction) -> RegistryResult<Deletion> {
        let start = Instant::now();
        let Some(record) = self.get_record(key).await? else {
            return Ok(Deletion::NotFound);
        };

        let mut plan = Vec::new();
        if let Some(ticket) = self.decode(&record)
            && let Some(granting) = ticket.as_granting()
        {
            let mut visited = HashSet::from([key.to_owned()]);
            self.plan_cascade(granting, &mut plan, &mut visited).await;
        }

        let removal = tokio::time::timeout(self.operation_timeout, self.backend.remove_cascade(&plan, key))
            .await
            .map_err(|_elapsed| {
                self.metrics.record_timeout();
                self.unavailable("delete_ticket", StorageError::timeout())
            })?;

        let mut removed = 0;
        let mut failures = Vec::new();
        for (descendant, result) in removal.descendants {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {},
                Err(e) => failures.push((descendant, e.to_string())),
            }
        }
        let parent_removed = removal.parent.map_err(|e| self.unavailable("delete_ticket", e))?;
        if parent_removed {
            removed += 1;
        } else if removed == 0 && failures.is_empty() {
            return Ok(Deletion::NotFound);
        }

        self.metrics.record_delete(start.elapsed(), removed as u64);
        let mut event = self.event(action, key, AuditResult::Success);
        event.metadata.insert("kind".to_owned(), record.kind.to_string());
        event.metadata.insert("removed".to_owned(), removed.to_string());

        if failures.is_empty() {
            tracing::debug!(removed, "ticket deleted");
            self.audit.log(&event).await;
            return Ok(Deletion::Deleted { removed });
        }

        self.metrics.record_partial_deletion();
        tracing::warn!(removed, failed = failures.len(), "cascade deletion left descendants behind");
        event.metadata.insert("failed".to_owned(), failures.len().to_string());
        self.audit.log(&event).await;
        Ok(Deletion::PartiallyDeleted {
            removed,
            failure: CascadeDeletionPartialFailure { ticket_id: key.to_owned(), failures },
        })
    }

    /// Appends the storage keys of everything `granting` issued, in cascade order.
    fn plan_cascade<'a>(
        &'a self,
        granting: &'a TicketGrantingTicket,
        plan: &'a mut Vec<String>,
        visited: &'a mut HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for child in granting.services().keys() {
                let key = self.codec.encode_ticket_id(child);
                if visited.insert(key.clone()) {
                    plan.push(key);
                }
            }
            for pgt in granting.proxy_granting_tickets() {
                let key = self.codec.encode_ticket_id(pgt);
                if !visited.insert(key.clone()) {
                    continue;
                }
                match self.get_record(&key).await {
                    Ok(Some(record)) => {
                        if let Some(ticket) = self.decode(&record)
                            && let Some(nested) = ticket.as_granting()
                        {
                            self.plan_cascade(nested, plan, visited).await;
                        }
                    },
                    Ok(None) => {},
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "cannot read proxy-granting ticket, its descendants may remain");
                    },
                }
                plan.push(key);
            }
        })
    }

    async fn lookup(&self, id: &str, expected: Option<TicketKind>) -> RegistryResult<Option<Ticket>> {
        let start = Instant::now();
        if id.is_empty() {
            return Ok(None);
        }
        let key = self.codec.encode_ticket_id(id);

        let record = match self.call("get_ticket", || self.backend.get(&key)).await {
            Ok(record) => record,
            Err(e @ StorageError::Serialization { .. }) => {
                self.metrics.record_decode_failure();
                tracing::warn!(error = %e, "stored record is unreadable");
                None
            },
            Err(e) => return Err(self.unavailable("get_ticket", e)),
        };
        let Some(ticket) = record.as_ref().and_then(|record| self.decode(record)) else {
            self.metrics.record_read(start.elapsed(), false);
            return Ok(None);
        };

        if let Some(expected) = expected
            && !ticket.kind().is_assignable_to(expected)
        {
            return Err(RegistryError::TicketTypeMismatch { id: id.to_owned(), expected, actual: ticket.kind() });
        }

        if ticket.is_expired(self.now()) {
            self.metrics.record_expired_on_read();
            self.metrics.record_read(start.elapsed(), false);
            tracing::debug!(kind = %ticket.kind(), "ticket expired, deleting");
            if let Err(e) = self.delete_key(&key, AuditAction::ExpireTicket).await {
                tracing::warn!(error = %e, "failed to delete expired ticket");
            }
            return Ok(None);
        }

        self.metrics.record_read(start.elapsed(), true);
        Ok(Some(ticket))
    }

    async fn count(&self, kind: TicketKind) -> RegistryResult<Option<u64>> {
        self.call("count", || self.backend.count(kind)).await.map_err(|e| self.unavailable("count", e))
    }

    async fn session_keys_for(&self, principal_id: &str) -> RegistryResult<Vec<String>> {
        let principal_key = self.codec.encode_principal_id(principal_id);
        let records = self
            .call("find_by_principal", || self.backend.find_by_principal(&principal_key))
            .await
            .map_err(|e| self.unavailable("find_by_principal", e))?;
        Ok(records.into_iter().filter(|r| r.kind == TicketKind::TicketGranting).map(|r| r.key).collect())
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        with_retry_timeout(&self.retry, self.operation_timeout, &self.metrics, operation, f).await
    }

    fn unavailable(&self, operation: &'static str, err: StorageError) -> RegistryError {
        self.metrics.record_unavailable();
        tracing::warn!(operation, backend = self.backend.name(), error = %err, "ticket backend unavailable");
        RegistryError::unavailable(operation, err)
    }

    pub(crate) fn lock_for(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    fn event(&self, action: AuditAction, resource: &str, result: AuditResult) -> AuditEvent {
        AuditEvent::builder()
            .timestamp(self.now())
            .actor(self.actor.as_str())
            .action(action)
            .resource(resource)
            .result(result)
            .build()
    }

    async fn audit_write(&self, action: AuditAction, resource: &str, kind: TicketKind) {
        let mut event = self.event(action, resource, AuditResult::Success);
        event.metadata.insert("kind".to_owned(), kind.to_string());
        self.audit.log(&event).await;
    }
}

impl std::fmt::Debug for TicketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketRegistry")
            .field("backend", &self.backend.name())
            .field("cipher", &self.codec.is_enabled())
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        MemoryTicketBackend,
        clock::ManualClock,
        expiration::ExpirationPolicy,
        ticket::{Authentication, Principal, ServiceTicket},
    };

    fn registry(clock: ManualClock) -> TicketRegistry {
        TicketRegistry::builder().backend(Arc::new(MemoryTicketBackend::new())).clock(Arc::new(clock)).build()
    }

    fn tgt(id: &str, clock: &ManualClock) -> TicketGrantingTicket {
        let auth = Authentication::builder().principal(Principal::new("casuser")).build();
        TicketGrantingTicket::new(id, auth, ExpirationPolicy::NeverExpires, clock.now())
    }

    #[tokio::test]
    async fn expired_ticket_reads_as_none_and_is_removed() {
        let clock = ManualClock::default();
        let registry = registry(clock.clone());
        let st: Ticket = ServiceTicket::new(
            "ST-1",
            "TGT-1",
            "https://app.example.org".into(),
            false,
            ExpirationPolicy::single_use(Duration::from_secs(10)),
            clock.now(),
        )
        .into();
        registry.add_ticket(&st).await.unwrap();

        clock.advance(Duration::from_secs(11));
        assert!(registry.get_ticket("ST-1", TicketKind::Service).await.unwrap().is_none());
        assert!(matches!(registry.delete_ticket("ST-1").await.unwrap(), Deletion::NotFound));
        assert_eq!(registry.metrics().snapshot().expired_on_read, 1);
    }

    #[tokio::test]
    async fn update_with_serializes_mutation() {
        let clock = ManualClock::default();
        let registry = Arc::new(registry(clock.clone()));
        registry.add_ticket(&tgt("TGT-1", &clock).into()).await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..16 {
            let registry = Arc::clone(&registry);
            let now = clock.now();
            tasks.push(tokio::spawn(async move {
                registry
                    .update_with("TGT-1", TicketKind::TicketGranting, |ticket| {
                        if let Some(tgt) = ticket.as_granting_mut() {
                            tgt.grant_service_ticket(format!("ST-{n}"), "https://app.example.org".into(), now);
                        }
                        Ok(())
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        let stored = registry.get_ticket("TGT-1", TicketKind::TicketGranting).await.unwrap().unwrap();
        let tgt = stored.as_granting().unwrap();
        assert_eq!(tgt.services().len(), 16, "no grant was lost");
        assert_eq!(tgt.state().count_of_uses(), 16);
    }

    #[tokio::test]
    async fn update_with_error_writes_nothing() {
        let clock = ManualClock::default();
        let registry = registry(clock.clone());
        registry.add_ticket(&tgt("TGT-1", &clock).into()).await.unwrap();

        let err = registry
            .update_with("TGT-1", TicketKind::TicketGranting, |ticket| {
                ticket.record_use(Utc::now());
                Err(RegistryError::InvalidTicket { id: "TGT-1".to_owned(), reason: "rejected".to_owned() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTicket { .. }));

        let stored = registry.find_ticket("TGT-1").await.unwrap().unwrap();
        assert_eq!(stored.state().count_of_uses(), 0);
    }

    #[tokio::test]
    async fn sessions_are_found_by_principal() {
        let clock = ManualClock::default();
        let registry = registry(clock.clone());
        registry.add_ticket(&tgt("TGT-1", &clock).into()).await.unwrap();
        registry.add_ticket(&tgt("TGT-2", &clock).into()).await.unwrap();

        assert_eq!(registry.count_sessions_for("casuser").await.unwrap(), 2);
        assert_eq!(registry.count_sessions_for("someone-else").await.unwrap(), 0);
        assert_eq!(registry.delete_sessions_for("casuser").await.unwrap(), 2);
        assert_eq!(registry.session_count().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn from_config_wires_cipher() {
        let (encryption, signing) = crate::cipher::generate_base64_keys();
        let config = RegistryConfig::builder()
            .cipher(
                crate::CipherConfig::builder().enabled(true).encryption_key(encryption).signing_key(signing).build(),
            )
            .build()
            .unwrap();
        let backend = Arc::new(MemoryTicketBackend::new());
        let registry = TicketRegistry::from_config(&config, backend.clone(), Arc::new(SystemClock)).unwrap();
        assert!(registry.codec().is_enabled());

        let clock = ManualClock::default();
        registry.add_ticket(&tgt("TGT-1", &clock).into()).await.unwrap();
        assert!(backend.get("TGT-1").await.unwrap().is_none(), "stored under the digest");
        assert!(registry.find_ticket("TGT-1").await.unwrap().is_some());
        registry.shutdown().await;
    }
}
