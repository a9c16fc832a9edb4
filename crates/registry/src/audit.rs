//! Audit trail for registry mutations.
//!
//! Every ticket creation, update, deletion and expiry is recorded as an [`AuditEvent`]: who
//! acted (the node), what was done, to which ticket, and whether it worked. Events carry the
//! ticket's storage key rather than its id, so an audit sink never learns a live credential
//! when the cipher is enabled.
//!
//! # Loggers
//!
//! - [`TracingAuditLogger`]: structured `tracing` events at INFO under the `audit` target
//! - [`NoopAuditLogger`]: discards events
//! - [`AsyncAuditLogger`]: queues events for a background writer so registry calls never wait
//!   on a slow sink
//!
//! # Usage
//!
//! ```no_run
//! use tessera_registry::audit::{
//!     AuditAction, AuditEvent, AuditLogger, AuditResult, TracingAuditLogger,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let logger = TracingAuditLogger;
//! let event = AuditEvent::builder()
//!     .actor("cas-node-1")
//!     .action(AuditAction::DeleteTicket)
//!     .resource("TGT-1-abc")
//!     .result(AuditResult::Success)
//!     .build();
//! logger.log(&event).await;
//! # });
//! ```

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

/// Mutation performed on the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// A ticket was stored.
    AddTicket,
    /// A stored ticket was replaced.
    UpdateTicket,
    /// A ticket and its descendants were deleted.
    DeleteTicket,
    /// Every ticket was deleted.
    DeleteAll,
    /// A ticket was removed because it expired.
    ExpireTicket,
    /// A change received from another node was applied.
    ApplyReplicated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddTicket => write!(f, "add_ticket"),
            Self::UpdateTicket => write!(f, "update_ticket"),
            Self::DeleteTicket => write!(f, "delete_ticket"),
            Self::DeleteAll => write!(f, "delete_all"),
            Self::ExpireTicket => write!(f, "expire_ticket"),
            Self::ApplyReplicated => write!(f, "apply_replicated"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditResult {
    /// Operation completed successfully.
    Success,
    /// Operation failed with the given reason.
    Failure(String),
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// Structured audit event.
#[derive(Debug, Clone, bon::Builder)]
pub struct AuditEvent {
    /// When the event occurred (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// Node or component performing the operation.
    #[builder(into)]
    pub actor: String,
    /// The action that was performed.
    pub action: AuditAction,
    /// Storage key of the affected ticket, or `*` for registry-wide actions.
    #[builder(into)]
    pub resource: String,
    /// Outcome of the operation.
    pub result: AuditResult,
    /// Additional context (ticket kind, number of removed descendants).
    #[builder(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Sink for audit events.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Records an audit event.
    async fn log(&self, event: &AuditEvent);
}

#[async_trait]
impl<L: AuditLogger + ?Sized> AuditLogger for Arc<L> {
    async fn log(&self, event: &AuditEvent) {
        (**self).log(event).await;
    }
}

/// Audit logger that emits structured `tracing` events.
///
/// Field mapping:
/// - `audit.timestamp`: RFC 3339 timestamp
/// - `audit.actor`: who performed the action
/// - `audit.action`: the operation (e.g. `delete_ticket`)
/// - `audit.resource`: the ticket's storage key
/// - `audit.result`: `success` or `failure: ...`
/// - `audit.metadata`: `k=v` pairs
#[derive(Debug, Clone, Copy)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        let metadata = event.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");

        tracing::info!(
            audit.timestamp = %event.timestamp.to_rfc3339(),
            audit.actor = %event.actor,
            audit.action = %event.action,
            audit.resource = %event.resource,
            audit.result = %event.result,
            audit.metadata = %metadata,
            "audit_event"
        );
    }
}

/// Audit logger that discards events.
#[derive(Debug, Clone, Copy)]
pub struct NoopAuditLogger;

#[async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _event: &AuditEvent) {}
}

/// Audit logger that hands events to a background task.
///
/// [`log`](AuditLogger::log) only enqueues. Call [`shutdown`](Self::shutdown) before exit to
/// flush the queue; events logged after shutdown are written inline.
pub struct AsyncAuditLogger {
    inner: Arc<dyn AuditLogger>,
    sender: Mutex<Option<mpsc::UnboundedSender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncAuditLogger {
    /// Starts the background writer for `inner`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(inner: Arc<dyn AuditLogger>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditEvent>();
        let writer = Arc::clone(&inner);
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                writer.log(&event).await;
            }
        });
        Self { inner, sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
    }

    /// Stops accepting queued events and waits until every queued event is written.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::error!(error = %e, "audit writer task failed");
        }
    }
}

impl fmt::Debug for AsyncAuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncAuditLogger").field("running", &self.sender.lock().is_some()).finish_non_exhaustive()
    }
}

#[async_trait]
impl AuditLogger for AsyncAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(event.clone()).err().map(|e| e.0),
            None => Some(event.clone()),
        };
        if let Some(event) = rejected {
            self.inner.log(&event).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    /// Records every event it receives.
    #[derive(Default)]
    struct Recording(Mutex<Vec<AuditEvent>>);

    #[async_trait]
    impl AuditLogger for Recording {
        async fn log(&self, event: &AuditEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn event(action: AuditAction) -> AuditEvent {
        AuditEvent::builder().actor("node-a").action(action).resource("TGT-1").result(AuditResult::Success).build()
    }

    #[test]
    fn action_and_result_display() {
        assert_eq!(AuditAction::AddTicket.to_string(), "add_ticket");
        assert_eq!(AuditAction::ExpireTicket.to_string(), "expire_ticket");
        assert_eq!(AuditAction::ApplyReplicated.to_string(), "apply_replicated");
        assert_eq!(AuditResult::Failure("timeout".to_owned()).to_string(), "failure: timeout");
    }

    #[test]
    fn builder_defaults() {
        let event = event(AuditAction::DeleteAll);
        assert!(event.metadata.is_empty());
        assert!((Utc::now() - event.timestamp).num_seconds() < 2);
    }

    /// Collects `name=value` for every field of every event.
    #[derive(Clone, Default)]
    struct FieldCollector(Arc<Mutex<Vec<String>>>);

    impl tracing::field::Visit for FieldCollector {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.lock().push(format!("{}={value:?}", field.name()));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FieldCollector {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            event.record(&mut self.clone());
        }
    }

    #[tokio::test]
    async fn tracing_logger_emits_audit_fields() {
        let fields = FieldCollector::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        TracingAuditLogger.log(&event(AuditAction::UpdateTicket)).await;
        NoopAuditLogger.log(&event(AuditAction::UpdateTicket)).await;

        let recorded = fields.0.lock();
        for expected in ["audit.actor=node-a", "audit.action=update_ticket", "audit.resource=TGT-1", "audit.result=success"] {
            assert!(recorded.iter().any(|f| f == expected), "missing {expected}, recorded: {recorded:?}");
        }
        assert_eq!(recorded.iter().filter(|f| f.starts_with("audit.action=")).count(), 1, "noop logger emits nothing");
    }

    #[tokio::test]
    async fn async_logger_drains_on_shutdown() {
        let recording = Arc::new(Recording::default());
        let logger = AsyncAuditLogger::new(Arc::clone(&recording) as Arc<dyn AuditLogger>);

        for _ in 0..50 {
            logger.log(&event(AuditAction::AddTicket)).await;
        }
        logger.shutdown().await;
        assert_eq!(recording.0.lock().len(), 50);

        logger.log(&event(AuditAction::DeleteTicket)).await;
        assert_eq!(recording.0.lock().len(), 51, "writes inline after shutdown");
    }
}
