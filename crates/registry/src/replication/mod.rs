//! Cross-node replication of registry changes.
//!
//! Each node wraps its local backend in a [`ReplicatingBackend`], which publishes an event on
//! a [`MessageBus`] after every successful write, and runs a [`ReplicationListener`] that
//! applies peers' events to the same local backend, undecorated.
//!
//! A node recognizes its own events two ways: by origin id, and by the event ids it recently
//! published ([`PublishedEvents`]). The second catches echoes relayed under another origin.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera_registry::{
//!     MemoryTicketBackend, RegistryMetrics, TicketRegistry,
//!     config::ReplicationConfig,
//!     replication::{BroadcastBus, ReplicationNode},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let bus = Arc::new(BroadcastBus::default());
//! let local = Arc::new(MemoryTicketBackend::new());
//! let node = ReplicationNode::from_config(&ReplicationConfig::default(), RegistryMetrics::new());
//!
//! let listener = Arc::new(node.listener(local.clone()));
//! let _task = listener.spawn(bus.as_ref(), CancellationToken::new());
//!
//! let registry = TicketRegistry::builder().backend(Arc::new(node.publisher(local, bus))).build();
//! # let _ = registry;
//! # });
//! ```

mod bus;
mod event;
mod listener;
mod publisher;

use std::sync::Arc;

pub use bus::{BroadcastBus, MessageBus, Subscription};
pub use event::{PublisherIdentifier, ReplicationEvent, ReplicationOperation};
pub use listener::{Applied, ReplicationListener};
pub use publisher::{PublishedEvents, ReplicatingBackend};

use crate::{backend::TicketBackend, config::ReplicationConfig, metrics::RegistryMetrics};

/// Identity and loop-suppression state shared by one node's publisher and listener.
#[derive(Debug, Clone)]
pub struct ReplicationNode {
    origin: PublisherIdentifier,
    published: PublishedEvents,
    metrics: RegistryMetrics,
}

impl ReplicationNode {
    /// Creates the node state described by `config`.
    ///
    /// A random identifier is used when `config.node_id` is unset.
    #[must_use]
    pub fn from_config(config: &ReplicationConfig, metrics: RegistryMetrics) -> Self {
        let origin = config.node_id.as_deref().map_or_else(PublisherIdentifier::random, PublisherIdentifier::new);
        Self {
            origin,
            published: PublishedEvents::new(config.tracked_event_capacity, config.tracked_event_ttl),
            metrics,
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn origin(&self) -> &PublisherIdentifier {
        &self.origin
    }

    /// Decorates `backend` so its writes are published on `bus`.
    #[must_use]
    pub fn publisher<B: TicketBackend>(&self, backend: B, bus: Arc<dyn MessageBus>) -> ReplicatingBackend<B> {
        ReplicatingBackend::new(backend, bus, self.origin.clone(), self.published.clone(), self.metrics.clone())
    }

    /// A listener applying peers' events to `backend`.
    ///
    /// `backend` must be the undecorated backend, not the one returned by
    /// [`publisher`](Self::publisher).
    #[must_use]
    pub fn listener(&self, backend: Arc<dyn TicketBackend>) -> ReplicationListener {
        ReplicationListener::builder()
            .backend(backend)
            .origin(self.origin.clone())
            .published(self.published.clone())
            .metrics(self.metrics.clone())
            .build()
    }
}
