//! Ticket registry for single-sign-on sessions.
//!
//! A user's login creates a ticket-granting ticket (TGT). Each application the user visits
//! receives a short-lived service ticket (ST) issued by that TGT; proxying applications obtain
//! proxy-granting tickets (PGT) and hand out proxy tickets (PT). The [`TicketRegistry`] stores
//! all of them, hides expired ones, and revokes a whole session at once by cascading a
//! deletion from the TGT to everything it issued.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │         TicketIssuer (id generation, granting)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     TicketRegistry                          │
//! │   expiry on read │ cascade delete │ audit │ metrics │ retry │
//! ├─────────────────────────────────────────────────────────────┤
//! │          TicketCodec (id digest, encrypt + sign)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │       ReplicatingBackend (optional, publishes writes)       │
//! ├───────────────┬───────────────────────┬─────────────────────┤
//! │ Memory        │ KeyValue<S>           │ Sql                 │
//! │ (default)     │ (native TTL, CAS)     │ (registry-sql crate)│
//! └───────────────┴───────────────────────┴─────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera_registry::{MemoryTicketBackend, Service, TicketIssuer, TicketKind, TicketRegistry};
//! use tessera_registry::ticket::{Authentication, Principal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(TicketRegistry::builder().backend(Arc::new(MemoryTicketBackend::new())).build());
//!     let issuer = TicketIssuer::builder().registry(Arc::clone(&registry)).build();
//!
//!     let auth = Authentication::builder().principal(Principal::new("casuser")).build();
//!     let tgt = issuer.create_ticket_granting_ticket(auth).await?;
//!     let st = issuer.grant_service_ticket(tgt.id(), Service::from("https://app.example.org"), true).await?;
//!
//!     assert!(registry.get_ticket(st.id(), TicketKind::Service).await?.is_some());
//!
//!     // Logging out revokes everything the session issued.
//!     let _ = registry.delete_ticket(tgt.id()).await?;
//!     assert!(registry.find_ticket(st.id()).await?.is_none());
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! | Backend | Use Case | Persistence |
//! |---------|----------|-------------|
//! | [`MemoryTicketBackend`] | Single node, or replicated with [`replication`] | No |
//! | [`KeyValueTicketBackend`](kv::KeyValueTicketBackend) | Shared key-value store with TTL | Store-dependent |
//! | `SqlTicketBackend` (in `tessera-registry-sql`) | Relational database | Yes |
//!
//! New backends implement [`TicketBackend`] and should pass the [`conformance`] suite.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (fixtures, [`FaultyBackend`](testutil::FaultyBackend),
//!   assertion macros) and the `conformance` suite.
//! - **`failpoints`**: Compiles `fail` failpoints into retry and the in-memory key-value store.

#![deny(unsafe_code)]

pub mod audit;
pub mod backend;
pub mod cipher;
pub mod cleaner;
pub mod clock;
pub mod codec;
pub mod config;
#[cfg(feature = "testutil")]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub mod conformance;
pub mod error;
pub mod expiration;
pub mod issuer;
pub mod kv;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod replication;
mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod ticket;
pub mod ticket_id;

pub use backend::{TicketBackend, TicketRecord};
pub use cleaner::{CleanupOutcome, CleanupReport, TicketRegistryCleaner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CipherConfig, CleanerConfig, RegistryConfig, ReplicationConfig, RetryConfig, TicketIdConfig};
pub use error::{
    BoxError, CascadeDeletionPartialFailure, ConfigError, RegistryError, RegistryResult, StorageError, StorageResult,
};
pub use expiration::ExpirationPolicy;
pub use issuer::{IssuancePolicies, TicketIssuer};
pub use memory::MemoryTicketBackend;
pub use metrics::{LatencyPercentiles, MetricsSnapshot, RegistryMetrics};
pub use registry::{Deletion, TicketRegistry};
pub use ticket::{Service, ServiceTicket, Ticket, TicketGrantingTicket, TicketKind};
pub use zeroize::Zeroizing;
