//! Relational [`TicketBackend`](tessera_registry::TicketBackend) for the tessera ticket registry.
//!
//! [`SqlTicketBackend`] stores one row per ticket in SQLite through `rusqlite`. Compared with
//! the in-memory and key-value backends it adds durability, a transactional cascade and
//! indexed counters:
//!
//! | Registry operation | SQL |
//! |--------------------|-----|
//! | add | `INSERT`, a primary-key violation becomes `StorageError::Conflict` |
//! | update | `UPDATE ... WHERE key = ?`, zero rows changed means the ticket is gone |
//! | delete (cascade) | one transaction, descendants first, parent row last |
//! | session / service counts | `SELECT COUNT(*) ... WHERE kind = ?` |
//! | sessions of a principal | `SELECT ... WHERE principal_key = ?` |
//! | cleaner fast path | `DELETE ... WHERE expires_at < ?` |
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera_registry::TicketRegistry;
//! use tessera_registry_sql::{SqlBackendConfig, SqlTicketBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqlTicketBackend::open(&SqlBackendConfig::builder().build()?)?;
//! let registry = TicketRegistry::builder().backend(Arc::new(backend)).build();
//! # let _ = registry;
//! # Ok(())
//! # }
//! ```
//!
//! Busy or locked databases surface as transient connection errors, so the registry's retry
//! policy applies to them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod error;
mod schema;

/// SQLite-backed ticket backend.
pub use backend::SqlTicketBackend;
/// Configuration types and defaults.
pub use config::{DEFAULT_BUSY_TIMEOUT, DatabaseLocation, SqlBackendConfig};
/// SQL-specific error types and result alias.
pub use error::{Result, SqlStorageError};
