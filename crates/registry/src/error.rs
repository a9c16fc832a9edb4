//! Error types for the ticket registry and its storage backends.
//!
//! Two layers of errors exist:
//!
//! - [`StorageError`] is produced by [`TicketBackend`](crate::backend::TicketBackend) and
//!   [`KeyValueStore`](crate::kv::KeyValueStore) implementations. Every adapter maps its native
//!   errors onto these variants.
//! - [`RegistryError`] is what callers of [`TicketRegistry`](crate::TicketRegistry) see. Storage
//!   failures are never folded into "not found": they surface as [`RegistryError::Unavailable`].
//!
//! [`ConfigError`] is returned by configuration builders when a value is out of range.
//!
//! # Example
//!
//! ```
//! use tessera_registry::{RegistryError, StorageError};
//!
//! let err = RegistryError::unavailable("get_ticket", StorageError::timeout());
//! assert!(err.is_unavailable());
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::ticket::TicketKind;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur inside a storage backend.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions must include a
/// wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A conditional write lost against a concurrent modification, or an insert hit an
    /// existing key.
    #[error("Conflict on key {key}")]
    Conflict {
        /// The contested key.
        key: String,
    },

    /// Connection or network error. Transient.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Data could not be encoded for storage or decoded when retrieved.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Backend-specific error that does not fit other categories.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its time limit. Transient.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error for the given key.
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for failures that may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Returns `true` for conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors returned by [`TicketRegistry`](crate::TicketRegistry) and
/// [`TicketIssuer`](crate::TicketIssuer).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A ticket with this id already exists. Retry with a freshly generated id.
    #[error("ticket {id} already exists")]
    DuplicateTicket {
        /// The colliding id.
        id: String,
    },

    /// The stored ticket is not assignable to the requested kind.
    #[error("ticket {id} is a {actual}, expected {expected}")]
    TicketTypeMismatch {
        /// The requested id.
        id: String,
        /// The kind the caller asked for.
        expected: TicketKind,
        /// The kind actually stored.
        actual: TicketKind,
    },

    /// A stored payload could not be verified, decrypted or deserialized.
    #[error("failed to decode ticket {id}: {message}")]
    DecodeFailure {
        /// The id (or storage key) of the corrupt record.
        id: String,
        /// What went wrong.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The backend could not be reached or did not answer in time.
    #[error("ticket registry unavailable during {operation}")]
    Unavailable {
        /// The registry operation that failed.
        operation: &'static str,
        /// The storage failure.
        #[source]
        source: StorageError,
    },

    /// A ticket could not be serialized or encrypted for storage.
    #[error("failed to encode ticket: {message}")]
    Encoding {
        /// What went wrong.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A conditional write kept losing against concurrent writers.
    #[error("ticket {id} was modified concurrently")]
    ConcurrentModification {
        /// The contested id.
        id: String,
    },

    /// A ticket required by an issuance operation does not exist or has expired.
    #[error("ticket {id} not found")]
    TicketNotFound {
        /// The missing id.
        id: String,
    },

    /// A ticket exists but cannot be used for the requested operation.
    #[error("ticket {id} is not valid: {reason}")]
    InvalidTicket {
        /// The offending id.
        id: String,
        /// Why the ticket was rejected.
        reason: String,
    },

    /// Every generated id collided with an existing ticket.
    #[error("ticket id generation failed after {attempts} attempts")]
    IdGenerationExhausted {
        /// How many ids were tried.
        attempts: u32,
    },
}

impl RegistryError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(operation: &'static str, source: StorageError) -> Self {
        Self::Unavailable { operation, source }
    }

    /// Creates a new `DecodeFailure` error with a source.
    #[must_use]
    pub fn decode_failure(
        id: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DecodeFailure { id: id.into(), message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Encoding` error with a source.
    #[must_use]
    pub fn encoding(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Encoding { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if the backend was unreachable.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns `true` if the error is an id collision.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateTicket { .. })
    }
}

/// One or more descendants could not be removed while cascading a deletion.
///
/// Carried by [`Deletion::PartiallyDeleted`](crate::Deletion::PartiallyDeleted). The parent
/// ticket is still removed.
#[derive(Debug, Error)]
pub struct CascadeDeletionPartialFailure {
    /// The ticket whose deletion was requested.
    pub ticket_id: String,
    /// Descendants that could not be removed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl fmt::Display for CascadeDeletionPartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cascade deletion of {} left {} descendant(s) behind",
            self.ticket_id,
            self.failures.len()
        )
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The field name.
        field: &'static str,
        /// The minimum allowed value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A duration or count must be greater than zero.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// The field name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A required value is missing.
    #[error("{field} is required")]
    Missing {
        /// The field name.
        field: &'static str,
    },

    /// A value is malformed.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// The field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StorageError::connection("refused").is_transient());
        assert!(StorageError::timeout().is_transient());
        assert!(!StorageError::conflict("k").is_transient());
        assert!(!StorageError::serialization("bad").is_transient());
        assert!(!StorageError::not_found("k").is_transient());
        assert!(!StorageError::internal("boom").is_transient());
    }

    #[test]
    fn unavailable_keeps_storage_source() {
        let err = RegistryError::unavailable(
            "add_ticket",
            StorageError::connection_with_source("down", std::io::Error::other("reset")),
        );
        assert!(err.is_unavailable());
        let source = err.source().expect("storage source");
        assert!(source.to_string().contains("down"));
        assert!(source.source().is_some(), "io error should be chained");
    }

    #[test]
    fn type_mismatch_message_names_both_kinds() {
        let err = RegistryError::TicketTypeMismatch {
            id: "ST-1".to_owned(),
            expected: TicketKind::TicketGranting,
            actual: TicketKind::Service,
        };
        assert_eq!(err.to_string(), "ticket ST-1 is a ST, expected TGT");
    }

    #[test]
    fn partial_failure_display_counts_failures() {
        let failure = CascadeDeletionPartialFailure {
            ticket_id: "TGT-1".to_owned(),
            failures: vec![("ST-1".to_owned(), "timeout".to_owned())],
        };
        assert_eq!(failure.to_string(), "cascade deletion of TGT-1 left 1 descendant(s) behind");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "suffix_length",
            min: "16".to_owned(),
            value: "4".to_owned(),
        };
        assert_eq!(err.to_string(), "suffix_length must be at least 16, got 4");
    }
}
