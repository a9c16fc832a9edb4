//! Error types for the SQL ticket backend.
//!
//! [`SqlStorageError`] wraps SQLite and task errors and maps them onto the generic
//! [`StorageError`] so the registry can tell transient failures (a locked database) from
//! permanent ones.

use rusqlite::ErrorCode;
use tessera_registry::StorageError;
use thiserror::Error;

/// Result type alias for SQL backend operations.
pub type Result<T> = std::result::Result<T, SqlStorageError>;

/// Errors specific to the SQL ticket backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqlStorageError {
    /// Error returned by SQLite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The blocking task running the statement panicked or was cancelled.
    #[error("Database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A stored row cannot be turned back into a record.
    #[error("Corrupt row for key {key}: {message}")]
    CorruptRow {
        /// Key of the offending row.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

impl SqlStorageError {
    /// Returns `true` if SQLite reported the database as busy or locked.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Sqlite(err) if is_busy(err))
    }
}

/// Returns `true` for `SQLITE_BUSY` and `SQLITE_LOCKED`.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
}

/// Returns `true` for constraint violations (duplicate primary key).
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

impl From<SqlStorageError> for StorageError {
    fn from(err: SqlStorageError) -> Self {
        match err {
            SqlStorageError::Sqlite(source) => sqlite_error_to_storage_error(source),
            SqlStorageError::Task(source) => StorageError::internal_with_source("database task failed", source),
            SqlStorageError::CorruptRow { key, message } => {
                StorageError::serialization(format!("corrupt row {key}: {message}"))
            },
        }
    }
}

fn sqlite_error_to_storage_error(err: rusqlite::Error) -> StorageError {
    if is_busy(&err) {
        return StorageError::connection_with_source("database is busy", err);
    }
    if is_constraint_violation(&err) {
        return StorageError::conflict(err.to_string());
    }
    match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen | ErrorCode::SystemIoFailure) => {
            StorageError::connection_with_source("cannot access database", err)
        },
        _ => match err {
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                StorageError::serialization_with_source("unreadable column", err)
            },
            other => StorageError::internal_with_source("SQLite error", other),
        },
    }
}

/// A storage error describing `err` without taking ownership of it.
///
/// Used when one failure has to be reported for several keys.
pub(crate) fn describe(err: &SqlStorageError) -> StorageError {
    if err.is_busy() {
        StorageError::connection(err.to_string())
    } else {
        StorageError::internal(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn busy_maps_to_transient_connection() {
        let err: StorageError = SqlStorageError::from(sqlite_failure(ffi::SQLITE_BUSY)).into();
        assert!(matches!(err, StorageError::Connection { .. }));
        assert!(err.is_transient());

        let err: StorageError = SqlStorageError::from(sqlite_failure(ffi::SQLITE_LOCKED)).into();
        assert!(err.is_transient());
    }

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err: StorageError = SqlStorageError::from(sqlite_failure(ffi::SQLITE_CONSTRAINT)).into();
        assert!(err.is_conflict());
    }

    #[test]
    fn corrupt_row_maps_to_serialization() {
        let err: StorageError =
            SqlStorageError::CorruptRow { key: "TGT-1".into(), message: "unknown kind".into() }.into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn other_failures_are_internal() {
        let err: StorageError = SqlStorageError::from(sqlite_failure(ffi::SQLITE_CORRUPT)).into();
        assert!(matches!(err, StorageError::Internal { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn describe_keeps_transience() {
        let busy = SqlStorageError::from(sqlite_failure(ffi::SQLITE_BUSY));
        assert!(describe(&busy).is_transient());
        let corrupt = SqlStorageError::from(sqlite_failure(ffi::SQLITE_CORRUPT));
        assert!(!describe(&corrupt).is_transient());
    }
}
