//! Table layout and row mapping.
//!
//! One row per ticket. `expires_at` is stored as nanoseconds since the Unix epoch so that
//! `remove_expired` is an indexed range delete.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use tessera_registry::{TicketKind, TicketRecord};

use crate::error::{Result, SqlStorageError};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tickets (
    key           TEXT PRIMARY KEY NOT NULL,
    kind          TEXT NOT NULL,
    parent_key    TEXT,
    principal_key TEXT,
    expires_at    INTEGER,
    payload       BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS tickets_parent_key ON tickets (parent_key);
CREATE INDEX IF NOT EXISTS tickets_principal_key ON tickets (principal_key);
CREATE INDEX IF NOT EXISTS tickets_kind ON tickets (kind);
CREATE INDEX IF NOT EXISTS tickets_expires_at ON tickets (expires_at);
";

pub(crate) const COLUMNS: &str = "key, kind, parent_key, principal_key, expires_at, payload";

/// Column values for one record, owned so they can move onto a blocking task.
pub(crate) struct RowValues {
    pub key: String,
    pub kind: String,
    pub parent_key: Option<String>,
    pub principal_key: Option<String>,
    pub expires_at: Option<i64>,
    pub payload: Vec<u8>,
}

impl From<TicketRecord> for RowValues {
    fn from(record: TicketRecord) -> Self {
        Self {
            kind: record.kind.to_string(),
            expires_at: record.expires_at.map(to_nanos),
            payload: record.payload.to_vec(),
            key: record.key,
            parent_key: record.parent_key,
            principal_key: record.principal_key,
        }
    }
}

/// Nanoseconds since the epoch, saturating for instants past year 2262.
pub(crate) fn to_nanos(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_nanos_opt().unwrap_or(if instant.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

/// Reads a row selected with [`COLUMNS`].
pub(crate) fn record_from_row(row: &Row<'_>) -> Result<TicketRecord> {
    let key: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let kind = kind
        .parse::<TicketKind>()
        .map_err(|e| SqlStorageError::CorruptRow { key: key.clone(), message: e.to_string() })?;
    let expires_at: Option<i64> = row.get(4)?;
    let payload: Vec<u8> = row.get(5)?;

    Ok(TicketRecord {
        key,
        kind,
        parent_key: row.get(2)?,
        principal_key: row.get(3)?,
        expires_at: expires_at.map(DateTime::from_timestamp_nanos),
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn nanos_preserve_ordering_and_precision() {
        let now = Utc::now();
        let later = now + TimeDelta::nanoseconds(1);
        assert!(to_nanos(now) < to_nanos(later));
        assert_eq!(DateTime::from_timestamp_nanos(to_nanos(now)), now);
    }

    #[test]
    fn far_future_saturates() {
        let far = DateTime::<Utc>::MAX_UTC;
        assert_eq!(to_nanos(far), i64::MAX);
    }
}
