//! SQLite-backed ticket backend.

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tessera_registry::{
    StorageError, StorageResult, TicketKind, TicketRecord,
    backend::{CascadeRemoval, TicketBackend},
};

use crate::{
    config::{DatabaseLocation, SqlBackendConfig},
    error::{Result, SqlStorageError, describe, is_constraint_violation},
    schema::{COLUMNS, RowValues, SCHEMA, record_from_row, to_nanos},
};

/// Ticket backend over a single SQLite connection.
///
/// Statements run on tokio's blocking pool. A cascade is one transaction: descendants are
/// deleted first and the parent row last, so a crash mid-cascade never leaves children of a
/// removed parent behind. Counters and principal lookups use indexes.
///
/// Cheaply cloneable; clones share the connection.
///
/// ```
/// use tessera_registry_sql::{SqlBackendConfig, SqlTicketBackend};
///
/// let backend = SqlTicketBackend::open(&SqlBackendConfig::default())?;
/// # Ok::<(), tessera_registry_sql::SqlStorageError>(())
/// ```
#[derive(Clone)]
pub struct SqlTicketBackend {
    conn: Arc<Mutex<Connection>>,
    location: DatabaseLocation,
}

impl fmt::Debug for SqlTicketBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTicketBackend").field("location", &self.location).finish_non_exhaustive()
    }
}

impl SqlTicketBackend {
    /// Opens (creating if needed) the database described by `config` and ensures the schema.
    ///
    /// # Errors
    ///
    /// Returns [`SqlStorageError::Sqlite`] if the database cannot be opened or migrated.
    pub fn open(config: &SqlBackendConfig) -> Result<Self> {
        let conn = match config.location() {
            DatabaseLocation::Memory => Connection::open_in_memory()?,
            DatabaseLocation::Path(path) => open_file(path)?,
        };
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(location = ?config.location(), "ticket database ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)), location: config.location().clone() })
    }

    /// A private in-memory database with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SqlStorageError::Sqlite`] if SQLite cannot create it.
    pub fn in_memory() -> Result<Self> {
        Self::open(&SqlBackendConfig::default())
    }

    /// Where the database lives.
    #[must_use]
    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut *conn.lock())).await?
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "opened ticket database file");
    Ok(conn)
}

fn select_records(conn: &Connection, filter: &str, params: impl rusqlite::Params) -> Result<Vec<TicketRecord>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {COLUMNS} FROM tickets {filter}"))?;
    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        match record_from_row(row) {
            Ok(record) => records.push(record),
            Err(e) if is_unreadable_row(&e) => {
                tracing::warn!(error = %e, "skipping unreadable row");
            },
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Row-level decode failures, as opposed to failures of the statement itself.
fn is_unreadable_row(err: &SqlStorageError) -> bool {
    matches!(
        err,
        SqlStorageError::CorruptRow { .. }
            | SqlStorageError::Sqlite(
                rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..)
            )
    )
}

#[async_trait]
impl TicketBackend for SqlTicketBackend {
    fn name(&self) -> &'static str {
        "sql"
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key, kind = %record.kind))]
    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        let key = record.key.clone();
        let row = RowValues::from(record);
        let inserted = self
            .run(move |conn| {
                let result = conn.execute(
                    &format!("INSERT INTO tickets ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                    params![row.key, row.kind, row.parent_key, row.principal_key, row.expires_at, row.payload],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(e) if is_constraint_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        if inserted { Ok(()) } else { Err(StorageError::conflict(key)) }
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        let row = RowValues::from(record);
        let changed = self
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE tickets SET kind = ?2, parent_key = ?3, principal_key = ?4, expires_at = ?5, payload = ?6 \
                     WHERE key = ?1",
                    params![row.key, row.kind, row.parent_key, row.principal_key, row.expires_at, row.payload],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    #[tracing::instrument(skip(self, record), fields(key = %record.key))]
    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        let row = RowValues::from(record);
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO tickets ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT (key) DO UPDATE SET kind = excluded.kind, parent_key = excluded.parent_key, \
                     principal_key = excluded.principal_key, expires_at = excluded.expires_at, \
                     payload = excluded.payload"
                ),
                params![row.key, row.kind, row.parent_key, row.principal_key, row.expires_at, row.payload],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        let key = key.to_owned();
        let record = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(&format!("SELECT {COLUMNS} FROM tickets WHERE key = ?1"))?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(record_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(record)
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let key = key.to_owned();
        let removed = self.run(move |conn| Ok(conn.execute("DELETE FROM tickets WHERE key = ?1", params![key])?)).await?;
        Ok(removed > 0)
    }

    #[tracing::instrument(skip(self, descendants), fields(descendants = descendants.len()))]
    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        let keys = descendants.to_vec();
        let parent = parent.to_owned();
        let outcome = self
            .run({
                let keys = keys.clone();
                move |conn| {
                    let tx = conn.transaction()?;
                    let mut results = Vec::with_capacity(keys.len());
                    {
                        let mut stmt = tx.prepare_cached("DELETE FROM tickets WHERE key = ?1")?;
                        for key in keys {
                            let result = stmt
                                .execute(params![key])
                                .map(|changed| changed > 0)
                                .map_err(|e| StorageError::from(SqlStorageError::from(e)));
                            results.push((key, result));
                        }
                    }
                    let parent_removed = tx.execute("DELETE FROM tickets WHERE key = ?1", params![parent])? > 0;
                    tx.commit()?;
                    Ok(CascadeRemoval { descendants: results, parent: Ok(parent_removed) })
                }
            })
            .await;

        match outcome {
            Ok(removal) => removal,
            Err(e) => {
                tracing::warn!(error = %e, "cascade transaction failed, nothing was removed");
                CascadeRemoval {
                    descendants: keys.into_iter().map(|key| (key, Err(describe(&e)))).collect(),
                    parent: Err(e.into()),
                }
            },
        }
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        Ok(self.run(|conn| select_records(conn, "", [])).await?)
    }

    #[tracing::instrument(skip(self))]
    async fn clear(&self) -> StorageResult<u64> {
        let removed = self.run(|conn| Ok(conn.execute("DELETE FROM tickets", [])?)).await?;
        Ok(removed as u64)
    }

    async fn count(&self, kind: TicketKind) -> StorageResult<Option<u64>> {
        let kind = kind.to_string();
        let count: i64 = self
            .run(move |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM tickets WHERE kind = ?1", params![kind], |row| row.get(0))?)
            })
            .await?;
        Ok(Some(u64::try_from(count).unwrap_or(0)))
    }

    async fn find_by_principal(&self, principal_key: &str) -> StorageResult<Vec<TicketRecord>> {
        let principal_key = principal_key.to_owned();
        Ok(self.run(move |conn| select_records(conn, "WHERE principal_key = ?1", params![principal_key])).await?)
    }

    #[tracing::instrument(skip(self))]
    async fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<Option<u64>> {
        let now = to_nanos(now);
        let removed = self
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM tickets WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                )?)
            })
            .await?;
        tracing::debug!(removed, "expired rows deleted");
        Ok(Some(removed as u64))
    }

    async fn health_check(&self) -> StorageResult<()> {
        let one: Option<i64> =
            self.run(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0)).optional()?)).await?;
        if one == Some(1) { Ok(()) } else { Err(StorageError::internal("health probe returned no row")) }
    }
}
