//! Configuration for the SQL ticket backend.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tessera_registry::ConfigError;

/// Default time a statement waits on a locked database before failing (5 seconds).
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn default_busy_timeout() -> Duration {
    DEFAULT_BUSY_TIMEOUT
}

/// Where the database lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseLocation {
    /// A private in-memory database, gone when the backend is dropped.
    #[default]
    Memory,
    /// A database file, created if missing.
    Path(PathBuf),
}

/// Configuration for [`SqlTicketBackend`](crate::SqlTicketBackend).
///
/// ```
/// use std::time::Duration;
///
/// use tessera_registry_sql::{DatabaseLocation, SqlBackendConfig};
///
/// let config = SqlBackendConfig::builder()
///     .location(DatabaseLocation::Path("/var/lib/tessera/tickets.db".into()))
///     .busy_timeout(Duration::from_secs(2))
///     .build()?;
/// assert_eq!(config.busy_timeout(), Duration::from_secs(2));
/// # Ok::<(), tessera_registry::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlBackendConfig {
    #[serde(default)]
    location: DatabaseLocation,

    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    busy_timeout: Duration,
}

#[bon::bon]
impl SqlBackendConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `busy_timeout` is zero.
    #[builder]
    pub fn new(
        #[builder(default)] location: DatabaseLocation,
        #[builder(default = DEFAULT_BUSY_TIMEOUT)] busy_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { location, busy_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges. Call after deserializing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `busy_timeout` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.busy_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "sql.busy_timeout",
                value: format!("{:?}", self.busy_timeout),
            });
        }
        Ok(())
    }

    /// Where the database lives.
    #[must_use]
    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// How long a statement waits on a locked database.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }
}

impl Default for SqlBackendConfig {
    fn default() -> Self {
        Self { location: DatabaseLocation::Memory, busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_memory() {
        let config = SqlBackendConfig::builder().build().unwrap();
        assert_eq!(config, SqlBackendConfig::default());
        assert_eq!(config.location(), &DatabaseLocation::Memory);
    }

    #[test]
    fn zero_busy_timeout_is_rejected() {
        let err = SqlBackendConfig::builder().busy_timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "sql.busy_timeout", .. }));
    }

    #[test]
    fn deserializes_path_and_humantime() {
        let config: SqlBackendConfig =
            serde_json::from_str(r#"{"location":{"path":"/tmp/tickets.db"},"busy_timeout":"250ms"}"#).unwrap();
        assert_eq!(config.location(), &DatabaseLocation::Path("/tmp/tickets.db".into()));
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<SqlBackendConfig>(r#"{"pool_size":4}"#).is_err());
    }
}
