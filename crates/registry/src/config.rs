//! Registry configuration.
//!
//! [`RegistryConfig`] gathers every tunable of the registry and its background tasks. All
//! sections deserialize with serde (durations in humantime form, e.g. `"30s"`) and fall back
//! to defaults for missing fields. Configurations built in code go through bon builders, which
//! validate ranges and return [`ConfigError`] on violation.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use tessera_registry::{CleanerConfig, RegistryConfig};
//!
//! let config = RegistryConfig::builder()
//!     .operation_timeout(Duration::from_secs(2))
//!     .cleaner(CleanerConfig::builder().interval(Duration::from_secs(60)).build())
//!     .build()?;
//! assert_eq!(config.operation_timeout(), Duration::from_secs(2));
//! # Ok::<(), tessera_registry::ConfigError>(())
//! ```

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    ticket_id::{DEFAULT_SUFFIX_LENGTH, UniqueTicketIdGenerator},
};

/// Default bound on a single backend call, retries included (5 seconds).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Default upper bound on a retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Default delay before the cleaner's first pass (20 seconds).
pub const DEFAULT_CLEANER_START_DELAY: Duration = Duration::from_secs(20);

/// Default period between cleaner passes (2 minutes).
pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(120);

/// Default number of published event ids remembered for loop prevention.
pub const DEFAULT_TRACKED_EVENT_CAPACITY: u64 = 10_000;

/// Default time a published event id is remembered (5 minutes).
pub const DEFAULT_TRACKED_EVENT_TTL: Duration = Duration::from_secs(300);

/// Default attempts at generating a non-colliding ticket id.
pub const DEFAULT_ID_GENERATION_RETRIES: u32 = 3;

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

fn default_true() -> bool {
    true
}

fn default_start_delay() -> Duration {
    DEFAULT_CLEANER_START_DELAY
}

fn default_interval() -> Duration {
    DEFAULT_CLEANER_INTERVAL
}

fn default_tracked_event_capacity() -> u64 {
    DEFAULT_TRACKED_EVENT_CAPACITY
}

fn default_tracked_event_ttl() -> Duration {
    DEFAULT_TRACKED_EVENT_TTL
}

fn default_suffix_length() -> usize {
    DEFAULT_SUFFIX_LENGTH
}

fn default_id_generation_retries() -> u32 {
    DEFAULT_ID_GENERATION_RETRIES
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::MustBePositive { field, value: format!("{value:?}") });
    }
    Ok(())
}

/// Top-level registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Bound on each backend call, retries and backoff included.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    operation_timeout: Duration,

    /// Retry policy for transient backend failures.
    #[serde(default)]
    retry: RetryConfig,

    /// Background cleaner.
    #[serde(default)]
    cleaner: CleanerConfig,

    /// Ticket encryption and signing.
    #[serde(default)]
    cipher: CipherConfig,

    /// Cross-node replication.
    #[serde(default)]
    replication: ReplicationConfig,

    /// Ticket id generation.
    #[serde(default)]
    ticket_id: TicketIdConfig,

    /// Audit logging.
    #[serde(default)]
    audit: AuditConfig,
}

#[bon::bon]
impl RegistryConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is out of range. See [`validate`](Self::validate).
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] cleaner: CleanerConfig,
        #[builder(default)] cipher: CipherConfig,
        #[builder(default)] replication: ReplicationConfig,
        #[builder(default)] ticket_id: TicketIdConfig,
        #[builder(default)] audit: AuditConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { operation_timeout, retry, cleaner, cipher, replication, ticket_id, audit };
        config.validate()?;
        Ok(config)
    }

    /// Checks every section. Call this after deserializing a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("operation_timeout", self.operation_timeout)?;
        self.retry.validate()?;
        self.cleaner.validate()?;
        self.replication.validate()?;
        self.ticket_id.validate()?;
        Ok(())
    }

    /// Bound on each backend call.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Cleaner settings.
    #[must_use]
    pub fn cleaner(&self) -> &CleanerConfig {
        &self.cleaner
    }

    /// Cipher settings.
    #[must_use]
    pub fn cipher(&self) -> &CipherConfig {
        &self.cipher
    }

    /// Replication settings.
    #[must_use]
    pub fn replication(&self) -> &ReplicationConfig {
        &self.replication
    }

    /// Ticket id settings.
    #[must_use]
    pub fn ticket_id(&self) -> &TicketIdConfig {
        &self.ticket_id
    }

    /// Audit settings.
    #[must_use]
    pub fn audit(&self) -> &AuditConfig {
        &self.audit
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryConfig::default(),
            cleaner: CleanerConfig::default(),
            cipher: CipherConfig::default(),
            replication: ReplicationConfig::default(),
            ticket_id: TicketIdConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

#[bon::bon]
impl RetryConfig {
    /// Creates a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or `max_backoff` is below it.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        positive("retry.initial_backoff", self.initial_backoff)?;
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::BelowMinimum {
                field: "retry.max_backoff",
                min: format!("{:?}", self.initial_backoff),
                value: format!("{:?}", self.max_backoff),
            });
        }
        Ok(())
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Upper bound on a retry delay.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Background cleaner schedule.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanerConfig {
    /// Whether the cleaner runs at all.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,

    /// Delay before the first pass.
    #[serde(with = "humantime_serde", default = "default_start_delay")]
    #[builder(default = DEFAULT_CLEANER_START_DELAY)]
    pub start_delay: Duration,

    /// Period between passes.
    #[serde(with = "humantime_serde", default = "default_interval")]
    #[builder(default = DEFAULT_CLEANER_INTERVAL)]
    pub interval: Duration,
}

impl CleanerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("cleaner.interval", self.interval)
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Ticket encryption and signing.
///
/// Keys are base64. The encryption key must decode to 32 bytes; the signing key to at least
/// 32 bytes. Use [`generate_base64_keys`](crate::cipher::generate_base64_keys) to create a
/// fresh pair.
#[derive(Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CipherConfig {
    /// Whether ticket ids are hashed and payloads protected.
    #[serde(default)]
    #[builder(default)]
    pub enabled: bool,

    /// Encrypt payloads when enabled.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub encryption_enabled: bool,

    /// Sign payloads when enabled.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub signing_enabled: bool,

    /// Base64 AES-256 key.
    #[serde(default)]
    #[builder(into)]
    pub encryption_key: Option<String>,

    /// Base64 HMAC-SHA512 key.
    #[serde(default)]
    #[builder(into)]
    pub signing_key: Option<String>,
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherConfig")
            .field("enabled", &self.enabled)
            .field("encryption_enabled", &self.encryption_enabled)
            .field("signing_enabled", &self.signing_enabled)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Cross-node replication.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Whether registry changes are published and applied.
    #[serde(default)]
    #[builder(default)]
    pub enabled: bool,

    /// Identifier of this node on the bus. A random one is generated when absent.
    #[serde(default)]
    #[builder(into)]
    pub node_id: Option<String>,

    /// How many published event ids are remembered to drop our own echoes.
    #[serde(default = "default_tracked_event_capacity")]
    #[builder(default = DEFAULT_TRACKED_EVENT_CAPACITY)]
    pub tracked_event_capacity: u64,

    /// How long a published event id is remembered.
    #[serde(with = "humantime_serde", default = "default_tracked_event_ttl")]
    #[builder(default = DEFAULT_TRACKED_EVENT_TTL)]
    pub tracked_event_ttl: Duration,
}

impl ReplicationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tracked_event_capacity == 0 {
            return Err(ConfigError::MustBePositive { field: "replication.tracked_event_capacity", value: "0".to_owned() });
        }
        positive("replication.tracked_event_ttl", self.tracked_event_ttl)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Ticket id generation.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketIdConfig {
    /// Length of the random suffix.
    #[serde(default = "default_suffix_length")]
    #[builder(default = DEFAULT_SUFFIX_LENGTH)]
    pub suffix_length: usize,

    /// Fresh ids tried before issuance gives up on collisions.
    #[serde(default = "default_id_generation_retries")]
    #[builder(default = DEFAULT_ID_GENERATION_RETRIES)]
    pub max_retries: u32,

    /// Optional suffix identifying the issuing node.
    #[serde(default)]
    #[builder(into)]
    pub node_suffix: Option<String>,
}

impl TicketIdConfig {
    /// Builds the generator this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if the suffix is too short.
    pub fn generator(&self) -> Result<UniqueTicketIdGenerator, ConfigError> {
        UniqueTicketIdGenerator::new(self.suffix_length, self.node_suffix.clone())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::MustBePositive { field: "ticket_id.max_retries", value: "0".to_owned() });
        }
        self.generator().map(|_| ())
    }
}

impl Default for TicketIdConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How audit events are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Inline on the calling task.
    #[default]
    Synchronous,
    /// Queued and written by a background task.
    Asynchronous,
}

/// Audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Whether audit events are emitted.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,

    /// Delivery mode.
    #[serde(default)]
    #[builder(default)]
    pub mode: AuditMode,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RegistryConfig::builder().build().unwrap();
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry().max_retries(), 2);
        assert!(config.cleaner().enabled);
        assert_eq!(config.cleaner().start_delay, Duration::from_secs(20));
        assert_eq!(config.cleaner().interval, Duration::from_secs(120));
        assert!(!config.cipher().enabled);
        assert!(!config.replication().enabled);
        assert_eq!(config.ticket_id().suffix_length, 32);
        assert_eq!(config.audit().mode, AuditMode::Synchronous);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = RegistryConfig::builder().operation_timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "operation_timeout", .. }));
    }

    #[test]
    fn retry_backoff_bounds_are_checked() {
        let err = RetryConfig::builder()
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_millis(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "retry.max_backoff", .. }));
        assert!(RetryConfig::builder().initial_backoff(Duration::ZERO).build().is_err());
    }

    #[test]
    fn short_id_suffix_is_rejected() {
        let err = RegistryConfig::builder()
            .ticket_id(TicketIdConfig::builder().suffix_length(8).build())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "suffix_length", .. }));
    }

    #[test]
    fn deserializes_humantime_and_fills_defaults() {
        let json = r#"{
            "operation_timeout": "750ms",
            "cleaner": { "interval": "30s" },
            "replication": { "enabled": true, "node_id": "cas-1" },
            "audit": { "mode": "asynchronous" }
        }"#;
        let config: RegistryConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.operation_timeout(), Duration::from_millis(750));
        assert_eq!(config.cleaner().interval, Duration::from_secs(30));
        assert_eq!(config.cleaner().start_delay, DEFAULT_CLEANER_START_DELAY);
        assert_eq!(config.replication().node_id.as_deref(), Some("cas-1"));
        assert_eq!(config.replication().tracked_event_capacity, DEFAULT_TRACKED_EVENT_CAPACITY);
        assert_eq!(config.audit().mode, AuditMode::Asynchronous);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<RegistryConfig>(r#"{ "timeout": "1s" }"#).is_err());
    }

    #[test]
    fn cipher_debug_redacts_keys() {
        let config = CipherConfig::builder().enabled(true).encryption_key("c2VjcmV0").build();
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("c2VjcmV0"));
    }
}
