//! Ticket id generation.
//!
//! Ids look like `ST-42-Xq3...`: the kind prefix, a per-process counter and a random
//! alphanumeric suffix drawn from a CSPRNG. An optional node suffix (`...-node1`) keeps ids from
//! different nodes visibly apart.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::{Rng, distributions::Alphanumeric};

use crate::{error::ConfigError, ticket::TicketKind};

/// Smallest accepted random suffix length.
pub const MIN_SUFFIX_LENGTH: usize = 16;

/// Default random suffix length.
pub const DEFAULT_SUFFIX_LENGTH: usize = 32;

/// Generates ticket ids.
pub trait TicketIdGenerator: Send + Sync {
    /// Returns a new id for a ticket of `kind`.
    fn new_ticket_id(&self, kind: TicketKind) -> String;
}

/// Default generator: prefix, counter and random suffix.
#[derive(Debug)]
pub struct UniqueTicketIdGenerator {
    suffix_length: usize,
    node_suffix: Option<String>,
    counter: AtomicU64,
}

impl UniqueTicketIdGenerator {
    /// Creates a generator producing `suffix_length` random characters per id.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `suffix_length` is shorter than
    /// [`MIN_SUFFIX_LENGTH`].
    pub fn new(suffix_length: usize, node_suffix: Option<String>) -> Result<Self, ConfigError> {
        if suffix_length < MIN_SUFFIX_LENGTH {
            return Err(ConfigError::BelowMinimum {
                field: "suffix_length",
                min: MIN_SUFFIX_LENGTH.to_string(),
                value: suffix_length.to_string(),
            });
        }
        Ok(Self { suffix_length, node_suffix, counter: AtomicU64::new(1) })
    }
}

impl Default for UniqueTicketIdGenerator {
    fn default() -> Self {
        Self { suffix_length: DEFAULT_SUFFIX_LENGTH, node_suffix: None, counter: AtomicU64::new(1) }
    }
}

impl TicketIdGenerator for UniqueTicketIdGenerator {
    fn new_ticket_id(&self, kind: TicketKind) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(self.suffix_length).map(char::from).collect();
        match &self.node_suffix {
            Some(node) => format!("{}-{sequence}-{random}-{node}", kind.prefix()),
            None => format!("{}-{sequence}-{random}", kind.prefix()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_carry_kind_prefix() {
        let generator = UniqueTicketIdGenerator::default();
        for kind in TicketKind::ALL {
            let id = generator.new_ticket_id(kind);
            assert_eq!(TicketKind::from_id(&id), Some(kind), "{id}");
        }
    }

    #[test]
    fn ids_are_unique() {
        let generator = UniqueTicketIdGenerator::default();
        let ids: HashSet<_> = (0..1_000).map(|_| generator.new_ticket_id(TicketKind::Service)).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn node_suffix_is_appended() {
        let generator = UniqueTicketIdGenerator::new(20, Some("node-a".to_owned())).unwrap();
        let id = generator.new_ticket_id(TicketKind::TicketGranting);
        assert!(id.starts_with("TGT-1-"));
        assert!(id.ends_with("-node-a"));
        assert_eq!(id.len(), "TGT-1-".len() + 20 + "-node-a".len());
    }

    #[test]
    fn short_suffix_is_rejected() {
        let err = UniqueTicketIdGenerator::new(8, None).unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "suffix_length", .. }));
    }
}
