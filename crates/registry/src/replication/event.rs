//! Replication wire format.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    backend::TicketRecord,
    error::{StorageError, StorageResult},
};

/// Identifies the node that published an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherIdentifier(String);

impl PublisherIdentifier {
    /// Wraps a configured node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random node id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The node id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry mutation carried by a [`ReplicationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationOperation {
    /// A ticket was stored.
    Add,
    /// A stored ticket was replaced.
    Update,
    /// A ticket was removed.
    Delete,
    /// Every ticket was removed.
    DeleteAll,
}

impl fmt::Display for ReplicationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::DeleteAll => write!(f, "DELETE_ALL"),
        }
    }
}

/// A registry change published to peers.
///
/// `ticket_id` is the storage key and `payload` the stored record, so an event exposes no more
/// than the backend itself holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    /// Unique per publication.
    pub event_id: Uuid,
    /// Publishing node.
    pub origin_id: PublisherIdentifier,
    /// What happened.
    pub operation: ReplicationOperation,
    /// Storage key of the affected ticket; empty for [`ReplicationOperation::DeleteAll`].
    #[serde(default)]
    pub ticket_id: String,
    /// JSON-encoded [`TicketRecord`] for [`Add`](ReplicationOperation::Add) and
    /// [`Update`](ReplicationOperation::Update).
    #[serde(default, with = "crate::codec::base64_bytes::option")]
    pub payload: Option<Bytes>,
}

impl ReplicationEvent {
    fn new(origin: &PublisherIdentifier, operation: ReplicationOperation, ticket_id: String, payload: Option<Bytes>) -> Self {
        Self { event_id: Uuid::new_v4(), origin_id: origin.clone(), operation, ticket_id, payload }
    }

    /// An `ADD` or `UPDATE` event for `record`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the record cannot be encoded.
    pub fn write(origin: &PublisherIdentifier, operation: ReplicationOperation, record: &TicketRecord) -> StorageResult<Self> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| StorageError::serialization_with_source("failed to encode replicated record", e))?;
        Ok(Self::new(origin, operation, record.key.clone(), Some(Bytes::from(payload))))
    }

    /// A `DELETE` event for `key`.
    #[must_use]
    pub fn delete(origin: &PublisherIdentifier, key: impl Into<String>) -> Self {
        Self::new(origin, ReplicationOperation::Delete, key.into(), None)
    }

    /// A `DELETE_ALL` event.
    #[must_use]
    pub fn delete_all(origin: &PublisherIdentifier) -> Self {
        Self::new(origin, ReplicationOperation::DeleteAll, String::new(), None)
    }

    /// Decodes the carried record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the payload is missing or malformed, or
    /// names a different key than the event.
    pub fn record(&self) -> StorageResult<TicketRecord> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| StorageError::serialization(format!("{} event without payload", self.operation)))?;
        let record: TicketRecord = serde_json::from_slice(payload)
            .map_err(|e| StorageError::serialization_with_source("malformed replicated record", e))?;
        if record.key != self.ticket_id {
            return Err(StorageError::serialization(format!(
                "replicated record key {} does not match event key {}",
                record.key, self.ticket_id
            )));
        }
        Ok(record)
    }

    /// Encodes the event for the bus.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> StorageResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StorageError::serialization_with_source("failed to encode replication event", e))
    }

    /// Decodes an event received from the bus.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if `bytes` is not a valid event.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::serialization_with_source("malformed replication event", e))
    }
}
