//! Conversion between [`Ticket`]s and their stored representation.
//!
//! With the cipher enabled, ticket ids (and principal ids) are replaced by their SHA-512 digest
//! before they reach a backend, and the serialized ticket is passed through the
//! [`CipherExecutor`]. With the cipher disabled both steps are skipped.

use std::{borrow::Cow, sync::Arc};

use bytes::Bytes;
use sha2::{Digest, Sha512};

use crate::{
    backend::TicketRecord,
    cipher::{CipherExecutor, NoOpCipherExecutor},
    error::{RegistryError, RegistryResult},
    ticket::Ticket,
};

/// A ticket as it is handed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTicket {
    /// The storage key: the ticket id or its digest.
    pub encoded_id: String,
    /// The serialized, optionally encrypted ticket.
    pub encoded_payload: Bytes,
}

/// Encodes and decodes tickets for storage.
#[derive(Debug, Clone)]
pub struct TicketCodec {
    cipher: Arc<dyn CipherExecutor>,
}

impl TicketCodec {
    /// Creates a codec using `cipher`.
    #[must_use]
    pub fn new(cipher: Arc<dyn CipherExecutor>) -> Self {
        Self { cipher }
    }

    /// Returns `true` if stored ids and payloads are protected.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_enabled()
    }

    /// The storage key for a ticket id.
    #[must_use]
    pub fn encode_ticket_id(&self, ticket_id: &str) -> String {
        if self.cipher.is_enabled() && !ticket_id.is_empty() { sha512_hex(ticket_id) } else { ticket_id.to_owned() }
    }

    /// The storage form of a principal id, used for per-principal lookups.
    #[must_use]
    pub fn encode_principal_id(&self, principal_id: &str) -> String {
        self.encode_ticket_id(principal_id)
    }

    /// Serializes and protects a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Encoding`] if serialization or encryption fails.
    pub fn encode(&self, ticket: &Ticket) -> RegistryResult<EncodedTicket> {
        let json = serde_json::to_vec(ticket)
            .map_err(|e| RegistryError::encoding(format!("serialize {}", ticket.kind()), e))?;
        let payload = if self.cipher.is_enabled() {
            self.cipher.encode(&json).map_err(|e| RegistryError::encoding(format!("encrypt {}", ticket.kind()), e))?
        } else {
            json
        };
        Ok(EncodedTicket { encoded_id: self.encode_ticket_id(ticket.id()), encoded_payload: Bytes::from(payload) })
    }

    /// Recovers a ticket from its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DecodeFailure`] if the payload fails verification, decryption or
    /// deserialization, or if the decoded ticket does not belong under `encoded_id`.
    pub fn decode(&self, encoded: &EncodedTicket) -> RegistryResult<Ticket> {
        let id = &encoded.encoded_id;
        let plain = if self.cipher.is_enabled() {
            Cow::Owned(
                self.cipher
                    .decode(&encoded.encoded_payload)
                    .map_err(|e| RegistryError::decode_failure(id, "cipher rejected payload", e))?,
            )
        } else {
            Cow::Borrowed(&encoded.encoded_payload[..])
        };
        let ticket: Ticket = serde_json::from_slice(&plain)
            .map_err(|e| RegistryError::decode_failure(id, "payload is not a ticket", e))?;

        if self.encode_ticket_id(ticket.id()) != *id {
            return Err(RegistryError::DecodeFailure {
                id: id.clone(),
                message: "payload belongs to a different ticket".to_owned(),
                source: None,
            });
        }
        Ok(ticket)
    }

    /// Builds the backend record for a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Encoding`] if the ticket cannot be encoded.
    pub fn to_record(&self, ticket: &Ticket) -> RegistryResult<TicketRecord> {
        let encoded = self.encode(ticket)?;
        Ok(TicketRecord {
            key: encoded.encoded_id,
            kind: ticket.kind(),
            parent_key: ticket.granted_by().map(|id| self.encode_ticket_id(id)),
            principal_key: ticket.principal_id().map(|id| self.encode_principal_id(id)),
            expires_at: ticket.state().expiration_instant(),
            payload: encoded.encoded_payload,
        })
    }

    /// Decodes a backend record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DecodeFailure`] if the record is corrupt.
    pub fn from_record(&self, record: &TicketRecord) -> RegistryResult<Ticket> {
        let ticket = self.decode(&EncodedTicket {
            encoded_id: record.key.clone(),
            encoded_payload: record.payload.clone(),
        })?;
        if ticket.kind() != record.kind {
            return Err(RegistryError::DecodeFailure {
                id: record.key.clone(),
                message: format!("record is tagged {} but holds a {}", record.kind, ticket.kind()),
                source: None,
            });
        }
        Ok(ticket)
    }
}

impl Default for TicketCodec {
    fn default() -> Self {
        Self::new(Arc::new(NoOpCipherExecutor))
    }
}

/// Lowercase hex SHA-512 digest of `value`.
#[must_use]
pub fn sha512_hex(value: &str) -> String {
    hex::encode(Sha512::digest(value.as_bytes()))
}

/// Serde adapter storing bytes as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional payloads.
    pub(crate) mod option {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
