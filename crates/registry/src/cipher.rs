//! Encryption and signing of ticket payloads at rest.
//!
//! [`CipherExecutor`] is the seam: the registry hands it serialized tickets before writing and
//! the stored bytes after reading. [`NoOpCipherExecutor`] is used when no key material is
//! configured; callers check [`CipherExecutor::is_enabled`] before invoking the pipeline.
//!
//! # Envelope format
//!
//! [`TicketCipherExecutor`] produces:
//!
//! ```text
//! +---------+-------+-----------------+----------------------+------------------+
//! | version | flags | nonce (12, opt) | body (ciphertext or  | HMAC-SHA512 (64, |
//! |   (1)   |  (1)  |                 | plaintext)           | opt)             |
//! +---------+-------+-----------------+----------------------+------------------+
//! ```
//!
//! The MAC covers every preceding byte and is checked in constant time before decryption.

use std::{fmt, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{config::CipherConfig, error::ConfigError};

type HmacSha512 = Hmac<Sha512>;

/// Current envelope version.
const ENVELOPE_VERSION: u8 = 1;

const FLAG_ENCRYPTED: u8 = 0b01;
const FLAG_SIGNED: u8 = 0b10;

const NONCE_LENGTH: usize = 12;
const MAC_LENGTH: usize = 64;
const HEADER_LENGTH: usize = 2;

/// Required AES-256 key length in bytes.
pub const ENCRYPTION_KEY_LENGTH: usize = 32;

/// Minimum signing key length in bytes.
pub const MIN_SIGNING_KEY_LENGTH: usize = 32;

/// Generated signing key length in bytes.
pub const SIGNING_KEY_LENGTH: usize = 64;

/// Errors raised by a [`CipherExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CipherError {
    /// Key material has the wrong length or encoding.
    #[error("invalid {key} key: {reason}")]
    InvalidKey {
        /// Which key (`encryption` or `signing`).
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The envelope is truncated or its flags do not match this executor.
    #[error("malformed cipher envelope: {0}")]
    Malformed(&'static str),

    /// The envelope was written by an unknown format version.
    #[error("unsupported cipher envelope version {0}")]
    UnsupportedVersion(u8),

    /// The signature does not match: the value was tampered with or signed by another key.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Authenticated decryption failed.
    #[error("decryption failed")]
    Decryption,

    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,
}

/// Encrypt/sign and verify/decrypt pipeline.
pub trait CipherExecutor: Send + Sync + fmt::Debug {
    /// Protects `value` for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Encryption`] if the value cannot be encrypted.
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Verifies and recovers a value produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed, tampered with or cannot be decrypted.
    fn decode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Returns `false` when the executor passes values through unchanged.
    fn is_enabled(&self) -> bool;
}

/// Executor that leaves values unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCipherExecutor;

impl CipherExecutor for NoOpCipherExecutor {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(value.to_vec())
    }

    fn decode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(value.to_vec())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// AES-256-GCM encryption followed by HMAC-SHA512 signing.
///
/// Either stage may be disabled. Key material is read-only after construction; share one
/// instance across the process via [`Arc`].
#[derive(Clone)]
pub struct TicketCipherExecutor {
    cipher: Option<Aes256Gcm>,
    signing_key: Option<Zeroizing<Vec<u8>>>,
}

impl TicketCipherExecutor {
    /// Creates an executor from raw key material.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] if the encryption key is not
    /// [`ENCRYPTION_KEY_LENGTH`] bytes, the signing key is shorter than
    /// [`MIN_SIGNING_KEY_LENGTH`], or both keys are absent.
    pub fn new(encryption_key: Option<&[u8]>, signing_key: Option<&[u8]>) -> Result<Self, CipherError> {
        if encryption_key.is_none() && signing_key.is_none() {
            return Err(CipherError::InvalidKey {
                key: "encryption",
                reason: "at least one of encryption or signing must be configured".to_owned(),
            });
        }

        let cipher = encryption_key
            .map(|key| {
                if key.len() != ENCRYPTION_KEY_LENGTH {
                    return Err(CipherError::InvalidKey {
                        key: "encryption",
                        reason: format!("expected {ENCRYPTION_KEY_LENGTH} bytes, got {}", key.len()),
                    });
                }
                <Aes256Gcm as KeyInit>::new_from_slice(key).map_err(|e| CipherError::InvalidKey {
                    key: "encryption",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let signing_key = signing_key
            .map(|key| {
                if key.len() < MIN_SIGNING_KEY_LENGTH {
                    return Err(CipherError::InvalidKey {
                        key: "signing",
                        reason: format!("expected at least {MIN_SIGNING_KEY_LENGTH} bytes, got {}", key.len()),
                    });
                }
                Ok(Zeroizing::new(key.to_vec()))
            })
            .transpose()?;

        Ok(Self { cipher, signing_key })
    }

    /// Creates an executor from base64-encoded keys.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] if a key is not valid base64 or has the wrong length.
    pub fn from_base64(encryption_key: Option<&str>, signing_key: Option<&str>) -> Result<Self, CipherError> {
        let encryption = encryption_key.map(|key| decode_key("encryption", key)).transpose()?;
        let signing = signing_key.map(|key| decode_key("signing", key)).transpose()?;
        Self::new(encryption.as_ref().map(|k| k.as_slice()), signing.as_ref().map(|k| k.as_slice()))
    }

    /// Creates an executor with freshly generated random keys for both stages.
    #[must_use]
    pub fn generate() -> Self {
        let (encryption, signing) = generate_keys();
        Self {
            cipher: Some(Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&encryption))),
            signing_key: Some(signing),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.cipher.is_some() {
            flags |= FLAG_ENCRYPTED;
        }
        if self.signing_key.is_some() {
            flags |= FLAG_SIGNED;
        }
        flags
    }

    fn mac(&self, key: &[u8]) -> Result<HmacSha512, CipherError> {
        <HmacSha512 as Mac>::new_from_slice(key)
            .map_err(|e| CipherError::InvalidKey { key: "signing", reason: e.to_string() })
    }
}

impl fmt::Debug for TicketCipherExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketCipherExecutor")
            .field("encryption", &self.cipher.is_some())
            .field("signing", &self.signing_key.is_some())
            .finish_non_exhaustive()
    }
}

impl CipherExecutor for TicketCipherExecutor {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + NONCE_LENGTH + value.len() + 16 + MAC_LENGTH);
        out.push(ENVELOPE_VERSION);
        out.push(self.flags());

        match &self.cipher {
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LENGTH];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ciphertext =
                    cipher.encrypt(Nonce::from_slice(&nonce), value).map_err(|_| CipherError::Encryption)?;
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
            },
            None => out.extend_from_slice(value),
        }

        if let Some(key) = &self.signing_key {
            let mut mac = self.mac(key)?;
            mac.update(&out);
            out.extend_from_slice(&mac.finalize().into_bytes());
        }

        Ok(out)
    }

    fn decode(&self, value: &[u8]) -> Result<Vec<u8>, CipherError> {
        let [version, flags, ..] = *value else {
            return Err(CipherError::Malformed("missing header"));
        };
        if version != ENVELOPE_VERSION {
            return Err(CipherError::UnsupportedVersion(version));
        }
        if flags != self.flags() {
            return Err(CipherError::Malformed("envelope flags do not match executor configuration"));
        }

        let signed_part = match &self.signing_key {
            Some(key) => {
                let split = value
                    .len()
                    .checked_sub(MAC_LENGTH)
                    .filter(|split| *split >= HEADER_LENGTH)
                    .ok_or(CipherError::Malformed("truncated signature"))?;
                let (signed, tag) = value.split_at(split);
                let mut mac = self.mac(key)?;
                mac.update(signed);
                mac.verify_slice(tag).map_err(|_| CipherError::SignatureMismatch)?;
                signed
            },
            None => value,
        };

        let body = &signed_part[HEADER_LENGTH..];
        match &self.cipher {
            Some(cipher) => {
                if body.len() < NONCE_LENGTH {
                    return Err(CipherError::Malformed("truncated nonce"));
                }
                let (nonce, ciphertext) = body.split_at(NONCE_LENGTH);
                cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| CipherError::Decryption)
            },
            None => Ok(body.to_vec()),
        }
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Builds the executor described by `config`.
///
/// Returns [`NoOpCipherExecutor`] when the cipher is disabled.
///
/// # Errors
///
/// Returns [`ConfigError`] if the cipher is enabled but a required key is missing or invalid.
pub fn cipher_executor_from_config(config: &CipherConfig) -> Result<Arc<dyn CipherExecutor>, ConfigError> {
    if !config.enabled {
        return Ok(Arc::new(NoOpCipherExecutor));
    }
    let encryption_key = if config.encryption_enabled {
        Some(config.encryption_key.as_deref().ok_or(ConfigError::Missing { field: "cipher.encryption_key" })?)
    } else {
        None
    };
    let signing_key = if config.signing_enabled {
        Some(config.signing_key.as_deref().ok_or(ConfigError::Missing { field: "cipher.signing_key" })?)
    } else {
        None
    };
    let executor = TicketCipherExecutor::from_base64(encryption_key, signing_key)
        .map_err(|e| ConfigError::Invalid { field: "cipher", reason: e.to_string() })?;
    Ok(Arc::new(executor))
}

/// Generates a random encryption key and signing key.
#[must_use]
pub fn generate_keys() -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    let mut rng = rand::thread_rng();
    let mut encryption = Zeroizing::new(vec![0u8; ENCRYPTION_KEY_LENGTH]);
    rng.fill_bytes(&mut encryption);
    let mut signing = Zeroizing::new(vec![0u8; SIGNING_KEY_LENGTH]);
    rng.fill_bytes(&mut signing);
    (encryption, signing)
}

/// Generates a random key pair encoded as base64, as expected by [`CipherConfig`].
#[must_use]
pub fn generate_base64_keys() -> (String, String) {
    let (encryption, signing) = generate_keys();
    (STANDARD.encode(encryption.as_slice()), STANDARD.encode(signing.as_slice()))
}

fn decode_key(name: &'static str, encoded: &str) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    STANDARD
        .decode(encoded.trim())
        .map(Zeroizing::new)
        .map_err(|e| CipherError::InvalidKey { key: name, reason: e.to_string() })
}
