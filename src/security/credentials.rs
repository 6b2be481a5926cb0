//! Encryption at rest for subscription credentials.
//!
//! API keys, client ids and client secrets are encrypted with AES-256-GCM
//! before they reach a backend. Client ids additionally get a deterministic
//! HMAC-SHA256 lookup digest, stored in an indexed column, so a subscription
//! can be found by client id without decrypting every row.
//!
//! # Format
//!
//! `enc:v1:` + base64(nonce || ciphertext || tag), nonce 12 bytes, random per
//! value.
//!
//! # Key
//!
//! 32 bytes, base64-encoded:
//!
//! ```bash
//! openssl rand -base64 32
//! ```

use crate::{Error, Result};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix marking an encrypted value.
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (32 bytes / 256 bits).
const KEY_SIZE: usize = 32;

/// Authentication tag size.
const TAG_SIZE: usize = 16;

/// Domain separation for the lookup digest key.
const LOOKUP_KEY_CONTEXT: &[u8] = b"portal-dao/client-id-lookup/v1";

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM cipher for credential fields.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
    lookup_key: [u8; KEY_SIZE],
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Creates a cipher from a raw 32-byte key.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(LOOKUP_KEY_CONTEXT);
        hasher.update(key);
        let lookup_key: [u8; KEY_SIZE] = hasher.finalize().into();

        Self {
            cipher: Aes256Gcm::new(&Key::<Aes256Gcm>::from(key)),
            lookup_key,
        }
    }

    /// Creates a cipher from a base64-encoded key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the key is not base64 or not 32 bytes.
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = STANDARD
            .decode(key_b64.trim())
            .map_err(|e| Error::Validation(format!("invalid base64 credential key: {e}")))?;

        let key: [u8; KEY_SIZE] = key_bytes.as_slice().try_into().map_err(|_| {
            Error::Validation(format!(
                "credential key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            ))
        })?;

        Ok(Self::new(key))
    }

    /// Creates a cipher from a configured secret.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the key is invalid.
    pub fn from_secret(secret: &SecretString) -> Result<Self> {
        Self::from_base64(secret.expose_secret())
    }

    /// Encrypts a credential value.
    ///
    /// # Errors
    ///
    /// Returns `Error::OperationFailed` if encryption fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::operation("encrypt_credential", e))?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTED_PREFIX}{}", STANDARD.encode(raw)))
    }

    /// Decrypts a credential value.
    ///
    /// Values without the encryption prefix were stored before encryption was
    /// configured and are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the value is malformed, or
    /// `Error::OperationFailed` if authentication fails (wrong key or
    /// corrupted data).
    pub fn decrypt(&self, value: &str) -> Result<String> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            tracing::debug!("Credential value is not encrypted, returning as stored");
            return Ok(value.to_string());
        };

        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Validation(format!("malformed encrypted credential: {e}")))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Validation(format!(
                "encrypted credential too short: {} bytes",
                raw.len()
            )));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let nonce_array: [u8; NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| Error::Validation("invalid nonce length".to_string()))?;
        let plaintext = self
            .cipher
            .decrypt(&Nonce::from(nonce_array), ciphertext)
            .map_err(|e| {
                Error::operation(
                    "decrypt_credential",
                    format!("wrong key or corrupted data: {e}"),
                )
            })?;

        String::from_utf8(plaintext).map_err(|e| Error::operation("decrypt_credential", e))
    }

    /// Returns the deterministic lookup digest of a value (hex HMAC-SHA256).
    #[must_use]
    pub fn lookup_digest(&self, value: &str) -> String {
        // HMAC accepts keys of any length; 32 bytes never fails.
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.lookup_key) else {
            return String::new();
        };
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Checks if a stored value carries the encryption prefix.
#[must_use]
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}
