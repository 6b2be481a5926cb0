//! Security features.
//!
//! Encryption at rest for subscription credentials.

pub mod credentials;

pub use credentials::{CredentialCipher, is_encrypted};
