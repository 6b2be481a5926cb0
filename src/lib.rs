//! # portal-dao
//!
//! Storage layer for a developer portal.
//!
//! Users, applications, API subscriptions, approvals, verifications, webhook
//! listeners and events, registrations and grants are persisted behind a single
//! DAO contract with two interchangeable backends:
//!
//! - **JSON**: one JSON document per record plus an `_index.json` summary per
//!   collection, serialized with advisory lock files
//! - **PostgreSQL**: one table per entity with indexed columns and a JSONB payload,
//!   pooled connections, a count cache and LISTEN/NOTIFY change notification
//!
//! A migrator copies a complete store from one backend instance to another.
//!
//! ## Example
//!
//! ```rust,ignore
//! use portal_dao::{Dao, StorageConfig};
//!
//! let config = StorageConfig::load_from_file(path)?.with_env_overrides();
//! let dao = Dao::from_config(&config).await?;
//! let user = dao.users().get_by_email("jane@example.com").await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod dao;
pub mod migrate;
pub mod models;
pub mod observability;
pub mod security;
pub mod storage;

// Re-exports for convenience
pub use config::{BackendConfig, JsonConfig, MigrationConfig, PostgresConfig, StorageConfig};
pub use dao::Dao;
pub use migrate::{MigrationReport, MigrationWarning, Migrator};
pub use models::{
    Application, Approval, Grant, Metadata, Owner, OwnerRole, Page, Registration, Subscription,
    User, Verification, WebhookEvent, WebhookListener,
};
pub use storage::{EntityKind, JsonBackend, PostgresBackend, Query, StorageBackend};

/// Error type for storage operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Locked` | A lock sentinel for the resource (or the global lock) is held |
/// | `NotFound` | A referenced record or data file does not exist |
/// | `Validation` | Missing mandatory indexed field, malformed filter, unsafe id |
/// | `Connectivity` | PostgreSQL unreachable after the bootstrap retries |
/// | `Migration` | A schema or data-format migration step failed |
/// | `OperationFailed` | I/O, SQL or serialization failures |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The resource is locked by another holder.
    ///
    /// Never retried by the storage layer; callers retry (HTTP 423).
    #[error("resource '{resource}' is locked")]
    Locked {
        /// The resource that could not be acquired.
        resource: String,
    },

    /// A referenced entity or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided or a stored record is corrupt.
    ///
    /// Raised when:
    /// - A record misses a mandatory indexed property
    /// - A query names a field that is not a plain identifier
    /// - A record id is not a safe filename
    /// - Configuration values cannot be parsed
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend could not be reached.
    #[error("cannot connect to {target}: {cause}")]
    Connectivity {
        /// The backend that was contacted.
        target: String,
        /// The underlying cause.
        cause: String,
    },

    /// A schema or data-format migration failed.
    #[error("migration to version {version} failed: {cause}")]
    Migration {
        /// The migration version that failed.
        version: i32,
        /// The underlying cause.
        cause: String,
    },

    /// An operation failed.
    ///
    /// Raised when:
    /// - Filesystem I/O errors occur
    /// - PostgreSQL queries fail
    /// - JSON (de)serialization fails
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns the HTTP-equivalent status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Locked { .. } => 423,
            Self::NotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::Connectivity { .. } => 503,
            Self::Migration { .. } | Self::OperationFailed { .. } => 500,
        }
    }

    /// Helper for building an `OperationFailed` error from any displayable cause.
    pub(crate) fn operation(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Uses `SystemTime::now()` with fallback to 0 if the system clock is before the
/// Unix epoch.
#[must_use]
pub fn current_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
