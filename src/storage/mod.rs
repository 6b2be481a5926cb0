//! Storage layer.
//!
//! Both backends implement [`StorageBackend`] over canonical JSON records:
//! - **JSON**: a directory of record files plus per-collection index files,
//!   serialized with advisory lock files ([`JsonBackend`])
//! - **PostgreSQL**: one table per entity kind with typed columns and a JSONB
//!   payload ([`PostgresBackend`])
//!
//! The entity table in [`schema`] drives both: which properties are indexed,
//! how they map to columns, and which query names are aliases or joins.

// Allow significant_drop_tightening - dropping pooled connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod json;
pub mod lock;
pub mod paging;
pub mod postgres;
pub mod query;
pub mod record;
pub mod schema;
pub mod traits;

pub use json::JsonBackend;
pub use lock::{LockGuard, LockManager, Resource, ResourceKind};
pub use paging::{page_count, paginate};
pub use postgres::PostgresBackend;
pub use query::{Filter, Operator, Query, SortOrder};
pub use schema::{EntityKind, EntitySchema};
pub use traits::{NotificationCallback, StorageBackend};

use crate::config::BackendConfig;
use crate::Result;
use std::sync::Arc;

/// Opens the configured backend.
///
/// PostgreSQL is bootstrapped and migrated while connecting; callers still
/// call [`StorageBackend::init`] before first use.
///
/// # Errors
///
/// Returns `Error::Connectivity` or `Error::Migration` from the PostgreSQL
/// bootstrap.
pub async fn open_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    Ok(match config {
        BackendConfig::Json(json) => Arc::new(JsonBackend::new(json.path.clone())),
        BackendConfig::Postgres(pg) => Arc::new(PostgresBackend::connect(pg).await?),
    })
}
