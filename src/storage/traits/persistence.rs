//! Persistence backend trait.

use crate::config::BackendType;
use crate::models::{Metadata, Page};
use crate::storage::query::Query;
use crate::storage::schema::EntityKind;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Callback invoked with the payload of every notification on a channel.
pub type NotificationCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// The storage contract shared by every backend.
///
/// Records are exchanged as canonical JSON objects carrying a string `id`.
/// Storage is whole-record replace: callers merge before calling
/// [`upsert`](Self::upsert).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns which backend this is.
    fn backend_type(&self) -> BackendType;

    /// Prepares the store: creates missing structure and runs pending migrations.
    ///
    /// Idempotent; called once at startup.
    async fn init(&self) -> Result<()>;

    /// Retrieves a record by id.
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>>;

    /// Creates or replaces a record.
    ///
    /// Fails with `Error::Validation` if a mandatory indexed property is missing.
    async fn upsert(&self, kind: EntityKind, record: Value) -> Result<()>;

    /// Deletes a record by id. Returns whether it existed.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Deletes every record matching the query's filters.
    ///
    /// A query without filters is rejected with `Error::Validation`.
    async fn delete_where(&self, kind: EntityKind, query: &Query) -> Result<usize>;

    /// Returns one page of matching records plus the total match count.
    async fn index(&self, kind: EntityKind, query: &Query) -> Result<Page<Value>>;

    /// Counts matching records, ignoring paging.
    async fn count(&self, kind: EntityKind, query: &Query) -> Result<usize>;

    /// Returns the store metadata.
    async fn metadata(&self) -> Result<Metadata>;

    /// Removes every stored record and the store structure itself.
    async fn wipe(&self) -> Result<()>;

    /// Publishes a notification on a channel.
    async fn notify(&self, channel: &str, payload: &Value) -> Result<()>;

    /// Registers a callback for a channel.
    async fn subscribe(&self, channel: &str, callback: NotificationCallback) -> Result<()>;

    /// Checks if a record exists.
    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self.get(kind, id).await?.is_some())
    }
}
