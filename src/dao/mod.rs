//! DAO facade.
//!
//! [`Dao`] owns exactly one storage backend and hands out entity-scoped
//! accessors that convert between typed models and the canonical records the
//! backends store:
//!
//! ```rust,ignore
//! let dao = Dao::from_config(&config).await?;
//! let user = dao.users().get_by_email("jane@example.com").await?;
//! let apps = dao.applications().get_by_owner(&user.id).await?;
//! ```
//!
//! Accessors share the method names `get_by_id`, `create`, `save`, `delete`,
//! `get_index` and `get_count`. Deletes cascade to dependent records.

mod applications;
mod meta;
mod registrations;
mod subscriptions;
mod users;
mod verifications;
mod webhooks;

pub use applications::Applications;
pub use meta::Meta;
pub use registrations::{Grants, Registrations};
pub use subscriptions::{Approvals, Subscriptions};
pub use users::Users;
pub use verifications::Verifications;
pub use webhooks::{WebhookEvents, WebhookListeners, Webhooks};

use crate::config::StorageConfig;
use crate::models::Page;
use crate::security::CredentialCipher;
use crate::storage::{self, EntityKind, NotificationCallback, Query, StorageBackend};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Entry point to portal storage.
#[derive(Clone)]
pub struct Dao {
    backend: Arc<dyn StorageBackend>,
    cipher: CredentialCipher,
}

impl std::fmt::Debug for Dao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dao")
            .field("backend", &self.backend.backend_type())
            .finish_non_exhaustive()
    }
}

impl Dao {
    /// Opens and initializes the configured backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if no valid credential key is configured,
    /// or the backend's error if it cannot be opened or initialized.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let key = config.credential_key.as_ref().ok_or_else(|| {
            Error::Validation("a credential key is required to open the store".to_string())
        })?;
        let cipher = CredentialCipher::from_secret(key)?;

        let backend = storage::open_backend(&config.storage).await?;
        backend.init().await?;

        tracing::info!(backend = %backend.backend_type(), "Storage initialized");
        Ok(Self::with_backend(backend, cipher))
    }

    /// Wraps an already initialized backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn StorageBackend>, cipher: CredentialCipher) -> Self {
        Self { backend, cipher }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Returns the credential cipher.
    #[must_use]
    pub const fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    /// User accessor.
    #[must_use]
    pub const fn users(&self) -> Users<'_> {
        Users::new(self)
    }

    /// Application and ownership accessor.
    #[must_use]
    pub const fn applications(&self) -> Applications<'_> {
        Applications::new(self)
    }

    /// Subscription accessor.
    #[must_use]
    pub const fn subscriptions(&self) -> Subscriptions<'_> {
        Subscriptions::new(self)
    }

    /// Approval accessor.
    #[must_use]
    pub const fn approvals(&self) -> Approvals<'_> {
        Approvals::new(self)
    }

    /// Verification accessor.
    #[must_use]
    pub const fn verifications(&self) -> Verifications<'_> {
        Verifications::new(self)
    }

    /// Webhook listener and event accessor.
    #[must_use]
    pub const fn webhooks(&self) -> Webhooks<'_> {
        Webhooks::new(self)
    }

    /// Registration accessor.
    #[must_use]
    pub const fn registrations(&self) -> Registrations<'_> {
        Registrations::new(self)
    }

    /// Grant accessor.
    #[must_use]
    pub const fn grants(&self) -> Grants<'_> {
        Grants::new(self)
    }

    /// Store metadata accessor.
    #[must_use]
    pub const fn meta(&self) -> Meta<'_> {
        Meta::new(self)
    }

    /// Registers a callback for notifications on `channel`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn subscribe(&self, channel: &str, callback: NotificationCallback) -> Result<()> {
        self.backend.subscribe(channel, callback).await
    }

    /// Publishes a notification on `channel`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        self.backend.notify(channel, payload).await
    }

    pub(crate) async fn fetch<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<T>> {
        self.backend
            .get(kind, id)
            .await?
            .map(|record| from_record(kind, record))
            .transpose()
    }

    pub(crate) async fn store<T: Serialize>(&self, kind: EntityKind, value: &T) -> Result<()> {
        self.backend.upsert(kind, to_record(kind, value)?).await
    }

    pub(crate) async fn page<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        query: &Query,
    ) -> Result<Page<T>> {
        self.backend
            .index(kind, query)
            .await?
            .try_map(|record| from_record(kind, record))
    }

    /// Every record matching the query, ignoring paging.
    pub(crate) async fn all<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        query: &Query,
    ) -> Result<Vec<T>> {
        Ok(self.page(kind, &query.unpaged()).await?.items)
    }

    pub(crate) async fn first<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        query: &Query,
    ) -> Result<Option<T>> {
        let query = query.clone().page(0, 1);
        Ok(self.page(kind, &query).await?.items.into_iter().next())
    }
}

/// Serializes a model into a canonical record.
pub(crate) fn to_record<T: Serialize>(kind: EntityKind, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::operation(&format!("serialize_{kind}"), e))
}

/// Deserializes a canonical record into a model.
pub(crate) fn from_record<T: DeserializeOwned>(kind: EntityKind, record: Value) -> Result<T> {
    serde_json::from_value(record)
        .map_err(|e| Error::Validation(format!("corrupt {kind} record: {e}")))
}

/// `get_index` query shared by the accessors.
pub(crate) fn index_query(offset: usize, limit: usize) -> Query {
    Query::new().page(offset, limit)
}
