//! Subscription and approval accessors.
//!
//! Subscription credentials (`apikey`, `clientId`, `clientSecret`) are
//! encrypted before they reach the backend. Client-id lookups go through an
//! HMAC digest kept in the indexed `clientIdHash` property, so no record has
//! to be decrypted to find one.

use super::{Dao, from_record, index_query, to_record};
use crate::models::{Approval, Page, Subscription};
use crate::security::is_encrypted;
use crate::storage::{EntityKind, Query};
use crate::{Error, Result};
use serde_json::Value;

const CREDENTIAL_FIELDS: &[&str] = &["apikey", "clientId", "clientSecret"];
const CLIENT_ID_HASH: &str = "clientIdHash";

/// Subscription accessor, obtained from [`Dao::subscriptions`].
#[derive(Debug, Clone, Copy)]
pub struct Subscriptions<'a> {
    dao: &'a Dao,
}

impl<'a> Subscriptions<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Builds the stored form: credentials encrypted plus the client-id digest.
    fn encode(&self, subscription: &Subscription) -> Result<Value> {
        let cipher = self.dao.cipher();
        let mut record = to_record(EntityKind::Subscriptions, subscription)?;
        if let Some(client_id) = &subscription.client_id {
            record[CLIENT_ID_HASH] = Value::String(cipher.lookup_digest(client_id));
        }
        for field in CREDENTIAL_FIELDS {
            let plain = match record.get(*field) {
                Some(Value::String(plain)) if !is_encrypted(plain) => plain.clone(),
                _ => continue,
            };
            record[*field] = Value::String(cipher.encrypt(&plain)?);
        }
        Ok(record)
    }

    /// Decrypts a stored record into a subscription.
    fn decode(&self, mut record: Value) -> Result<Subscription> {
        let cipher = self.dao.cipher();
        if let Some(map) = record.as_object_mut() {
            map.remove(CLIENT_ID_HASH);
            for field in CREDENTIAL_FIELDS {
                if let Some(Value::String(stored)) = map.get(*field) {
                    let plain = cipher.decrypt(stored)?;
                    map.insert((*field).to_string(), Value::String(plain));
                }
            }
        }
        from_record(EntityKind::Subscriptions, record)
    }

    async fn find(&self, query: &Query) -> Result<Page<Subscription>> {
        self.dao
            .backend()
            .index(EntityKind::Subscriptions, query)
            .await?
            .try_map(|record| self.decode(record))
    }

    async fn find_all(&self, query: &Query) -> Result<Vec<Subscription>> {
        Ok(self.find(&query.unpaged()).await?.items)
    }

    async fn find_first(&self, query: &Query) -> Result<Option<Subscription>> {
        Ok(self
            .find(&query.clone().page(0, 1))
            .await?
            .items
            .into_iter()
            .next())
    }

    /// Looks up a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error, or `Error::OperationFailed` if a
    /// credential cannot be decrypted with the configured key.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Subscription>> {
        self.dao
            .backend()
            .get(EntityKind::Subscriptions, id)
            .await?
            .map(|record| self.decode(record))
            .transpose()
    }

    /// Creates a subscription.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the id is taken or the application
    /// already subscribes to the API.
    pub async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        if self
            .dao
            .backend()
            .exists(EntityKind::Subscriptions, &subscription.id)
            .await?
        {
            return Err(Error::Validation(format!(
                "subscription '{}' already exists",
                subscription.id
            )));
        }
        if self
            .get_by_app_and_api(&subscription.application, &subscription.api)
            .await?
            .is_some()
        {
            return Err(Error::Validation(format!(
                "application '{}' already subscribes to '{}'",
                subscription.application, subscription.api
            )));
        }
        self.save(subscription).await
    }

    /// Stores a subscription, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn save(&self, subscription: Subscription) -> Result<Subscription> {
        let record = self.encode(&subscription)?;
        self.dao
            .backend()
            .upsert(EntityKind::Subscriptions, record)
            .await?;
        Ok(subscription)
    }

    /// Merges `patch` into the stored subscription and saves the result.
    ///
    /// Keys of `patch` replace the stored ones; `id` cannot be changed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the subscription does not exist, or
    /// `Error::Validation` if `patch` is not an object or yields an invalid
    /// subscription.
    pub async fn patch(&self, id: &str, patch: &Value) -> Result<Subscription> {
        let Value::Object(changes) = patch else {
            return Err(Error::Validation("patch must be a JSON object".to_string()));
        };
        let current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subscription '{id}'")))?;

        let mut merged = to_record(EntityKind::Subscriptions, &current)?;
        for (key, value) in changes {
            if key != "id" {
                merged[key.as_str()] = value.clone();
            }
        }
        let updated: Subscription = from_record(EntityKind::Subscriptions, merged)?;
        self.save(updated).await
    }

    /// Deletes a subscription and its pending approvals. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the first failing delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        Approvals::new(self.dao).delete_by_subscription(id).await?;
        self.dao
            .backend()
            .delete(EntityKind::Subscriptions, id)
            .await
    }

    /// One page of subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_index(&self, offset: usize, limit: usize) -> Result<Page<Subscription>> {
        self.find(&index_query(offset, limit)).await
    }

    /// Number of subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_count(&self) -> Result<usize> {
        self.dao
            .backend()
            .count(EntityKind::Subscriptions, &Query::new())
            .await
    }

    /// Subscriptions of an application.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_app_id(&self, app_id: &str) -> Result<Vec<Subscription>> {
        self.find_all(&Query::new().filter_eq("application", app_id))
            .await
    }

    /// Looks up a subscription by OAuth client id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_client_id(&self, client_id: &str) -> Result<Option<Subscription>> {
        let digest = self.dao.cipher().lookup_digest(client_id);
        self.find_first(&Query::new().filter_eq(CLIENT_ID_HASH, digest))
            .await
    }

    /// The subscription of an application to an API, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_app_and_api(
        &self,
        app_id: &str,
        api_id: &str,
    ) -> Result<Option<Subscription>> {
        self.find_first(
            &Query::new()
                .filter_eq("application", app_id)
                .filter_eq("api", api_id),
        )
        .await
    }

    /// One page of the subscriptions to an API.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_api(
        &self,
        api_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Subscription>> {
        self.find(&Query::new().filter_eq("api", api_id).page(offset, limit))
            .await
    }
}

/// Approval accessor, obtained from [`Dao::approvals`].
#[derive(Debug, Clone, Copy)]
pub struct Approvals<'a> {
    dao: &'a Dao,
}

impl<'a> Approvals<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Every pending approval.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_all(&self) -> Result<Vec<Approval>> {
        self.dao.all(EntityKind::Approvals, &Query::new()).await
    }

    /// Looks up an approval by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Approval>> {
        self.dao.fetch(EntityKind::Approvals, id).await
    }

    /// Stores an approval request.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn create(&self, approval: Approval) -> Result<Approval> {
        self.dao.store(EntityKind::Approvals, &approval).await?;
        Ok(approval)
    }

    /// Deletes an approval. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.dao.backend().delete(EntityKind::Approvals, id).await
    }

    /// Deletes the approvals of an application on an API.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete_by_app_and_api(&self, app_id: &str, api_id: &str) -> Result<usize> {
        let query = Query::new()
            .filter_eq("application", app_id)
            .filter_eq("api", api_id);
        self.dao
            .backend()
            .delete_where(EntityKind::Approvals, &query)
            .await
    }

    /// Deletes the approvals of a subscription.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete_by_subscription(&self, subscription_id: &str) -> Result<usize> {
        let query = Query::new().filter_eq("subscriptionId", subscription_id);
        self.dao
            .backend()
            .delete_where(EntityKind::Approvals, &query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::CredentialCipher;
    use crate::storage::JsonBackend;
    use crate::storage::StorageBackend;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn dao(dir: &TempDir) -> Dao {
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();
        Dao::with_backend(Arc::new(backend), CredentialCipher::new([3u8; 32]))
    }

    fn subscription() -> Subscription {
        let mut sub = Subscription::new("s1", "app", "petstore", "basic");
        sub.apikey = Some("key-123".to_string());
        sub.client_id = Some("client-abc".to_string());
        sub.client_secret = Some("shh".to_string());
        sub
    }

    #[tokio::test]
    async fn test_credentials_encrypted_at_rest() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        dao.subscriptions().create(subscription()).await.unwrap();

        let raw = dao
            .backend()
            .get(EntityKind::Subscriptions, "s1")
            .await
            .unwrap()
            .unwrap();
        for field in CREDENTIAL_FIELDS {
            let stored = raw[*field].as_str().unwrap();
            assert!(is_encrypted(stored), "{field} stored in plaintext");
        }
        assert!(!raw.to_string().contains("key-123"));
        assert!(raw[CLIENT_ID_HASH].is_string());

        let loaded = dao.subscriptions().get_by_id("s1").await.unwrap().unwrap();
        assert_eq!(loaded, subscription());
    }

    #[tokio::test]
    async fn test_get_by_client_id_uses_digest() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        dao.subscriptions().create(subscription()).await.unwrap();

        let found = dao
            .subscriptions()
            .get_by_client_id("client-abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "s1");
        assert!(dao
            .subscriptions()
            .get_by_client_id("other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_patch_merges_and_reencrypts() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        dao.subscriptions().create(subscription()).await.unwrap();

        let patched = dao
            .subscriptions()
            .patch("s1", &json!({"approved": true, "apikey": "key-456", "id": "hijack"}))
            .await
            .unwrap();
        assert!(patched.approved);
        assert_eq!(patched.id, "s1");
        assert_eq!(patched.apikey.as_deref(), Some("key-456"));
        assert_eq!(patched.plan, "basic");

        let raw = dao
            .backend()
            .get(EntityKind::Subscriptions, "s1")
            .await
            .unwrap()
            .unwrap();
        assert!(is_encrypted(raw["apikey"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_patch_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        assert!(matches!(
            dao.subscriptions().patch("nope", &json!({})).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_app_and_api_rejected() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        dao.subscriptions().create(subscription()).await.unwrap();
        let again = Subscription::new("s2", "app", "petstore", "premium");
        assert!(matches!(
            dao.subscriptions().create(again).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_approvals() {
        let dir = TempDir::new().unwrap();
        let dao = dao(&dir).await;
        let sub = dao.subscriptions().create(subscription()).await.unwrap();
        dao.approvals()
            .create(Approval::for_subscription("ap1", &sub))
            .await
            .unwrap();

        assert!(dao.subscriptions().delete("s1").await.unwrap());
        assert!(dao.approvals().get_all().await.unwrap().is_empty());
    }
}
