//! Registration and grant accessors.
//!
//! Both are keyed by a natural key (pool + user, user + application + API);
//! `upsert` keeps the id of an existing record with the same key.

use super::Dao;
use crate::models::{Grant, Page, Registration};
use crate::storage::{EntityKind, Query};
use crate::Result;

/// Registration accessor, obtained from [`Dao::registrations`].
#[derive(Debug, Clone, Copy)]
pub struct Registrations<'a> {
    dao: &'a Dao,
}

impl<'a> Registrations<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    fn pool_and_user(pool_id: &str, user_id: &str) -> Query {
        Query::new()
            .filter_eq("poolId", pool_id)
            .filter_eq("userId", user_id)
    }

    /// The registration of a user in a pool, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_pool_and_user(
        &self,
        pool_id: &str,
        user_id: &str,
    ) -> Result<Option<Registration>> {
        self.dao
            .first(EntityKind::Registrations, &Self::pool_and_user(pool_id, user_id))
            .await
    }

    /// Every registration of a user.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<Registration>> {
        self.dao
            .all(
                EntityKind::Registrations,
                &Query::new().filter_eq("userId", user_id),
            )
            .await
    }

    /// One page of a pool's registrations, optionally limited to a namespace.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_pool(
        &self,
        pool_id: &str,
        namespace: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Registration>> {
        let mut query = Query::new().filter_eq("poolId", pool_id);
        if let Some(namespace) = namespace {
            query = query.filter_eq("namespace", namespace);
        }
        self.dao
            .page(EntityKind::Registrations, &query.page(offset, limit))
            .await
    }

    /// Creates or replaces the registration of a user in a pool.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn upsert(&self, mut registration: Registration) -> Result<Registration> {
        if let Some(existing) = self
            .get_by_pool_and_user(&registration.pool_id, &registration.user_id)
            .await?
        {
            registration.id = existing.id;
        }
        self.dao
            .store(EntityKind::Registrations, &registration)
            .await?;
        Ok(registration)
    }

    /// Deletes the registration of a user in a pool. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, pool_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .dao
            .backend()
            .delete_where(EntityKind::Registrations, &Self::pool_and_user(pool_id, user_id))
            .await?
            > 0)
    }
}

/// Grant accessor, obtained from [`Dao::grants`].
#[derive(Debug, Clone, Copy)]
pub struct Grants<'a> {
    dao: &'a Dao,
}

impl<'a> Grants<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    fn user_app_and_api(user_id: &str, app_id: &str, api_id: &str) -> Query {
        Query::new()
            .filter_eq("userId", user_id)
            .filter_eq("applicationId", app_id)
            .filter_eq("apiId", api_id)
    }

    /// Every grant of a user.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<Grant>> {
        self.dao
            .all(EntityKind::Grants, &Query::new().filter_eq("userId", user_id))
            .await
    }

    /// The grant of a user for an application on an API, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_user_app_and_api(
        &self,
        user_id: &str,
        app_id: &str,
        api_id: &str,
    ) -> Result<Option<Grant>> {
        self.dao
            .first(
                EntityKind::Grants,
                &Self::user_app_and_api(user_id, app_id, api_id),
            )
            .await
    }

    /// Creates or replaces a grant.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn upsert(&self, mut grant: Grant) -> Result<Grant> {
        if let Some(existing) = self
            .get_by_user_app_and_api(&grant.user_id, &grant.application_id, &grant.api_id)
            .await?
        {
            grant.id = existing.id;
        }
        self.dao.store(EntityKind::Grants, &grant).await?;
        Ok(grant)
    }

    /// Deletes a grant. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, user_id: &str, app_id: &str, api_id: &str) -> Result<bool> {
        Ok(self
            .dao
            .backend()
            .delete_where(
                EntityKind::Grants,
                &Self::user_app_and_api(user_id, app_id, api_id),
            )
            .await?
            > 0)
    }
}
