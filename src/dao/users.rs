//! User accessor.

use super::{Dao, index_query};
use crate::models::{Page, User};
use crate::storage::{EntityKind, Query};
use crate::{Error, Result};

/// Kinds holding records that reference a user through `userId`.
const DEPENDENTS: &[EntityKind] = &[
    EntityKind::Registrations,
    EntityKind::Grants,
    EntityKind::Verifications,
    EntityKind::Owners,
];

/// User accessor, obtained from [`Dao::users`].
#[derive(Debug, Clone, Copy)]
pub struct Users<'a> {
    dao: &'a Dao,
}

impl<'a> Users<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Looks up a user by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<User>> {
        self.dao.fetch(EntityKind::Users, id).await
    }

    /// Looks up a user by email, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = Query::new().filter_eq("email", email.trim().to_lowercase());
        self.dao.first(EntityKind::Users, &query).await
    }

    /// Looks up a user by external identity provider id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_custom_id(&self, custom_id: &str) -> Result<Option<User>> {
        let query = Query::new().filter_eq("customId", custom_id);
        self.dao.first(EntityKind::Users, &query).await
    }

    /// Creates a new user.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the id or the email is already taken.
    pub async fn create(&self, user: User) -> Result<User> {
        if self.dao.backend().exists(EntityKind::Users, &user.id).await? {
            return Err(Error::Validation(format!("user '{}' already exists", user.id)));
        }
        if self.get_by_email(&user.email).await?.is_some() {
            return Err(Error::Validation(format!(
                "a user with email '{}' already exists",
                user.email
            )));
        }
        self.save(user).await
    }

    /// Stores a user, replacing any previous version. The email is lowercased.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the email is empty, or the backend's error.
    pub async fn save(&self, mut user: User) -> Result<User> {
        user.email = user.email.trim().to_lowercase();
        if user.email.is_empty() {
            return Err(Error::Validation(format!("user '{}' has no email", user.id)));
        }
        self.dao.store(EntityKind::Users, &user).await?;
        Ok(user)
    }

    /// Deletes a user with their registrations, grants, verifications and
    /// ownerships. Returns whether the user existed.
    ///
    /// # Errors
    ///
    /// Returns the first failing delete; records deleted before it stay deleted.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let by_user = Query::new().filter_eq("userId", id);
        for kind in DEPENDENTS {
            let removed = self.dao.backend().delete_where(*kind, &by_user).await?;
            if removed > 0 {
                tracing::debug!(user = id, kind = %kind, removed, "Cascaded user delete");
            }
        }
        self.dao.backend().delete(EntityKind::Users, id).await
    }

    /// One page of users.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_index(&self, offset: usize, limit: usize) -> Result<Page<User>> {
        self.dao.page(EntityKind::Users, &index_query(offset, limit)).await
    }

    /// Number of users.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_count(&self) -> Result<usize> {
        self.dao.backend().count(EntityKind::Users, &Query::new()).await
    }
}
