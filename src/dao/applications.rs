//! Application and ownership accessor.
//!
//! Applications are stored bare; owners live in their own collection and are
//! attached when an application is read by id.

use super::{Dao, index_query};
use crate::models::{Application, Owner, OwnerRole, Page, User};
use crate::storage::{EntityKind, Query};
use crate::{Error, Result};

/// Kinds deleted together with an application, with their application field.
const DEPENDENTS: &[(EntityKind, &str)] = &[
    (EntityKind::Owners, "appId"),
    (EntityKind::Subscriptions, "application"),
    (EntityKind::Approvals, "application"),
    (EntityKind::Grants, "applicationId"),
];

/// Application accessor, obtained from [`Dao::applications`].
#[derive(Debug, Clone, Copy)]
pub struct Applications<'a> {
    dao: &'a Dao,
}

impl<'a> Applications<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Looks up an application by id, with its owners.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Application>> {
        let Some(mut app) = self
            .dao
            .fetch::<Application>(EntityKind::Applications, id)
            .await?
        else {
            return Ok(None);
        };
        app.owners = self.get_owners(id).await?;
        Ok(Some(app))
    }

    /// Creates an application: the bare record first, then its owners.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if an application with the same id exists
    /// (ignoring case), or `Error::NotFound` if an owner's user does not exist.
    pub async fn create(&self, app: Application) -> Result<Application> {
        if self.id_taken(&app.id).await? {
            return Err(Error::Validation(format!(
                "application '{}' already exists",
                app.id
            )));
        }

        self.dao.store(EntityKind::Applications, &app.bare()).await?;

        let mut created = app.bare();
        for owner in &app.owners {
            created
                .owners
                .push(self.add_owner(&app.id, &owner.user_id, owner.role).await?);
        }
        Ok(created)
    }

    /// Whether any stored application id equals `id` ignoring case.
    async fn id_taken(&self, id: &str) -> Result<bool> {
        let lowered = id.to_lowercase();
        let candidates = self
            .dao
            .backend()
            .index(EntityKind::Applications, &Query::new().filter_like("id", id))
            .await?;
        Ok(candidates.items.iter().any(|record| {
            record["id"]
                .as_str()
                .is_some_and(|existing| existing.to_lowercase() == lowered)
        }))
    }

    /// Stores the bare application, leaving its owners untouched.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn save(&self, app: Application) -> Result<Application> {
        self.dao.store(EntityKind::Applications, &app.bare()).await?;
        Ok(app)
    }

    /// Deletes an application with its owners, subscriptions, approvals and
    /// grants. Returns whether the application existed.
    ///
    /// # Errors
    ///
    /// Returns the first failing delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        for (kind, field) in DEPENDENTS {
            let query = Query::new().filter_eq(*field, id);
            let removed = self.dao.backend().delete_where(*kind, &query).await?;
            if removed > 0 {
                tracing::debug!(application = id, kind = %kind, removed, "Cascaded application delete");
            }
        }
        self.dao.backend().delete(EntityKind::Applications, id).await
    }

    /// One page of bare applications.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_index(&self, offset: usize, limit: usize) -> Result<Page<Application>> {
        self.dao
            .page(EntityKind::Applications, &index_query(offset, limit))
            .await
    }

    /// Number of applications.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_count(&self) -> Result<usize> {
        self.dao
            .backend()
            .count(EntityKind::Applications, &Query::new())
            .await
    }

    /// Owners of an application.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_owners(&self, app_id: &str) -> Result<Vec<Owner>> {
        self.dao
            .all(EntityKind::Owners, &Query::new().filter_eq("appId", app_id))
            .await
    }

    /// Adds or updates the role of a user on an application.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the application or the user does not exist.
    pub async fn add_owner(&self, app_id: &str, user_id: &str, role: OwnerRole) -> Result<Owner> {
        if !self.dao.backend().exists(EntityKind::Applications, app_id).await? {
            return Err(Error::NotFound(format!("application '{app_id}'")));
        }
        let user: User = self
            .dao
            .fetch(EntityKind::Users, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user '{user_id}'")))?;

        let mut owner = Owner::new(app_id, user_id, role);
        owner.email = Some(user.email);
        self.dao.store(EntityKind::Owners, &owner).await?;
        Ok(owner)
    }

    /// Removes a user from an application. Returns whether they were an owner.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete_owner(&self, app_id: &str, user_id: &str) -> Result<bool> {
        self.dao
            .backend()
            .delete(EntityKind::Owners, &Owner::id_for(app_id, user_id))
            .await
    }

    /// Applications a user has any role on, with their owners.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_owner(&self, user_id: &str) -> Result<Vec<Application>> {
        let ownerships: Vec<Owner> = self
            .dao
            .all(EntityKind::Owners, &Query::new().filter_eq("userId", user_id))
            .await?;

        let mut apps = Vec::with_capacity(ownerships.len());
        for ownership in ownerships {
            match self.get_by_id(&ownership.app_id).await? {
                Some(app) => apps.push(app),
                None => tracing::warn!(
                    application = ownership.app_id,
                    user = user_id,
                    "Ownership references a missing application"
                ),
            }
        }
        Ok(apps)
    }

    /// The roles a user can have on an application.
    #[must_use]
    pub const fn get_roles(&self) -> &'static [OwnerRole] {
        OwnerRole::all()
    }
}
