//! Verification token accessor.

use super::{Dao, index_query};
use crate::models::{Page, Verification};
use crate::storage::{EntityKind, Query};
use crate::Result;

/// Verification accessor, obtained from [`Dao::verifications`].
#[derive(Debug, Clone, Copy)]
pub struct Verifications<'a> {
    dao: &'a Dao,
}

impl<'a> Verifications<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Stores a verification.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn create(&self, verification: Verification) -> Result<Verification> {
        self.dao
            .store(EntityKind::Verifications, &verification)
            .await?;
        Ok(verification)
    }

    /// Looks up a verification by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Verification>> {
        self.dao.fetch(EntityKind::Verifications, id).await
    }

    /// Every verification, expired ones included.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_all(&self) -> Result<Vec<Verification>> {
        self.dao.all(EntityKind::Verifications, &Query::new()).await
    }

    /// One page of verifications.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_index(&self, offset: usize, limit: usize) -> Result<Page<Verification>> {
        self.dao
            .page(EntityKind::Verifications, &index_query(offset, limit))
            .await
    }

    /// Deletes a verification. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.dao.backend().delete(EntityKind::Verifications, id).await
    }

    /// Deletes every verification expired at `now` (epoch milliseconds).
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the first failing delete.
    pub async fn reconcile(&self, now: i64) -> Result<usize> {
        let mut removed = 0;
        for verification in self.get_all().await? {
            if verification.is_expired(now) && self.delete(&verification.id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed expired verifications");
        }
        Ok(removed)
    }
}
