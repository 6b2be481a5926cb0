//! Store metadata accessor.

use super::Dao;
use crate::Result;
use crate::models::Metadata;

/// Metadata accessor, obtained from [`Dao::meta`].
#[derive(Debug, Clone, Copy)]
pub struct Meta<'a> {
    dao: &'a Dao,
}

impl<'a> Meta<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Version and timestamps of the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the store was never initialized.
    pub async fn get_metadata(&self) -> Result<Metadata> {
        self.dao.backend().metadata().await
    }

    /// Removes every record and the store structure. The store must be
    /// initialized again before further use.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn wipe(&self) -> Result<()> {
        tracing::warn!(backend = %self.dao.backend().backend_type(), "Wiping store");
        self.dao.backend().wipe().await
    }
}
