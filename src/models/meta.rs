//! Store metadata and paged results.

use serde::{Deserialize, Serialize};

/// Version information of a store.
///
/// The version is advanced only by migration steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Applied migration version.
    pub version: i32,
    /// Creation timestamp (RFC 3339).
    pub create_date: String,
    /// Timestamp of the last version change (RFC 3339).
    pub last_update: String,
}

impl Metadata {
    /// Creates metadata at version 0, stamped now.
    #[must_use]
    pub fn initial() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            version: 0,
            create_date: now.clone(),
            last_update: now,
        }
    }

    /// Returns a copy advanced to `version`, stamped now.
    #[must_use]
    pub fn advanced_to(&self, version: i32) -> Self {
        Self {
            version,
            create_date: self.create_date.clone(),
            last_update: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total number of matching items, ignoring paging.
    pub count: usize,
    /// Whether `count` came from a cache.
    pub count_cached: bool,
}

impl<T> Page<T> {
    /// Maps the items of the page, keeping the counts.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            count: self.count,
            count_cached: self.count_cached,
        }
    }

    /// Fallible variant of [`Page::map`].
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<Vec<_>, E>>()?,
            count: self.count,
            count_cached: self.count_cached,
        })
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            count_cached: false,
        }
    }
}
