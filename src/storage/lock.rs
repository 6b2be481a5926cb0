//! Advisory file locks for the JSON backend.
//!
//! A lock is a sentinel file `<root>/<dir>/<id>.lock` next to the data file
//! `<root>/<dir>/<id>.json` it guards. Sentinels are created with
//! `create_new`, so acquisition is atomic and never blocks: contention is
//! reported immediately and callers decide whether to retry.
//!
//! A `global.lock` at the root blocks every acquisition while present.
//!
//! # Security
//!
//! Resource ids become filenames; only alphanumerics, `-` and `_` are accepted.

use crate::storage::schema::EntityKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Resource id of a collection's `_index.json`.
pub const INDEX_ID: &str = "_index";

/// Resource id of the metadata file.
pub const META_ID: &str = "meta";

const GLOBAL_LOCK: &str = "global.lock";
const LOCK_EXTENSION: &str = "lock";

/// Directory a lockable resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// An entity collection.
    Collection(EntityKind),
    /// The `meta/` directory.
    Meta,
}

impl ResourceKind {
    /// Directory name under the store root.
    #[must_use]
    pub const fn dir(self) -> &'static str {
        match self {
            Self::Collection(kind) => kind.as_str(),
            Self::Meta => "meta",
        }
    }
}

/// A lockable resource: a kind and an id within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Directory.
    pub kind: ResourceKind,
    /// Resource id (file stem).
    pub id: String,
}

impl Resource {
    /// A single record.
    #[must_use]
    pub fn record(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Collection(kind),
            id: id.into(),
        }
    }

    /// A collection's `_index.json`.
    #[must_use]
    pub fn index(kind: EntityKind) -> Self {
        Self::record(kind, INDEX_ID)
    }

    /// The metadata file.
    #[must_use]
    pub fn meta() -> Self {
        Self {
            kind: ResourceKind::Meta,
            id: META_ID.to_string(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.dir(), self.id)
    }
}

/// Checks if an id is safe to use as a filename (no path traversal).
#[must_use]
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Contents of a sentinel, for diagnosing stuck locks.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at_rfc3339: String,
}

/// Removes its sentinel when dropped, whatever way the holder exits.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Leaves the sentinel in place for a later `release`.
    fn keep(self) {
        let mut guard = std::mem::ManuallyDrop::new(self);
        drop(std::mem::take(&mut guard.path));
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            },
        }
    }
}

/// Manages lock sentinels under one store root.
#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
}

impl LockManager {
    /// Creates a manager for the given store root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the data file guarded by a resource.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the id is not a safe filename.
    pub fn data_path(&self, resource: &Resource) -> Result<PathBuf> {
        self.resource_path(resource, "json")
    }

    fn lock_path(&self, resource: &Resource) -> Result<PathBuf> {
        self.resource_path(resource, LOCK_EXTENSION)
    }

    fn resource_path(&self, resource: &Resource, extension: &str) -> Result<PathBuf> {
        if !is_safe_id(&resource.id) {
            return Err(Error::Validation(format!(
                "id contains invalid characters: {}",
                resource.id
            )));
        }
        Ok(self
            .root
            .join(resource.kind.dir())
            .join(format!("{}.{extension}", resource.id)))
    }

    fn global_path(&self) -> PathBuf {
        self.root.join(GLOBAL_LOCK)
    }

    /// Attempts to take the lock on a resource without waiting.
    ///
    /// Returns `Ok(false)` when the resource or the store is already locked.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the guarded data file does not exist, or
    /// `Error::OperationFailed` if the sentinel cannot be written.
    pub async fn acquire(&self, resource: &Resource) -> Result<bool> {
        match self.try_acquire(resource).await? {
            Some(guard) => {
                guard.keep();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn try_acquire(&self, resource: &Resource) -> Result<Option<LockGuard>> {
        let data_path = self.data_path(resource)?;
        let lock_path = self.lock_path(resource)?;

        if self.is_globally_locked().await {
            record_contention(resource);
            return Ok(None);
        }
        if !tokio::fs::try_exists(&data_path).await.unwrap_or(false) {
            return Err(Error::NotFound(format!(
                "cannot lock {resource}: {} does not exist",
                data_path.display()
            )));
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                record_contention(resource);
                return Ok(None);
            },
            Err(e) => return Err(Error::operation("acquire_lock", e)),
        };
        // From here on the sentinel exists; the guard removes it on any failure.
        let guard = LockGuard { path: lock_path };

        let info = LockInfo {
            pid: std::process::id(),
            created_at_rfc3339: chrono::Utc::now().to_rfc3339(),
        };
        let contents = serde_json::to_vec(&info).map_err(|e| Error::operation("acquire_lock", e))?;
        file.write_all(&contents)
            .await
            .map_err(|e| Error::operation("acquire_lock", e))?;

        tracing::trace!(resource = %resource, "Acquired lock");
        Ok(Some(guard))
    }

    /// Releases the lock on a resource. Idempotent; failures are only logged.
    pub async fn release(&self, resource: &Resource) {
        let Ok(path) = self.lock_path(resource) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::trace!(resource = %resource, "Released lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(resource = %resource, error = %e, "Failed to release lock"),
        }
    }

    /// Runs `body` while holding the lock on `resource`.
    ///
    /// The lock is released on every exit path, including errors, panics and
    /// cancellation of the returned future.
    ///
    /// # Errors
    ///
    /// Returns `Error::Locked` without running `body` if the lock is held, or
    /// whatever `body` returns.
    pub async fn with_lock<T, F, Fut>(&self, resource: &Resource, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(guard) = self.try_acquire(resource).await? else {
            return Err(Error::Locked {
                resource: resource.to_string(),
            });
        };
        let result = body().await;
        drop(guard);
        result
    }

    /// Runs `body` while holding every lock in `resources`.
    ///
    /// Locks are taken in order; if one is unavailable the ones already held
    /// are released before failing.
    ///
    /// # Errors
    ///
    /// Returns `Error::Locked` naming the first unavailable resource, or
    /// whatever `body` returns.
    pub async fn with_locked_list<T, F, Fut>(&self, resources: &[Resource], body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guards = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.try_acquire(resource).await? {
                Some(guard) => guards.push(guard),
                None => {
                    return Err(Error::Locked {
                        resource: resource.to_string(),
                    });
                },
            }
        }
        let result = body().await;
        drop(guards);
        result
    }

    /// Takes the global lock. Returns `Ok(false)` if it is already held.
    ///
    /// # Errors
    ///
    /// Returns `Error::OperationFailed` if the sentinel cannot be created.
    pub async fn acquire_global(&self) -> Result<bool> {
        match tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.global_path())
            .await
        {
            Ok(_) => {
                tracing::info!(root = %self.root.display(), "Acquired global lock");
                Ok(true)
            },
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::operation("acquire_global_lock", e)),
        }
    }

    /// Releases the global lock. Idempotent.
    pub async fn release_global(&self) {
        match tokio::fs::remove_file(self.global_path()).await {
            Ok(()) => tracing::info!(root = %self.root.display(), "Released global lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => tracing::warn!(error = %e, "Failed to release global lock"),
        }
    }

    /// Returns whether the global lock is held.
    pub async fn is_globally_locked(&self) -> bool {
        tokio::fs::try_exists(self.global_path())
            .await
            .unwrap_or(false)
    }

    /// Deletes every lock sentinel under the root except the global lock.
    ///
    /// Only safe while no other process uses the store, i.e. at startup.
    ///
    /// # Errors
    ///
    /// Returns `Error::OperationFailed` if a directory cannot be read or a
    /// sentinel cannot be removed.
    pub async fn sweep(&self) -> Result<usize> {
        let global = self.global_path();
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::operation("sweep_locks", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::operation("sweep_locks", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::operation("sweep_locks", e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path != global
                    && path.extension().is_some_and(|ext| ext == LOCK_EXTENSION)
                {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| Error::operation("sweep_locks", e))?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Swept stale locks");
        }
        Ok(removed)
    }
}

fn record_contention(resource: &Resource) {
    metrics::counter!("storage_lock_contention_total", "kind" => resource.kind.dir())
        .increment(1);
    tracing::debug!(resource = %resource, "Lock contention");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn setup() -> (TempDir, LockManager, Resource) {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users");
        tokio::fs::create_dir_all(&users).await.unwrap();
        tokio::fs::write(users.join("u1.json"), b"{}").await.unwrap();
        let manager = LockManager::new(dir.path());
        (dir, manager, Resource::record(EntityKind::Users, "u1"))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (_dir, manager, resource) = setup().await;

        assert!(manager.acquire(&resource).await.unwrap());
        assert!(!manager.acquire(&resource).await.unwrap());

        manager.release(&resource).await;
        manager.release(&resource).await;
        assert!(manager.acquire(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_leaves_sentinel_until_release() {
        let (dir, manager, resource) = setup().await;
        let sentinel = dir.path().join("users").join(format!("u1.{LOCK_EXTENSION}"));

        assert!(manager.acquire(&resource).await.unwrap());
        assert!(sentinel.exists());
        assert!(!manager.acquire(&resource).await.unwrap());
        assert!(sentinel.exists());

        manager.release(&resource).await;
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn test_acquire_missing_data_file() {
        let (_dir, manager, _) = setup().await;
        let missing = Resource::record(EntityKind::Users, "nobody");
        assert!(matches!(
            manager.acquire(&missing).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unsafe_ids_are_rejected() {
        let (_dir, manager, _) = setup().await;
        for id in ["../etc/passwd", "a/b", "", "a.b"] {
            let resource = Resource::record(EntityKind::Users, id);
            assert!(matches!(
                manager.acquire(&resource).await,
                Err(Error::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (_dir, manager, resource) = setup().await;

        let result: Result<()> = manager
            .with_lock(&resource, || async {
                Err(Error::Validation("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(manager.acquire(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_with_lock_runs_exactly_one() {
        let (_dir, manager, resource) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let holder = {
            let manager = manager.clone();
            let resource = resource.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                manager
                    .with_lock(&resource, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = entered_tx.send(());
                        let _ = finish_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        entered_rx.await.unwrap();
        let contender = manager
            .with_lock(&resource, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(contender, Err(Error::Locked { .. })));

        finish_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(manager.acquire(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_list_releases_acquired_on_contention() {
        let (dir, manager, first) = setup().await;
        tokio::fs::write(dir.path().join("users/u2.json"), b"{}")
            .await
            .unwrap();
        let second = Resource::record(EntityKind::Users, "u2");

        assert!(manager.acquire(&second).await.unwrap());
        let result = manager
            .with_locked_list(&[first.clone(), second.clone()], || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(Error::Locked { resource }) if resource == "users/u2"));

        // The first lock was given back.
        assert!(manager.acquire(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_global_lock_blocks_acquisition() {
        let (_dir, manager, resource) = setup().await;

        assert!(manager.acquire_global().await.unwrap());
        assert!(!manager.acquire_global().await.unwrap());
        assert!(!manager.acquire(&resource).await.unwrap());

        manager.release_global().await;
        assert!(manager.acquire(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_keeps_global_lock() {
        let (_dir, manager, resource) = setup().await;
        assert!(manager.acquire(&resource).await.unwrap());
        assert!(manager.acquire_global().await.unwrap());

        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert!(manager.is_globally_locked().await);
    }
}
