//! Startup checks and data-format migrations for the JSON store.
//!
//! Startup runs a fixed, ordered list of idempotent [`InitCheck`]s; the last
//! one applies pending [`JsonMigration`]s. Migration versions are persisted in
//! `meta/meta.json` after each successful step, so a failing step leaves the
//! store at the last version that completed.

use super::{JsonBackend, META_DIR, TMP_DIR};
use crate::models::Metadata;
use crate::storage::schema::EntityKind;
use crate::storage::traits::StorageBackend;
use crate::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;

/// Boxed future returned by init checks and migration steps.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A named startup step.
#[derive(Clone, Copy)]
pub struct InitCheck {
    /// Step name, for logs.
    pub name: &'static str,
    /// The step.
    pub run: for<'a> fn(&'a JsonBackend) -> StepFuture<'a>,
}

/// A numbered data-format migration.
#[derive(Clone, Copy)]
pub struct JsonMigration {
    /// Version reached once this step succeeds (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// The step.
    pub run: for<'a> fn(&'a JsonBackend) -> StepFuture<'a>,
}

/// Built-in migrations.
pub const MIGRATIONS: &[JsonMigration] = &[
    JsonMigration {
        version: 1,
        description: "Rebuild collection indexes from record files",
        run: rebuild_indexes,
    },
    JsonMigration {
        version: 2,
        description: "Lowercase user emails",
        run: lowercase_emails,
    },
];

const INIT_CHECKS: &[InitCheck] = &[
    InitCheck {
        name: "clear staging directory",
        run: clear_staging,
    },
    InitCheck {
        name: "ensure directories",
        run: ensure_directories,
    },
    InitCheck {
        name: "seed files",
        run: seed_files,
    },
    InitCheck {
        name: "sweep stale locks",
        run: sweep_locks,
    },
    InitCheck {
        name: "run migrations",
        run: run_pending_migrations,
    },
];

/// Returns the ordered startup steps.
#[must_use]
pub const fn init_checks() -> &'static [InitCheck] {
    INIT_CHECKS
}

/// Applies every migration newer than the stored version, in order.
///
/// Returns the version reached.
///
/// # Errors
///
/// Returns `Error::Migration` naming the first failing step. The stored
/// version is only written once every pending step has succeeded, so a
/// failed run leaves it unchanged and the whole batch is retried.
pub async fn run_migrations_with(
    backend: &JsonBackend,
    migrations: &[JsonMigration],
) -> Result<i32> {
    let metadata = backend.metadata().await?;
    let mut pending: Vec<&JsonMigration> = migrations
        .iter()
        .filter(|m| m.version > metadata.version)
        .collect();
    pending.sort_by_key(|m| m.version);
    let Some(last) = pending.last().map(|m| m.version) else {
        return Ok(metadata.version);
    };

    for migration in pending {
        (migration.run)(backend)
            .await
            .map_err(|e| Error::Migration {
                version: migration.version,
                cause: format!("{}: {e}", migration.description),
            })?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            root = %backend.root().display(),
            "Applied migration"
        );
    }

    backend.write_metadata(&metadata.advanced_to(last)).await?;
    Ok(last)
}

fn clear_staging(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        let tmp = backend.root().join(TMP_DIR);
        match tokio::fs::remove_dir_all(&tmp).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(Error::operation("json_clear_tmp", e)),
        }
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| Error::operation("json_create_tmp_dir", e))
    })
}

fn ensure_directories(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        let dirs = EntityKind::all()
            .iter()
            .map(|kind| backend.collection_dir(*kind))
            .chain(std::iter::once(backend.root().join(META_DIR)));
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::operation("json_create_dir", format!("{}: {e}", dir.display())))?;
        }
        Ok(())
    })
}

fn seed_files(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        for kind in EntityKind::all() {
            let path = backend.index_path(*kind);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                backend.write_json(&path, &Vec::<Value>::new()).await?;
            }
        }
        let meta = backend.meta_path();
        if !tokio::fs::try_exists(&meta).await.unwrap_or(false) {
            backend.write_json(&meta, &Metadata::initial()).await?;
        }
        Ok(())
    })
}

fn sweep_locks(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        backend.locks().sweep().await?;
        Ok(())
    })
}

fn run_pending_migrations(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        run_migrations_with(backend, MIGRATIONS).await?;
        Ok(())
    })
}

fn rebuild_indexes(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        for kind in EntityKind::all() {
            let count = backend.rebuild_index(*kind).await?;
            tracing::debug!(kind = %kind, count, "Rebuilt index");
        }
        Ok(())
    })
}

fn lowercase_emails(backend: &JsonBackend) -> StepFuture<'_> {
    Box::pin(async move {
        for id in backend.record_ids(EntityKind::Users).await? {
            let Some(mut user) = backend.get(EntityKind::Users, &id).await? else {
                continue;
            };
            let Some(email) = user.get("email").and_then(Value::as_str) else {
                continue;
            };
            let lowered = email.to_lowercase();
            if lowered != email {
                user["email"] = Value::String(lowered);
                backend.upsert(EntityKind::Users, user).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    static FAILING_STEP_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn succeed(_backend: &JsonBackend) -> StepFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn fail(_backend: &JsonBackend) -> StepFuture<'_> {
        FAILING_STEP_RUNS.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(Error::Validation("corrupt record".to_string())) })
    }

    #[tokio::test]
    async fn test_failed_step_leaves_version_unchanged() {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();
        let start = backend.metadata().await.unwrap().version;

        let migrations = [
            JsonMigration {
                version: start + 1,
                description: "ok",
                run: succeed,
            },
            JsonMigration {
                version: start + 2,
                description: "broken",
                run: fail,
            },
            JsonMigration {
                version: start + 3,
                description: "never reached",
                run: succeed,
            },
        ];

        let err = run_migrations_with(&backend, &migrations).await.unwrap_err();
        assert!(matches!(err, Error::Migration { version, .. } if version == start + 2));
        assert_eq!(backend.metadata().await.unwrap().version, start);
        assert_eq!(FAILING_STEP_RUNS.load(Ordering::SeqCst), 1);

        // Without the broken step the whole batch applies and is recorded once.
        let reached = run_migrations_with(&backend, &[migrations[0], migrations[2]])
            .await
            .unwrap();
        assert_eq!(reached, start + 3);
        assert_eq!(backend.metadata().await.unwrap().version, start + 3);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();
        let first = backend.metadata().await.unwrap();
        backend.init().await.unwrap();
        assert_eq!(backend.metadata().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_rebuild_index_from_record_files() {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();

        // A record written behind the store's back is picked up by a rebuild.
        let path = backend.record_path(EntityKind::Users, "u9").unwrap();
        tokio::fs::write(&path, json!({"id": "u9", "email": "x@example.com"}).to_string())
            .await
            .unwrap();
        assert_eq!(backend.rebuild_index(EntityKind::Users).await.unwrap(), 1);
        assert_eq!(
            backend.read_index(EntityKind::Users).await.unwrap(),
            vec![json!({"id": "u9", "email": "x@example.com"})]
        );
    }

    #[tokio::test]
    async fn test_lowercase_emails_migration() {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();
        backend
            .upsert(EntityKind::Users, json!({"id": "u1", "email": "Jane@Example.COM"}))
            .await
            .unwrap();

        lowercase_emails(&backend).await.unwrap();

        let user = backend.get(EntityKind::Users, "u1").await.unwrap().unwrap();
        assert_eq!(user["email"], "jane@example.com");
        assert_eq!(
            backend.read_index(EntityKind::Users).await.unwrap()[0]["email"],
            "jane@example.com"
        );
    }

    #[tokio::test]
    async fn test_stale_locks_swept_on_init() {
        let dir = TempDir::new().unwrap();
        let backend = JsonBackend::new(dir.path());
        backend.init().await.unwrap();
        let stale = backend.collection_dir(EntityKind::Users).join("_index.lock");
        tokio::fs::write(&stale, b"{}").await.unwrap();

        backend.init().await.unwrap();
        assert!(!stale.exists());
    }
}
