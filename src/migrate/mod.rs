//! Cross-backend migration.
//!
//! Copies a complete store from one backend instance to another, for example
//! from a JSON directory into PostgreSQL. Records are copied as stored, so
//! encrypted credentials move without being decrypted.
//!
//! Application ids are folded to lowercase. Ids that differ only in case are
//! reported as severe warnings and skipped together with everything that
//! references them; they are never merged.
//!
//! # Order
//!
//! 1. Scan applications for case collisions
//! 2. Users, each followed by its registrations
//! 3. Applications (bare), then their owners
//! 4. Subscriptions, approvals and grants, with application references folded
//! 5. Webhook listeners
//!
//! Verifications and webhook events are short-lived and not copied.

mod report;

pub use report::{MigrationReport, MigrationWarning, Severity};

use crate::config::{BackendConfig, MigrationConfig};
use crate::models::{Owner, new_id};
use crate::security::CredentialCipher;
use crate::storage::paging::page_count;
use crate::storage::record::record_id;
use crate::storage::{self, EntityKind, JsonBackend, Query, StorageBackend};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Default number of records fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 5;

/// Boxed future returned by cleanup hooks.
pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A cleanup action run once after the migration, whatever its outcome.
pub type CleanupHook = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Copies every record from a source store into a target store.
pub struct Migrator {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    page_size: usize,
    cipher: Option<CredentialCipher>,
    cleanup: Vec<(String, CleanupHook)>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("source", &self.source.backend_type())
            .field("target", &self.target.backend_type())
            .field("page_size", &self.page_size)
            .field("cleanup_hooks", &self.cleanup.len())
            .finish_non_exhaustive()
    }
}

/// Pages through every record of a kind.
struct Pager<'a> {
    backend: &'a dyn StorageBackend,
    kind: EntityKind,
    query: Query,
    page_size: usize,
    page: usize,
    pages: usize,
}

impl<'a> Pager<'a> {
    async fn new(
        backend: &'a dyn StorageBackend,
        kind: EntityKind,
        query: Query,
        page_size: usize,
    ) -> Result<Self> {
        let total = backend
            .count(kind, &query.clone().bypass_count_cache())
            .await?;
        Ok(Self {
            backend,
            kind,
            query,
            page_size,
            page: 0,
            pages: page_count(total, page_size),
        })
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        if self.page >= self.pages {
            return Ok(None);
        }
        let query = self
            .query
            .clone()
            .page(self.page * self.page_size, self.page_size);
        self.page += 1;
        Ok(Some(self.backend.index(self.kind, &query).await?.items))
    }
}

/// Outcome of the application pre-pass.
#[derive(Debug, Default)]
struct ApplicationIds {
    /// Lowercase id → original id.
    canonical: HashMap<String, String>,
    /// Lowercase ids shared by more than one original id.
    duplicates: HashSet<String>,
}

impl ApplicationIds {
    /// Target id of a source application reference, if it is migrated.
    fn resolve(&self, app_id: &str) -> Option<String> {
        let lowered = app_id.to_lowercase();
        (self.canonical.contains_key(&lowered) && !self.duplicates.contains(&lowered))
            .then_some(lowered)
    }
}

fn string_field<'v>(record: &'v Value, field: &str) -> Option<&'v str> {
    record.get(field).and_then(Value::as_str)
}

impl Migrator {
    /// Creates a migrator between two initialized backends.
    #[must_use]
    pub fn new(source: Arc<dyn StorageBackend>, target: Arc<dyn StorageBackend>) -> Self {
        Self {
            source,
            target,
            page_size: DEFAULT_PAGE_SIZE,
            cipher: None,
            cleanup: Vec::new(),
        }
    }

    /// Sets the number of records fetched per page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Checks that copied subscription credentials decrypt with this cipher.
    #[must_use]
    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Registers a cleanup hook.
    pub fn register_cleanup(&mut self, name: impl Into<String>, hook: CleanupHook) {
        self.cleanup.push((name.into(), hook));
    }

    /// Opens source and target from configuration.
    ///
    /// A JSON source is copied to a temporary directory first and migrated
    /// from there, so the source directory is never modified; the copy is
    /// removed by a cleanup hook. When `wipe_target` is set, the target is
    /// wiped and re-initialized.
    ///
    /// # Errors
    ///
    /// Returns the first error opening either store.
    pub async fn from_config(config: &MigrationConfig) -> Result<Self> {
        Self::from_config_in(config, &std::env::temp_dir()).await
    }

    /// Like [`Migrator::from_config`], copying a JSON source under `scratch`.
    ///
    /// Cleanup hooks collected before a failure run before the error is
    /// returned.
    pub(crate) async fn from_config_in(config: &MigrationConfig, scratch: &Path) -> Result<Self> {
        let mut cleanup = Vec::new();
        match Self::open(config, scratch, &mut cleanup).await {
            Ok(mut migrator) => {
                migrator.cleanup = cleanup;
                Ok(migrator)
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to open migration stores");
                run_cleanup(cleanup).await;
                Err(e)
            },
        }
    }

    async fn open(
        config: &MigrationConfig,
        scratch: &Path,
        cleanup: &mut Vec<(String, CleanupHook)>,
    ) -> Result<Self> {
        let source: Arc<dyn StorageBackend> = match &config.source {
            BackendConfig::Json(json) => {
                let copy = scratch.join(format!("portal-migration-{}", new_id()));
                let removed = copy.clone();
                cleanup.push((
                    "remove source copy".to_string(),
                    Box::new(move || -> CleanupFuture {
                        Box::pin(async move {
                            match tokio::fs::remove_dir_all(&removed).await {
                                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                                    Err(Error::operation("remove_source_copy", e))
                                },
                                _ => Ok(()),
                            }
                        })
                    }),
                ));

                copy_dir(&json.path, &copy).await?;
                tracing::info!(
                    source = %json.path.display(),
                    copy = %copy.display(),
                    "Copied JSON source store"
                );
                Arc::new(JsonBackend::new(copy))
            },
            other => storage::open_backend(other).await?,
        };
        source.init().await?;

        let target = storage::open_backend(&config.target).await?;
        if config.wipe_target {
            tracing::warn!(backend = %target.backend_type(), "Wiping migration target");
            target.wipe().await?;
        }
        target.init().await?;

        let cipher = config
            .credential_key
            .as_ref()
            .map(CredentialCipher::from_secret)
            .transpose()?;

        let mut migrator = Self::new(source, target).with_page_size(config.page_size);
        migrator.cipher = cipher;
        Ok(migrator)
    }

    /// Runs the migration, then every cleanup hook exactly once.
    ///
    /// Cleanup failures are logged and never replace the migration result.
    ///
    /// # Errors
    ///
    /// Returns the first hard error; the target is left partially filled.
    pub async fn run(mut self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        tracing::info!(
            source = %self.source.backend_type(),
            target = %self.target.backend_type(),
            page_size = self.page_size,
            "Starting migration"
        );

        let result = self.copy_all(&mut report).await;

        run_cleanup(std::mem::take(&mut self.cleanup)).await;

        report.log_warnings();
        match result {
            Ok(()) => {
                tracing::info!(
                    records = report.counts.values().sum::<usize>(),
                    warnings = report.warnings.len(),
                    "Migration finished"
                );
                Ok(report)
            },
            Err(e) => {
                tracing::error!(error = %e, "Migration failed");
                Err(e)
            },
        }
    }

    async fn pager(&self, kind: EntityKind, query: Query) -> Result<Pager<'_>> {
        Pager::new(self.source.as_ref(), kind, query, self.page_size).await
    }

    async fn copy_all(&self, report: &mut MigrationReport) -> Result<()> {
        let apps = self.scan_applications(report).await?;
        self.copy_users(report).await?;
        let migrated = self.copy_applications(&apps, report).await?;
        self.copy_owners(&migrated, report).await?;
        let skipped = self.copy_subscriptions(&apps, report).await?;
        self.copy_approvals(&apps, &skipped, report).await?;
        self.copy_grants(&apps, report).await?;
        self.copy_plain(EntityKind::WebhookListeners, report).await
    }

    async fn scan_applications(&self, report: &mut MigrationReport) -> Result<ApplicationIds> {
        let mut ids = ApplicationIds::default();
        let mut pager = self.pager(EntityKind::Applications, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for record in &page {
                let id = record_id(record)?;
                let lowered = id.to_lowercase();
                match ids.canonical.get(&lowered) {
                    Some(original) if original != id => {
                        report.warn(
                            Severity::Severe,
                            EntityKind::Applications,
                            id,
                            format!(
                                "id differs only in case from '{original}'; neither is migrated"
                            ),
                        );
                        ids.duplicates.insert(lowered);
                    },
                    Some(_) => {},
                    None => {
                        ids.canonical.insert(lowered, id.to_string());
                    },
                }
            }
        }
        Ok(ids)
    }

    async fn copy_users(&self, report: &mut MigrationReport) -> Result<()> {
        let mut pager = self.pager(EntityKind::Users, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for user in page {
                let id = record_id(&user)?.to_string();
                self.target.upsert(EntityKind::Users, user).await?;
                report.record_copied(EntityKind::Users);

                let by_user = Query::new().filter_eq("userId", id.as_str());
                let mut registrations = self.pager(EntityKind::Registrations, by_user).await?;
                while let Some(page) = registrations.next_page().await? {
                    for registration in page {
                        self.target
                            .upsert(EntityKind::Registrations, registration)
                            .await?;
                        report.record_copied(EntityKind::Registrations);
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes bare applications under their folded ids. Returns the
    /// `(source id, target id)` pairs written.
    async fn copy_applications(
        &self,
        apps: &ApplicationIds,
        report: &mut MigrationReport,
    ) -> Result<Vec<(String, String)>> {
        let mut migrated = Vec::new();
        let mut pager = self.pager(EntityKind::Applications, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for mut app in page {
                let id = record_id(&app)?.to_string();
                let Some(target_id) = apps.resolve(&id) else {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Applications,
                        id,
                        "skipped: id collides with another application",
                    );
                    continue;
                };
                if let Some(map) = app.as_object_mut() {
                    map.remove("owners");
                    map.insert("id".to_string(), Value::String(target_id.clone()));
                }
                self.target.upsert(EntityKind::Applications, app).await?;
                report.record_copied(EntityKind::Applications);
                migrated.push((id, target_id));
            }
        }
        Ok(migrated)
    }

    async fn copy_owners(
        &self,
        migrated: &[(String, String)],
        report: &mut MigrationReport,
    ) -> Result<()> {
        for (source_id, target_id) in migrated {
            let by_app = Query::new().filter_eq("appId", source_id.as_str());
            let mut pager = self.pager(EntityKind::Owners, by_app).await?;
            while let Some(page) = pager.next_page().await? {
                for mut owner in page {
                    let Some(user_id) = string_field(&owner, "userId").map(str::to_string) else {
                        return Err(Error::Validation(format!(
                            "owner of application '{source_id}' has no userId"
                        )));
                    };
                    if !self.target.exists(EntityKind::Users, &user_id).await? {
                        report.warn(
                            Severity::Warning,
                            EntityKind::Owners,
                            record_id(&owner)?,
                            format!("skipped: user '{user_id}' does not exist"),
                        );
                        continue;
                    }
                    owner["appId"] = Value::String(target_id.clone());
                    owner["id"] = Value::String(Owner::id_for(target_id, &user_id));
                    self.target.upsert(EntityKind::Owners, owner).await?;
                    report.record_copied(EntityKind::Owners);
                }
            }
        }
        Ok(())
    }

    /// Copies subscriptions of migrated applications. Returns the ids skipped.
    async fn copy_subscriptions(
        &self,
        apps: &ApplicationIds,
        report: &mut MigrationReport,
    ) -> Result<HashSet<String>> {
        let mut skipped = HashSet::new();
        let mut pager = self.pager(EntityKind::Subscriptions, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for mut subscription in page {
                let id = record_id(&subscription)?.to_string();
                let app_id = string_field(&subscription, "application").unwrap_or_default();
                let Some(target_app) = apps.resolve(app_id) else {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Subscriptions,
                        &id,
                        format!("skipped: application '{app_id}' is not migrated"),
                    );
                    skipped.insert(id);
                    continue;
                };
                self.check_credentials(&id, &subscription, report);
                subscription["application"] = Value::String(target_app);
                self.target
                    .upsert(EntityKind::Subscriptions, subscription)
                    .await?;
                report.record_copied(EntityKind::Subscriptions);
            }
        }
        Ok(skipped)
    }

    fn check_credentials(&self, id: &str, subscription: &Value, report: &mut MigrationReport) {
        let Some(cipher) = &self.cipher else {
            return;
        };
        for field in ["apikey", "clientId", "clientSecret"] {
            if let Some(stored) = string_field(subscription, field) {
                if let Err(e) = cipher.decrypt(stored) {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Subscriptions,
                        id,
                        format!("{field} cannot be decrypted with the configured key: {e}"),
                    );
                }
            }
        }
    }

    async fn copy_approvals(
        &self,
        apps: &ApplicationIds,
        skipped: &HashSet<String>,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let mut pager = self.pager(EntityKind::Approvals, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for mut approval in page {
                let id = record_id(&approval)?.to_string();
                let subscription = string_field(&approval, "subscriptionId").unwrap_or_default();
                if skipped.contains(subscription) {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Approvals,
                        id,
                        format!("skipped: subscription '{subscription}' was skipped"),
                    );
                    continue;
                }
                let app_id = string_field(&approval, "application").unwrap_or_default();
                let Some(target_app) = apps.resolve(app_id) else {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Approvals,
                        id,
                        format!("skipped: application '{app_id}' is not migrated"),
                    );
                    continue;
                };
                approval["application"] = Value::String(target_app);
                self.target.upsert(EntityKind::Approvals, approval).await?;
                report.record_copied(EntityKind::Approvals);
            }
        }
        Ok(())
    }

    async fn copy_grants(&self, apps: &ApplicationIds, report: &mut MigrationReport) -> Result<()> {
        let mut pager = self.pager(EntityKind::Grants, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for mut grant in page {
                let id = record_id(&grant)?.to_string();
                let app_id = string_field(&grant, "applicationId").unwrap_or_default();
                let Some(target_app) = apps.resolve(app_id) else {
                    report.warn(
                        Severity::Warning,
                        EntityKind::Grants,
                        id,
                        format!("skipped: application '{app_id}' is not migrated"),
                    );
                    continue;
                };
                grant["applicationId"] = Value::String(target_app);
                self.target.upsert(EntityKind::Grants, grant).await?;
                report.record_copied(EntityKind::Grants);
            }
        }
        Ok(())
    }

    async fn copy_plain(&self, kind: EntityKind, report: &mut MigrationReport) -> Result<()> {
        let mut pager = self.pager(kind, Query::new()).await?;
        while let Some(page) = pager.next_page().await? {
            for record in page {
                self.target.upsert(kind, record).await?;
                report.record_copied(kind);
            }
        }
        Ok(())
    }
}

/// Runs each hook once; failures are only logged.
async fn run_cleanup(hooks: Vec<(String, CleanupHook)>) {
    for (name, hook) in hooks {
        if let Err(e) = hook().await {
            tracing::warn!(hook = %name, error = %e, "Cleanup hook failed");
        }
    }
}

/// Recursively copies a directory, skipping lock sentinels.
async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let io = |e: std::io::Error| Error::operation("copy_source_store", e);
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await.map_err(io)?;
        let mut entries = tokio::fs::read_dir(&src).await.map_err(|e| {
            Error::NotFound(format!("source store {}: {e}", src.display()))
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            let path = entry.path();
            let target = dst.join(entry.file_name());
            if entry.file_type().await.map_err(io)?.is_dir() {
                pending.push((path, target));
            } else if path.extension().is_none_or(|ext| ext != "lock") {
                tokio::fs::copy(&path, &target).await.map_err(io)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonConfig;
    use tempfile::TempDir;

    #[test]
    fn test_application_ids_resolve() {
        let mut ids = ApplicationIds::default();
        ids.canonical.insert("billing".into(), "Billing".into());
        ids.canonical.insert("appone".into(), "AppOne".into());
        ids.duplicates.insert("appone".into());

        assert_eq!(ids.resolve("Billing"), Some("billing".to_string()));
        assert_eq!(ids.resolve("BILLING"), Some("billing".to_string()));
        assert_eq!(ids.resolve("appone"), None);
        assert_eq!(ids.resolve("unknown"), None);
    }

    #[tokio::test]
    async fn test_copy_dir_skips_locks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let nested = src.path().join("users");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("u1.json"), b"{}").await.unwrap();
        tokio::fs::write(nested.join("u1.lock"), b"{}").await.unwrap();

        let to = dst.path().join("copy");
        copy_dir(src.path(), &to).await.unwrap();
        assert!(to.join("users/u1.json").exists());
        assert!(!to.join("users/u1.lock").exists());
    }

    async fn scratch_entries(scratch: &Path) -> usize {
        let mut entries = tokio::fs::read_dir(scratch).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_from_config_removes_copy_when_target_fails() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        JsonBackend::new(dir.path().join("source")).init().await.unwrap();
        // A regular file where the target directory should be created.
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"").await.unwrap();

        let config = MigrationConfig::new(
            BackendConfig::Json(JsonConfig::new(dir.path().join("source"))),
            BackendConfig::Json(JsonConfig::new(blocker.join("target"))),
        );
        assert!(Migrator::from_config_in(&config, scratch.path()).await.is_err());
        assert_eq!(scratch_entries(scratch.path()).await, 0);
    }

    #[tokio::test]
    async fn test_from_config_removes_partial_copy_of_missing_source() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let config = MigrationConfig::new(
            BackendConfig::Json(JsonConfig::new(dir.path().join("missing"))),
            BackendConfig::Json(JsonConfig::new(dir.path().join("target"))),
        );

        let result = Migrator::from_config_in(&config, scratch.path()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(scratch_entries(scratch.path()).await, 0);
    }

    #[tokio::test]
    async fn test_from_config_keeps_copy_until_run() {
        let dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        JsonBackend::new(dir.path().join("source")).init().await.unwrap();
        let config = MigrationConfig::new(
            BackendConfig::Json(JsonConfig::new(dir.path().join("source"))),
            BackendConfig::Json(JsonConfig::new(dir.path().join("target"))),
        );

        let migrator = Migrator::from_config_in(&config, scratch.path()).await.unwrap();
        assert_eq!(scratch_entries(scratch.path()).await, 1);
        migrator.run().await.unwrap();
        assert_eq!(scratch_entries(scratch.path()).await, 0);
    }

    #[tokio::test]
    async fn test_copy_dir_missing_source() {
        let dst = TempDir::new().unwrap();
        let result = copy_dir(Path::new("/nonexistent/portal-store"), &dst.path().join("x")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
