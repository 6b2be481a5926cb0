//! Cross-backend migration tests (JSON to JSON).
//!
//! The source store is seeded through the raw backend so that it can hold
//! data the DAO would reject, such as application ids differing only in case.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use portal_dao::config::BackendType;
use portal_dao::migrate::{CleanupFuture, CleanupHook, Severity};
use portal_dao::models::{Metadata, Page};
use portal_dao::storage::NotificationCallback;
use portal_dao::{
    BackendConfig, EntityKind, Error, JsonBackend, JsonConfig, MigrationConfig, Migrator, Owner,
    Query, Result, StorageBackend,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

async fn json_store(dir: &TempDir, name: &str) -> Arc<JsonBackend> {
    let backend = Arc::new(JsonBackend::new(dir.path().join(name)));
    backend.init().await.expect("init");
    backend
}

async fn seed(source: &JsonBackend) {
    let records = [
        (EntityKind::Users, json!({"id": "u1", "email": "a@example.com"})),
        (EntityKind::Users, json!({"id": "u2", "email": "b@example.com"})),
        (
            EntityKind::Registrations,
            json!({"id": "r1", "poolId": "wicked", "userId": "u1", "name": "A"}),
        ),
        (EntityKind::Applications, json!({"id": "Billing", "name": "Billing"})),
        (EntityKind::Applications, json!({"id": "AppOne", "name": "First"})),
        (EntityKind::Applications, json!({"id": "appone", "name": "Second"})),
        (
            EntityKind::Owners,
            json!({"id": "o1", "appId": "Billing", "userId": "u1", "role": "owner"}),
        ),
        (
            EntityKind::Owners,
            json!({"id": "o2", "appId": "Billing", "userId": "ghost", "role": "reader"}),
        ),
        (
            EntityKind::Subscriptions,
            json!({"id": "s1", "application": "Billing", "api": "petstore", "plan": "basic"}),
        ),
        (
            EntityKind::Subscriptions,
            json!({"id": "s2", "application": "AppOne", "api": "petstore", "plan": "basic"}),
        ),
        (
            EntityKind::Approvals,
            json!({"id": "a1", "subscriptionId": "s1", "application": "Billing", "api": "petstore"}),
        ),
        (
            EntityKind::Approvals,
            json!({"id": "a2", "subscriptionId": "s2", "application": "AppOne", "api": "petstore"}),
        ),
        (
            EntityKind::Grants,
            json!({"id": "g1", "userId": "u1", "apiId": "petstore", "applicationId": "Billing"}),
        ),
        (
            EntityKind::Verifications,
            json!({"id": "v1", "userId": "u1", "email": "a@example.com", "expires": 1}),
        ),
        (EntityKind::WebhookListeners, json!({"id": "l1", "url": "http://hook"})),
        (
            EntityKind::WebhookEvents,
            json!({"id": "e1", "listenerId": "l1", "action": "add", "entity": "user", "created": 1}),
        ),
    ];
    for (kind, record) in records {
        source.upsert(kind, record).await.expect("seed");
    }
}

async fn ids(backend: &dyn StorageBackend, kind: EntityKind) -> Vec<String> {
    backend
        .index(kind, &Query::new())
        .await
        .unwrap()
        .items
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_migration_folds_application_ids() {
    let dir = TempDir::new().unwrap();
    let source = json_store(&dir, "source").await;
    let target = json_store(&dir, "target").await;
    seed(&source).await;

    let report = Migrator::new(source, target.clone())
        .with_page_size(2)
        .run()
        .await
        .unwrap();

    assert_eq!(ids(target.as_ref(), EntityKind::Users).await, ["u1", "u2"]);
    assert_eq!(ids(target.as_ref(), EntityKind::Registrations).await, ["r1"]);
    assert_eq!(ids(target.as_ref(), EntityKind::Applications).await, ["billing"]);
    assert_eq!(ids(target.as_ref(), EntityKind::Subscriptions).await, ["s1"]);
    assert_eq!(ids(target.as_ref(), EntityKind::Approvals).await, ["a1"]);
    assert_eq!(ids(target.as_ref(), EntityKind::Grants).await, ["g1"]);
    assert_eq!(ids(target.as_ref(), EntityKind::WebhookListeners).await, ["l1"]);
    assert!(ids(target.as_ref(), EntityKind::Verifications).await.is_empty());
    assert!(ids(target.as_ref(), EntityKind::WebhookEvents).await.is_empty());

    let owners = ids(target.as_ref(), EntityKind::Owners).await;
    assert_eq!(owners, [Owner::id_for("billing", "u1")]);

    let subscription = target
        .get(EntityKind::Subscriptions, "s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription["application"], "billing");
    let grant = target.get(EntityKind::Grants, "g1").await.unwrap().unwrap();
    assert_eq!(grant["applicationId"], "billing");

    let severe: Vec<_> = report.warnings_at_least(Severity::Severe).collect();
    assert_eq!(severe.len(), 1);
    assert_eq!(severe[0].kind, EntityKind::Applications);
    assert_eq!(report.count(EntityKind::Applications), 1);
    assert_eq!(report.count(EntityKind::Users), 2);
    // Both case variants, s2, a2 and the dangling owner are reported.
    assert!(report.warnings.len() >= 5);
}

#[tokio::test]
async fn test_migration_of_empty_store() {
    let dir = TempDir::new().unwrap();
    let source = json_store(&dir, "source").await;
    let target = json_store(&dir, "target").await;

    let report = Migrator::new(source, target).run().await.unwrap();
    assert!(report.counts.is_empty());
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_from_config_copies_json_source() {
    let dir = TempDir::new().unwrap();
    let source = json_store(&dir, "source").await;
    seed(&source).await;

    let mut config = MigrationConfig::new(
        BackendConfig::Json(JsonConfig::new(dir.path().join("source"))),
        BackendConfig::Json(JsonConfig::new(dir.path().join("target"))),
    );
    config.wipe_target = true;

    let report = Migrator::from_config(&config).await.unwrap().run().await.unwrap();
    assert_eq!(report.count(EntityKind::Users), 2);

    // The source directory is left as it was.
    assert_eq!(ids(source.as_ref(), EntityKind::Applications).await.len(), 3);
    let target = JsonBackend::new(dir.path().join("target"));
    assert_eq!(ids(&target, EntityKind::Applications).await, ["billing"]);
}

/// Delegates to a JSON store, failing the n-th application write.
struct FailingBackend {
    inner: JsonBackend,
    fail_on: usize,
    application_writes: AtomicUsize,
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        self.inner.get(kind, id).await
    }

    async fn upsert(&self, kind: EntityKind, record: Value) -> Result<()> {
        if kind == EntityKind::Applications
            && self.application_writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on
        {
            return Err(Error::OperationFailed {
                operation: "upsert".to_string(),
                cause: "disk full".to_string(),
            });
        }
        self.inner.upsert(kind, record).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        self.inner.delete(kind, id).await
    }

    async fn delete_where(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        self.inner.delete_where(kind, query).await
    }

    async fn index(&self, kind: EntityKind, query: &Query) -> Result<Page<Value>> {
        self.inner.index(kind, query).await
    }

    async fn count(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        self.inner.count(kind, query).await
    }

    async fn metadata(&self) -> Result<Metadata> {
        self.inner.metadata().await
    }

    async fn wipe(&self) -> Result<()> {
        self.inner.wipe().await
    }

    async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        self.inner.notify(channel, payload).await
    }

    async fn subscribe(&self, channel: &str, callback: NotificationCallback) -> Result<()> {
        self.inner.subscribe(channel, callback).await
    }
}

#[tokio::test]
async fn test_failure_runs_cleanup_once_and_keeps_error() {
    let dir = TempDir::new().unwrap();
    let source = json_store(&dir, "source").await;
    for id in ["a1", "a2", "a3", "a4"] {
        source
            .upsert(EntityKind::Applications, json!({"id": id, "name": id}))
            .await
            .unwrap();
    }
    let target = Arc::new(FailingBackend {
        inner: JsonBackend::new(dir.path().join("target")),
        fail_on: 3,
        application_writes: AtomicUsize::new(0),
    });
    target.init().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let hook: CleanupHook = Box::new(move || -> CleanupFuture {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::OperationFailed {
                operation: "cleanup".to_string(),
                cause: "ignored".to_string(),
            })
        })
    });

    let mut migrator = Migrator::new(source, target.clone());
    migrator.register_cleanup("count", hook);
    let err = migrator.run().await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match err {
        Error::OperationFailed { cause, .. } => assert_eq!(cause, "disk full"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ids(&target.inner, EntityKind::Applications).await, ["a1", "a2"]);
}
