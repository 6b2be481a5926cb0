//! DAO integration tests over the JSON backend.
//!
//! Exercises every accessor through the public API, including the
//! cascading deletes of users and applications.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use portal_dao::models::VerificationType;
use portal_dao::security::CredentialCipher;
use portal_dao::{
    Application, Approval, Dao, Error, Grant, JsonBackend, OwnerRole, Registration,
    StorageBackend, Subscription, User, Verification, WebhookListener,
};
use serde_json::{Map, json};
use std::sync::Arc;
use tempfile::TempDir;

async fn dao() -> (TempDir, Dao) {
    let dir = TempDir::new().expect("temp dir");
    let backend = Arc::new(JsonBackend::new(dir.path().join("store")));
    backend.init().await.expect("init");
    let dao = Dao::with_backend(backend, CredentialCipher::new([9u8; 32]));
    (dir, dao)
}

fn registration(pool: &str, user: &str) -> Registration {
    Registration {
        id: format!("{pool}-{user}"),
        pool_id: pool.to_string(),
        user_id: user.to_string(),
        namespace: None,
        name: Some(format!("Member {user}")),
        data: Map::new(),
    }
}

fn grant(user: &str, app: &str, api: &str) -> Grant {
    Grant {
        id: format!("{user}-{app}-{api}"),
        user_id: user.to_string(),
        api_id: api.to_string(),
        application_id: app.to_string(),
        grants: Vec::new(),
    }
}

#[tokio::test]
async fn test_user_lifecycle() {
    let (_dir, dao) = dao().await;
    let users = dao.users();

    let created = users
        .create(User::new("u1", "Jane@Example.com").with_custom_id("ext-1"))
        .await
        .unwrap();
    assert_eq!(created.email, "jane@example.com");

    assert_eq!(
        users.get_by_email("  JANE@example.com ").await.unwrap().unwrap().id,
        "u1"
    );
    assert_eq!(users.get_by_custom_id("ext-1").await.unwrap().unwrap().id, "u1");

    let duplicate = users.create(User::new("u2", "jane@example.com")).await;
    assert!(matches!(duplicate, Err(Error::Validation(_))));

    users.create(User::new("u2", "bob@example.com")).await.unwrap();
    assert_eq!(users.get_count().await.unwrap(), 2);

    let page = users.get_index(1, 1).await.unwrap();
    assert_eq!(page.count, 2);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "u2");
}

#[tokio::test]
async fn test_user_delete_cascades() {
    let (_dir, dao) = dao().await;
    dao.users().create(User::new("u1", "a@example.com")).await.unwrap();
    dao.users().create(User::new("u2", "b@example.com")).await.unwrap();
    dao.applications()
        .create(Application::new("app1", "App One"))
        .await
        .unwrap();
    dao.applications()
        .add_owner("app1", "u1", OwnerRole::Owner)
        .await
        .unwrap();
    dao.registrations().upsert(registration("pool", "u1")).await.unwrap();
    dao.registrations().upsert(registration("pool", "u2")).await.unwrap();
    dao.grants().upsert(grant("u1", "app1", "petstore")).await.unwrap();
    dao.verifications()
        .create(Verification {
            id: "token1".into(),
            user_id: "u1".into(),
            email: "a@example.com".into(),
            verification_type: VerificationType::Email,
            expires: i64::MAX,
            link: None,
        })
        .await
        .unwrap();

    assert!(dao.users().delete("u1").await.unwrap());

    assert!(dao.users().get_by_id("u1").await.unwrap().is_none());
    assert!(dao.registrations().get_by_user("u1").await.unwrap().is_empty());
    assert!(dao.grants().get_by_user("u1").await.unwrap().is_empty());
    assert!(dao.verifications().get_by_id("token1").await.unwrap().is_none());
    assert!(dao.applications().get_owners("app1").await.unwrap().is_empty());

    // Unrelated records survive.
    assert_eq!(dao.registrations().get_by_user("u2").await.unwrap().len(), 1);
    assert!(dao.applications().get_by_id("app1").await.unwrap().is_some());

    assert!(!dao.users().delete("u1").await.unwrap());
}

#[tokio::test]
async fn test_application_owners() {
    let (_dir, dao) = dao().await;
    dao.users().create(User::new("u1", "a@example.com")).await.unwrap();
    dao.users().create(User::new("u2", "b@example.com")).await.unwrap();

    let mut app = Application::new("billing", "Billing");
    app.owners.push(portal_dao::Owner::new("billing", "u1", OwnerRole::Owner));
    let created = dao.applications().create(app).await.unwrap();
    assert_eq!(created.owners.len(), 1);
    assert_eq!(created.owners[0].email.as_deref(), Some("a@example.com"));

    dao.applications()
        .add_owner("billing", "u2", OwnerRole::Collaborator)
        .await
        .unwrap();
    let loaded = dao.applications().get_by_id("billing").await.unwrap().unwrap();
    assert_eq!(loaded.owners.len(), 2);

    let owned = dao.applications().get_by_owner("u2").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, "billing");

    let missing_user = dao
        .applications()
        .add_owner("billing", "ghost", OwnerRole::Reader)
        .await;
    assert!(matches!(missing_user, Err(Error::NotFound(_))));

    assert!(dao.applications().delete_owner("billing", "u2").await.unwrap());
    assert_eq!(dao.applications().get_owners("billing").await.unwrap().len(), 1);

    let clash = dao
        .applications()
        .create(Application::new("BILLING", "Billing again"))
        .await;
    assert!(matches!(clash, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_application_ids_unique_ignoring_case() {
    let (_dir, dao) = dao().await;
    dao.applications()
        .create(Application::new("AppOne", "First"))
        .await
        .unwrap();

    for id in ["APPONE", "appOne", "AppOne"] {
        let clash = dao.applications().create(Application::new(id, "Again")).await;
        assert!(matches!(clash, Err(Error::Validation(_))), "{id} was accepted");
    }
    // A longer id containing the first one is still free.
    dao.applications()
        .create(Application::new("AppOne2", "Second"))
        .await
        .unwrap();
    assert_eq!(dao.applications().get_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_application_delete_cascades() {
    let (_dir, dao) = dao().await;
    dao.users().create(User::new("u1", "a@example.com")).await.unwrap();
    dao.applications()
        .create(Application::new("app1", "App One"))
        .await
        .unwrap();
    dao.applications()
        .add_owner("app1", "u1", OwnerRole::Owner)
        .await
        .unwrap();
    let subscription = dao
        .subscriptions()
        .create(Subscription::new("s1", "app1", "petstore", "basic"))
        .await
        .unwrap();
    dao.approvals()
        .create(Approval::for_subscription("a1", &subscription))
        .await
        .unwrap();
    dao.grants().upsert(grant("u1", "app1", "petstore")).await.unwrap();

    assert!(dao.applications().delete("app1").await.unwrap());

    assert!(dao.subscriptions().get_by_id("s1").await.unwrap().is_none());
    assert!(dao.approvals().get_all().await.unwrap().is_empty());
    assert!(dao.grants().get_by_user("u1").await.unwrap().is_empty());
    assert!(dao.applications().get_owners("app1").await.unwrap().is_empty());
    assert!(dao.users().get_by_id("u1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_subscription_credentials_encrypted_at_rest() {
    let (_dir, dao) = dao().await;
    dao.applications()
        .create(Application::new("app1", "App One"))
        .await
        .unwrap();

    let mut subscription = Subscription::new("s1", "app1", "petstore", "basic");
    subscription.client_id = Some("client-123".into());
    subscription.client_secret = Some("very-secret".into());
    dao.subscriptions().create(subscription).await.unwrap();

    let raw = dao
        .backend()
        .get(portal_dao::EntityKind::Subscriptions, "s1")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw["clientId"], "client-123");
    assert_ne!(raw["clientSecret"], "very-secret");

    let found = dao
        .subscriptions()
        .get_by_client_id("client-123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "s1");
    assert_eq!(found.client_secret.as_deref(), Some("very-secret"));

    let patched = dao
        .subscriptions()
        .patch("s1", &json!({"approved": true, "id": "ignored"}))
        .await
        .unwrap();
    assert!(patched.approved);
    assert_eq!(patched.id, "s1");
    assert_eq!(patched.client_id.as_deref(), Some("client-123"));

    let missing = dao.subscriptions().patch("nope", &json!({"approved": true})).await;
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_subscription_queries() {
    let (_dir, dao) = dao().await;
    dao.applications()
        .create(Application::new("app1", "Alpha"))
        .await
        .unwrap();
    dao.applications()
        .create(Application::new("app2", "Beta"))
        .await
        .unwrap();
    for (id, app, api) in [("s1", "app1", "petstore"), ("s2", "app2", "petstore"), ("s3", "app1", "orders")] {
        dao.subscriptions()
            .create(Subscription::new(id, app, api, "basic"))
            .await
            .unwrap();
    }

    assert_eq!(dao.subscriptions().get_by_app_id("app1").await.unwrap().len(), 2);
    assert_eq!(
        dao.subscriptions()
            .get_by_app_and_api("app2", "petstore")
            .await
            .unwrap()
            .unwrap()
            .id,
        "s2"
    );
    let by_api = dao.subscriptions().get_by_api("petstore", 0, 1).await.unwrap();
    assert_eq!(by_api.count, 2);
    assert_eq!(by_api.items.len(), 1);

    let duplicate = dao
        .subscriptions()
        .create(Subscription::new("s4", "app1", "petstore", "gold"))
        .await;
    assert!(matches!(duplicate, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_approvals() {
    let (_dir, dao) = dao().await;
    let s1 = Subscription::new("s1", "app1", "petstore", "basic");
    let s2 = Subscription::new("s2", "app1", "orders", "basic");
    dao.approvals()
        .create(Approval::for_subscription("a1", &s1))
        .await
        .unwrap();
    dao.approvals()
        .create(Approval::for_subscription("a2", &s2))
        .await
        .unwrap();

    assert_eq!(dao.approvals().get_all().await.unwrap().len(), 2);
    assert_eq!(
        dao.approvals().delete_by_app_and_api("app1", "petstore").await.unwrap(),
        1
    );
    assert_eq!(dao.approvals().delete_by_subscription("s2").await.unwrap(), 1);
    assert!(dao.approvals().get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registrations_and_grants_keep_ids() {
    let (_dir, dao) = dao().await;
    let first = dao.registrations().upsert(registration("pool", "u1")).await.unwrap();

    let mut again = registration("pool", "u1");
    again.id = "other-id".into();
    again.name = Some("Renamed".into());
    let updated = dao.registrations().upsert(again).await.unwrap();
    assert_eq!(updated.id, first.id);
    assert_eq!(
        dao.registrations()
            .get_by_pool_and_user("pool", "u1")
            .await
            .unwrap()
            .unwrap()
            .name
            .as_deref(),
        Some("Renamed")
    );

    let mut namespaced = registration("pool", "u2");
    namespaced.namespace = Some("tenant-a".into());
    dao.registrations().upsert(namespaced).await.unwrap();
    assert_eq!(
        dao.registrations()
            .get_by_pool("pool", Some("tenant-a"), 0, 10)
            .await
            .unwrap()
            .count,
        1
    );
    assert_eq!(
        dao.registrations().get_by_pool("pool", None, 0, 10).await.unwrap().count,
        2
    );
    assert!(dao.registrations().delete("pool", "u1").await.unwrap());

    let g = dao.grants().upsert(grant("u1", "app1", "petstore")).await.unwrap();
    let mut replacement = grant("u1", "app1", "petstore");
    replacement.id = "fresh".into();
    assert_eq!(dao.grants().upsert(replacement).await.unwrap().id, g.id);
    assert!(dao.grants().delete("u1", "app1", "petstore").await.unwrap());
    assert!(
        dao.grants()
            .get_by_user_app_and_api("u1", "app1", "petstore")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_verification_reconcile() {
    let (_dir, dao) = dao().await;
    for (id, expires) in [("old", 1_000), ("fresh", 5_000)] {
        dao.verifications()
            .create(Verification {
                id: id.into(),
                user_id: "u1".into(),
                email: "a@example.com".into(),
                verification_type: VerificationType::Email,
                expires,
                link: None,
            })
            .await
            .unwrap();
    }

    assert_eq!(dao.verifications().reconcile(2_000).await.unwrap(), 1);
    let remaining = dao.verifications().get_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "fresh");
}

#[tokio::test]
async fn test_webhook_events() {
    let (_dir, dao) = dao().await;
    let webhooks = dao.webhooks();
    for id in ["l1", "l2"] {
        webhooks
            .listeners()
            .upsert(WebhookListener {
                id: id.into(),
                url: format!("http://localhost/{id}"),
            })
            .await
            .unwrap();
    }

    let queued = webhooks
        .events()
        .create_for_all("add", "user", Some(json!({"userId": "u1"})))
        .await
        .unwrap();
    assert_eq!(queued, 2);
    webhooks
        .events()
        .create_for_all("delete", "user", None)
        .await
        .unwrap();

    let events = webhooks.events().get_by_listener("l1").await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].created <= events[1].created);

    assert!(webhooks.events().delete("l1", &events[0].id).await.unwrap());
    assert!(!webhooks.events().delete("l2", &events[1].id).await.unwrap());
    assert_eq!(webhooks.events().get_by_listener("l1").await.unwrap().len(), 1);

    assert!(webhooks.listeners().delete("l2").await.unwrap());
    assert!(webhooks.events().get_by_listener("l2").await.unwrap().is_empty());
    assert_eq!(webhooks.listeners().get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_metadata_and_wipe() {
    let (dir, dao) = dao().await;
    let metadata = dao.meta().get_metadata().await.unwrap();
    assert!(metadata.version >= 1);

    dao.meta().wipe().await.unwrap();
    assert!(!dir.path().join("store").exists());
    assert!(matches!(
        dao.meta().get_metadata().await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_notifications_reach_subscribers() {
    let (_dir, dao) = dao().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    dao.subscribe(
        "portal_change",
        Arc::new(move |payload| {
            let _ = tx.send(payload);
        }),
    )
    .await
    .unwrap();

    dao.notify("portal_change", &json!({"entity": "user"}))
        .await
        .unwrap();
    let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("notification within timeout")
        .unwrap();
    assert_eq!(received["entity"], "user");
}
