//! Webhook listener and event accessors.

use super::Dao;
use crate::models::{WebhookEvent, WebhookListener, new_id};
use crate::storage::{EntityKind, Query};
use crate::{Result, current_timestamp};
use serde_json::Value;

/// Webhook accessor, obtained from [`Dao::webhooks`].
#[derive(Debug, Clone, Copy)]
pub struct Webhooks<'a> {
    dao: &'a Dao,
}

impl<'a> Webhooks<'a> {
    pub(super) const fn new(dao: &'a Dao) -> Self {
        Self { dao }
    }

    /// Listener operations.
    #[must_use]
    pub const fn listeners(&self) -> WebhookListeners<'a> {
        WebhookListeners { dao: self.dao }
    }

    /// Event queue operations.
    #[must_use]
    pub const fn events(&self) -> WebhookEvents<'a> {
        WebhookEvents { dao: self.dao }
    }
}

/// Webhook listener operations.
#[derive(Debug, Clone, Copy)]
pub struct WebhookListeners<'a> {
    dao: &'a Dao,
}

impl WebhookListeners<'_> {
    /// Every registered listener.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_all(&self) -> Result<Vec<WebhookListener>> {
        self.dao.all(EntityKind::WebhookListeners, &Query::new()).await
    }

    /// Looks up a listener by id.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<WebhookListener>> {
        self.dao.fetch(EntityKind::WebhookListeners, id).await
    }

    /// Creates or replaces a listener.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn upsert(&self, listener: WebhookListener) -> Result<WebhookListener> {
        self.dao
            .store(EntityKind::WebhookListeners, &listener)
            .await?;
        Ok(listener)
    }

    /// Deletes a listener and flushes its queued events. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the first failing delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        WebhookEvents { dao: self.dao }.flush(id).await?;
        self.dao
            .backend()
            .delete(EntityKind::WebhookListeners, id)
            .await
    }
}

/// Webhook event queue operations.
#[derive(Debug, Clone, Copy)]
pub struct WebhookEvents<'a> {
    dao: &'a Dao,
}

impl WebhookEvents<'_> {
    /// Events queued for a listener, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn get_by_listener(&self, listener_id: &str) -> Result<Vec<WebhookEvent>> {
        let mut events: Vec<WebhookEvent> = self
            .dao
            .all(
                EntityKind::WebhookEvents,
                &Query::new().filter_eq("listenerId", listener_id),
            )
            .await?;
        events.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Queues an event.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn create(&self, mut event: WebhookEvent) -> Result<WebhookEvent> {
        if event.created == 0 {
            event.created = current_timestamp();
        }
        self.dao.store(EntityKind::WebhookEvents, &event).await?;
        Ok(event)
    }

    /// Queues one copy of an event for every listener. Returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns the first failing write.
    pub async fn create_for_all(
        &self,
        action: &str,
        entity: &str,
        data: Option<Value>,
    ) -> Result<usize> {
        let listeners = WebhookListeners { dao: self.dao }.get_all().await?;
        let created = current_timestamp();
        for listener in &listeners {
            self.create(WebhookEvent {
                id: new_id(),
                listener_id: listener.id.clone(),
                action: action.to_string(),
                entity: entity.to_string(),
                data: data.clone(),
                created,
            })
            .await?;
        }
        tracing::debug!(action, entity, listeners = listeners.len(), "Queued webhook events");
        Ok(listeners.len())
    }

    /// Removes one event of a listener. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn delete(&self, listener_id: &str, event_id: &str) -> Result<bool> {
        let query = Query::new()
            .filter_eq("listenerId", listener_id)
            .filter_eq("id", event_id);
        Ok(self
            .dao
            .backend()
            .delete_where(EntityKind::WebhookEvents, &query)
            .await?
            > 0)
    }

    /// Removes every event of a listener. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn flush(&self, listener_id: &str) -> Result<usize> {
        self.dao
            .backend()
            .delete_where(
                EntityKind::WebhookEvents,
                &Query::new().filter_eq("listenerId", listener_id),
            )
            .await
    }
}
