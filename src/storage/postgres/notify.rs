//! LISTEN/NOTIFY plumbing.
//!
//! Pooled connections cannot receive notifications, so listening uses one
//! dedicated connection whose message stream is driven by a background task.

use super::query::quote_ident;
use crate::storage::schema::is_identifier;
use crate::storage::traits::NotificationCallback;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

type Listeners = Arc<Mutex<HashMap<String, Vec<NotificationCallback>>>>;

/// A dedicated connection listening on notification channels.
pub struct PgNotifier {
    client: Client,
    listeners: Listeners,
    task: JoinHandle<()>,
}

/// Rejects channel names that are not plain identifiers.
///
/// # Errors
///
/// Returns `Error::Validation` for anything but `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_channel(channel: &str) -> Result<()> {
    if is_identifier(channel) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid notification channel '{channel}'"
        )))
    }
}

/// Decodes a notification payload: JSON if it parses, a plain string otherwise.
#[must_use]
pub fn decode_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

fn dispatch(listeners: &Listeners, channel: &str, payload: &str) {
    let callbacks = listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(channel)
        .cloned()
        .unwrap_or_default();
    if callbacks.is_empty() {
        return;
    }
    let value = decode_payload(payload);
    for callback in callbacks {
        callback(value.clone());
    }
}

impl PgNotifier {
    /// Opens the listening connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connectivity` if the connection cannot be opened.
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self> {
        let (client, mut connection) =
            config
                .connect(NoTls)
                .await
                .map_err(|e| Error::Connectivity {
                    target: "postgres listener".to_string(),
                    cause: e.to_string(),
                })?;

        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let task_listeners = Arc::clone(&listeners);
        let task = tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        tracing::trace!(channel = n.channel(), "Received notification");
                        dispatch(&task_listeners, n.channel(), n.payload());
                    },
                    Some(Ok(AsyncMessage::Notice(notice))) => {
                        tracing::debug!(message = notice.message(), "Listener notice");
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Listener connection failed");
                        break;
                    },
                    None => break,
                }
            }
        });

        Ok(Self {
            client,
            listeners,
            task,
        })
    }

    /// Registers a callback and issues `LISTEN` the first time a channel is used.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an invalid channel name, or
    /// `Error::OperationFailed` if `LISTEN` fails.
    pub async fn listen(&self, channel: &str, callback: NotificationCallback) -> Result<()> {
        validate_channel(channel)?;
        let first = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = listeners.entry(channel.to_string()).or_default();
            entry.push(callback);
            entry.len() == 1
        };
        if first {
            self.client
                .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
                .await
                .map_err(|e| Error::operation("postgres_listen", e))?;
            tracing::debug!(channel, "Listening");
        }
        Ok(())
    }
}

impl Drop for PgNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(r#"{"id":"u1"}"#), json!({"id": "u1"}));
        assert_eq!(decode_payload("plain text"), json!("plain text"));
    }

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel("portal_changes").is_ok());
        assert!(validate_channel("x; DROP TABLE users").is_err());
    }

    #[test]
    fn test_dispatch_only_to_matching_channel() {
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: NotificationCallback = Arc::new(move |value| {
            assert_eq!(value, json!({"n": 1}));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        listeners
            .lock()
            .unwrap()
            .insert("a".to_string(), vec![callback]);

        dispatch(&listeners, "a", r#"{"n":1}"#);
        dispatch(&listeners, "b", r#"{"n":1}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
