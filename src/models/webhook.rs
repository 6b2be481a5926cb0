//! Webhook listeners and queued events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookListener {
    /// Unique identifier.
    pub id: String,
    /// Target URL.
    pub url: String,
}

/// Notification queued for one listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Unique identifier.
    pub id: String,
    /// The listener the event is addressed to.
    pub listener_id: String,
    /// What happened (`add`, `update`, `delete`, ...).
    pub action: String,
    /// Kind of entity affected.
    pub entity: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Creation timestamp (Unix epoch milliseconds).
    #[serde(default)]
    pub created: i64,
}
