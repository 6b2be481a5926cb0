//! API subscriptions and approvals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subscription of an application to an API plan.
///
/// Credential fields hold plaintext only in memory; the DAO layer encrypts them
/// before they reach a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Unique identifier.
    pub id: String,
    /// The subscribing application.
    pub application: String,
    /// The API subscribed to.
    pub api: String,
    /// The plan of the API.
    pub plan: String,
    /// API key credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    /// OAuth client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// OAuth client secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Whether the subscription has been approved.
    #[serde(default)]
    pub approved: bool,
    /// Whether the subscription is trusted (skips consent).
    #[serde(default)]
    pub trusted: bool,
    /// Last change timestamp (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<String>,
    /// User who made the last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
}

impl Subscription {
    /// Creates an unapproved subscription without credentials.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        application: impl Into<String>,
        api: impl Into<String>,
        plan: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            application: application.into(),
            api: api.into(),
            plan: plan.into(),
            apikey: None,
            client_id: None,
            client_secret: None,
            approved: false,
            trusted: false,
            changed_date: None,
            changed_by: None,
        }
    }
}

/// Pending approval of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Unique identifier.
    pub id: String,
    /// The subscription awaiting approval.
    pub subscription_id: String,
    /// Application of the subscription.
    pub application: String,
    /// API of the subscription.
    pub api: String,
    /// Requested plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// User who requested the subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Approval {
    /// Creates an approval request for a subscription.
    #[must_use]
    pub fn for_subscription(id: impl Into<String>, subscription: &Subscription) -> Self {
        Self {
            id: id.into(),
            subscription_id: subscription.id.clone(),
            application: subscription.application.clone(),
            api: subscription.api.clone(),
            plan: Some(subscription.plan.clone()),
            user: subscription.changed_by.clone(),
            extra: Map::new(),
        }
    }
}
