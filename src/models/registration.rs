//! Pool registrations and consent grants.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-pool attribute bag of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Unique identifier.
    pub id: String,
    /// Registration pool.
    pub pool_id: String,
    /// The registered user.
    pub user_id: String,
    /// Namespace within the pool, for pools that require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Display name within the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Pool-specific attributes.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Consent to one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGrant {
    /// The granted scope.
    pub scope: String,
    /// When the scope was granted (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_date: Option<String>,
}

/// Consent record of a user for an application on an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Unique identifier.
    pub id: String,
    /// The consenting user.
    pub user_id: String,
    /// The API.
    pub api_id: String,
    /// The application acting on the user's behalf.
    pub application_id: String,
    /// Granted scopes.
    #[serde(default)]
    pub grants: Vec<ScopeGrant>,
}
