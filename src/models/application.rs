//! Applications and their owners.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Role of a user on an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerRole {
    /// Full control, including ownership changes.
    #[default]
    Owner,
    /// May manage subscriptions.
    Collaborator,
    /// Read-only access.
    Reader,
}

impl OwnerRole {
    /// Returns all roles.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Owner, Self::Collaborator, Self::Reader]
    }

    /// Returns the role as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Collaborator => "collaborator",
            Self::Reader => "reader",
        }
    }

    /// Human-readable description of the role.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Owner => "Owner",
            Self::Collaborator => "Collaborator",
            Self::Reader => "Reader",
        }
    }
}

impl fmt::Display for OwnerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Membership of a user on an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    /// Record id, derived from application and user.
    pub id: String,
    /// The application.
    pub app_id: String,
    /// The user.
    pub user_id: String,
    /// Role of the user on the application.
    pub role: OwnerRole,
    /// Denormalized email of the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Owner {
    /// Creates an ownership record.
    #[must_use]
    pub fn new(app_id: impl Into<String>, user_id: impl Into<String>, role: OwnerRole) -> Self {
        let app_id = app_id.into();
        let user_id = user_id.into();
        Self {
            id: Self::id_for(&app_id, &user_id),
            app_id,
            user_id,
            role,
            email: None,
        }
    }

    /// Derives the record id of the ownership of `user_id` on `app_id`.
    ///
    /// Application and user ids may both contain separators, so the id is a
    /// digest of the pair rather than a concatenation.
    #[must_use]
    pub fn id_for(app_id: &str, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(app_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(user_id.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

/// A client application registered in the portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Unique identifier (case-insensitive for uniqueness).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// OAuth redirect URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    /// Whether the application can keep a client secret.
    #[serde(default)]
    pub confidential: bool,
    /// Owners of the application.
    ///
    /// Owners are persisted as separate records; the bare application record
    /// never carries this list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<Owner>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Application {
    /// Creates an application without owners.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            redirect_uri: None,
            confidential: false,
            owners: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Returns a copy of this application without its owner list.
    #[must_use]
    pub fn bare(&self) -> Self {
        Self {
            owners: Vec::new(),
            ..self.clone()
        }
    }

    /// Returns whether at least one owner has the `owner` role.
    #[must_use]
    pub fn has_owner(&self) -> bool {
        self.owners.iter().any(|o| o.role == OwnerRole::Owner)
    }
}
