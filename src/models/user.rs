//! Portal user records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A registered portal user.
///
/// Arbitrary profile attributes that the storage layer does not interpret are
/// kept in `profile` and round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique identifier.
    pub id: String,
    /// Identifier assigned by an external identity provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    /// Email address, stored lowercase.
    pub email: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Credential hash, absent for federated users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Whether the email address has been verified.
    #[serde(default)]
    pub validated: bool,
    /// Group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Remaining profile fields.
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl User {
    /// Creates a user with the given id and email.
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            custom_id: None,
            email: email.into(),
            name: None,
            password: None,
            validated: false,
            groups: Vec::new(),
            profile: Map::new(),
        }
    }

    /// Sets the external identity provider id.
    #[must_use]
    pub fn with_custom_id(mut self, custom_id: impl Into<String>) -> Self {
        self.custom_id = Some(custom_id.into());
        self
    }

    /// Returns whether the user belongs to the given group.
    #[must_use]
    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_fields_are_flattened() {
        let json = serde_json::json!({
            "id": "u1",
            "email": "a@b.c",
            "validated": true,
            "company": "ACME"
        });
        let user: User = serde_json::from_value(json).unwrap();
        assert_eq!(user.profile.get("company"), Some(&Value::from("ACME")));
        assert!(user.custom_id.is_none());

        let back = serde_json::to_value(&user).unwrap();
        assert_eq!(back["company"], "ACME");
        assert!(back.get("customId").is_none());
    }
}
