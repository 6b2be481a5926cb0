//! Short-lived verification tokens.

use serde::{Deserialize, Serialize};

/// Purpose of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    /// Email address confirmation.
    #[default]
    Email,
    /// Password reset.
    LostPassword,
}

/// Out-of-band identity confirmation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    /// Unique identifier; doubles as the token.
    pub id: String,
    /// The user being verified.
    pub user_id: String,
    /// Email address the token was sent to.
    pub email: String,
    /// Purpose of the token.
    #[serde(rename = "type", default)]
    pub verification_type: VerificationType,
    /// Expiry (Unix epoch milliseconds).
    pub expires: i64,
    /// Link sent to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Verification {
    /// Returns whether the token has expired at `now` (epoch milliseconds).
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires <= now
    }
}
