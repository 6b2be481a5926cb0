//! Canonical entity records.
//!
//! Every record carries a unique string `id`. Field names serialize in camelCase,
//! the portal's wire format; backends store exactly this representation.

mod application;
mod meta;
mod registration;
mod subscription;
mod user;
mod verification;
mod webhook;

pub use application::{Application, Owner, OwnerRole};
pub use meta::{Metadata, Page};
pub use registration::{Grant, Registration, ScopeGrant};
pub use subscription::{Approval, Subscription};
pub use user::User;
pub use verification::{Verification, VerificationType};
pub use webhook::{WebhookEvent, WebhookListener};

/// Generates a new random record id.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
