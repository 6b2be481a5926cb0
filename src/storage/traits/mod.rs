//! Storage backend traits.

mod persistence;

pub use persistence::{NotificationCallback, StorageBackend};
