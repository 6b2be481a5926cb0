//! Declarative storage model.
//!
//! Each entity kind declares which record fields are promoted to indexed
//! columns; every other field lives in the opaque payload. Both backends read
//! this table: the relational backend creates one column per indexed property,
//! the JSON backend mirrors the same properties into `_index.json`.
//!
//! Field-name resolution for queries is an explicit lookup in this table:
//! indexed property (by record field or column name), friendly alias, joined
//! field, or, failing all of those, a payload key.

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Physical type of an indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// `TEXT` column holding a JSON string.
    Text,
    /// `BIGINT` column holding a JSON integer.
    BigInt,
}

impl ColumnType {
    /// SQL type name.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::BigInt => "BIGINT",
        }
    }
}

/// A record field promoted to its own column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedProperty {
    /// Field name in the record.
    pub field: &'static str,
    /// Column name in the table.
    pub column: &'static str,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether the property may be absent.
    pub optional: bool,
}

impl IndexedProperty {
    const fn text(field: &'static str, column: &'static str) -> Self {
        Self {
            field,
            column,
            column_type: ColumnType::Text,
            optional: false,
        }
    }

    const fn optional_text(field: &'static str, column: &'static str) -> Self {
        Self {
            field,
            column,
            column_type: ColumnType::Text,
            optional: true,
        }
    }

    const fn bigint(field: &'static str, column: &'static str) -> Self {
        Self {
            field,
            column,
            column_type: ColumnType::BigInt,
            optional: false,
        }
    }
}

/// Friendly name for an indexed property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAlias {
    /// The friendly name.
    pub name: &'static str,
    /// The record field it stands for.
    pub field: &'static str,
}

/// A field read from a related entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinedField {
    /// Name used in queries.
    pub name: &'static str,
    /// The related entity kind.
    pub kind: EntityKind,
    /// Record field of this entity holding the related id.
    pub local_field: &'static str,
    /// Payload key of the related record.
    pub remote_key: &'static str,
}

/// Storage description of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    /// Table (and collection directory) name.
    pub table: &'static str,
    /// Indexed properties.
    pub properties: &'static [IndexedProperty],
    /// Friendly aliases.
    pub aliases: &'static [FieldAlias],
    /// Joined fields.
    pub joins: &'static [JoinedField],
}

/// Outcome of resolving a query field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedField<'a> {
    /// The primary key.
    Id,
    /// An indexed property.
    Property(&'a IndexedProperty),
    /// A field of a related entity.
    Joined(&'a JoinedField),
    /// A key inside the payload.
    Payload(&'a str),
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!()));

/// Checks if a name is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

impl EntitySchema {
    /// Looks up an indexed property by record field name.
    #[must_use]
    pub fn property(&self, field: &str) -> Option<&IndexedProperty> {
        self.properties.iter().find(|p| p.field == field)
    }

    /// Resolves a query field name.
    ///
    /// Unknown names fall through to a payload key, provided they are plain
    /// identifiers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the name is not a plain identifier.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Result<ResolvedField<'a>> {
        if name == "id" {
            return Ok(ResolvedField::Id);
        }
        if let Some(p) = self
            .properties
            .iter()
            .find(|p| p.field == name || p.column == name)
        {
            return Ok(ResolvedField::Property(p));
        }
        if let Some(alias) = self.aliases.iter().find(|a| a.name == name) {
            if let Some(p) = self.property(alias.field) {
                return Ok(ResolvedField::Property(p));
            }
        }
        if let Some(join) = self.joins.iter().find(|j| j.name == name) {
            return Ok(ResolvedField::Joined(join));
        }
        if IDENTIFIER.is_match(name) {
            tracing::trace!(table = self.table, field = name, "Resolving field as payload key");
            Ok(ResolvedField::Payload(name))
        } else {
            Err(Error::Validation(format!(
                "invalid field name '{name}' for {}",
                self.table
            )))
        }
    }
}

/// Every persisted entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Portal users.
    Users,
    /// Per-pool user registrations.
    Registrations,
    /// Applications (bare records).
    Applications,
    /// Application ownerships.
    Owners,
    /// API subscriptions.
    Subscriptions,
    /// Pending subscription approvals.
    Approvals,
    /// Verification tokens.
    Verifications,
    /// Consent grants.
    Grants,
    /// Webhook endpoints.
    WebhookListeners,
    /// Queued webhook notifications.
    WebhookEvents,
}

const USERS: EntitySchema = EntitySchema {
    table: "users",
    properties: &[
        IndexedProperty::text("email", "email"),
        IndexedProperty::optional_text("customId", "custom_id"),
    ],
    aliases: &[],
    joins: &[],
};

const REGISTRATIONS: EntitySchema = EntitySchema {
    table: "registrations",
    properties: &[
        IndexedProperty::text("poolId", "pool_id"),
        IndexedProperty::text("userId", "users_id"),
        IndexedProperty::optional_text("namespace", "namespace"),
        IndexedProperty::optional_text("name", "name"),
    ],
    aliases: &[
        FieldAlias {
            name: "pool",
            field: "poolId",
        },
        FieldAlias {
            name: "user",
            field: "userId",
        },
    ],
    joins: &[JoinedField {
        name: "email",
        kind: EntityKind::Users,
        local_field: "userId",
        remote_key: "email",
    }],
};

const APPLICATIONS: EntitySchema = EntitySchema {
    table: "applications",
    properties: &[],
    aliases: &[],
    joins: &[],
};

const OWNERS: EntitySchema = EntitySchema {
    table: "owners",
    properties: &[
        IndexedProperty::text("appId", "applications_id"),
        IndexedProperty::text("userId", "users_id"),
        IndexedProperty::text("role", "role"),
    ],
    aliases: &[
        FieldAlias {
            name: "application",
            field: "appId",
        },
        FieldAlias {
            name: "user",
            field: "userId",
        },
    ],
    joins: &[],
};

const SUBSCRIPTIONS: EntitySchema = EntitySchema {
    table: "subscriptions",
    properties: &[
        IndexedProperty::text("application", "applications_id"),
        IndexedProperty::text("api", "api_id"),
        IndexedProperty::text("plan", "plan_id"),
        IndexedProperty::optional_text("clientIdHash", "client_id"),
    ],
    aliases: &[
        FieldAlias {
            name: "appId",
            field: "application",
        },
        FieldAlias {
            name: "apiId",
            field: "api",
        },
        FieldAlias {
            name: "planId",
            field: "plan",
        },
    ],
    joins: &[JoinedField {
        name: "applicationName",
        kind: EntityKind::Applications,
        local_field: "application",
        remote_key: "name",
    }],
};

const APPROVALS: EntitySchema = EntitySchema {
    table: "approvals",
    properties: &[
        IndexedProperty::text("subscriptionId", "subscriptions_id"),
        IndexedProperty::text("application", "applications_id"),
        IndexedProperty::text("api", "api_id"),
    ],
    aliases: &[],
    joins: &[],
};

const VERIFICATIONS: EntitySchema = EntitySchema {
    table: "verifications",
    properties: &[
        IndexedProperty::text("userId", "users_id"),
        IndexedProperty::bigint("expires", "expires"),
    ],
    aliases: &[],
    joins: &[],
};

const GRANTS: EntitySchema = EntitySchema {
    table: "grants",
    properties: &[
        IndexedProperty::text("userId", "users_id"),
        IndexedProperty::text("apiId", "api_id"),
        IndexedProperty::text("applicationId", "applications_id"),
    ],
    aliases: &[],
    joins: &[],
};

const WEBHOOK_LISTENERS: EntitySchema = EntitySchema {
    table: "webhook_listeners",
    properties: &[],
    aliases: &[],
    joins: &[],
};

const WEBHOOK_EVENTS: EntitySchema = EntitySchema {
    table: "webhook_events",
    properties: &[IndexedProperty::text("listenerId", "webhook_listeners_id")],
    aliases: &[],
    joins: &[],
};

impl EntityKind {
    /// Returns all entity kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Users,
            Self::Registrations,
            Self::Applications,
            Self::Owners,
            Self::Subscriptions,
            Self::Approvals,
            Self::Verifications,
            Self::Grants,
            Self::WebhookListeners,
            Self::WebhookEvents,
        ]
    }

    /// Returns the storage description of this kind.
    #[must_use]
    pub const fn schema(self) -> &'static EntitySchema {
        match self {
            Self::Users => &USERS,
            Self::Registrations => &REGISTRATIONS,
            Self::Applications => &APPLICATIONS,
            Self::Owners => &OWNERS,
            Self::Subscriptions => &SUBSCRIPTIONS,
            Self::Approvals => &APPROVALS,
            Self::Verifications => &VERIFICATIONS,
            Self::Grants => &GRANTS,
            Self::WebhookListeners => &WEBHOOK_LISTENERS,
            Self::WebhookEvents => &WEBHOOK_EVENTS,
        }
    }

    /// Returns the table / collection name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.schema().table
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
