//! Embedded schema migrations.
//!
//! Each migration runs in its own transaction together with the version bump
//! in the `meta` singleton row, so a failing script leaves the schema at the
//! previous version. A transaction-scoped advisory lock serializes concurrent
//! instances migrating the same schema.

use super::PostgresBackend;
use super::query::quote_ident;
use crate::models::Metadata;
use crate::{Error, Result};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply (statements separated by semicolons).
    /// `{schema}` is replaced by the quoted schema name.
    pub sql: &'static str,
}

/// Embedded migrations compiled into the binary.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Base schema",
        sql: r"
            CREATE TABLE IF NOT EXISTS {schema}.users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                custom_id TEXT,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.registrations (
                id TEXT PRIMARY KEY,
                pool_id TEXT NOT NULL,
                users_id TEXT NOT NULL,
                namespace TEXT,
                name TEXT,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.applications (
                id TEXT PRIMARY KEY,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.owners (
                id TEXT PRIMARY KEY,
                applications_id TEXT NOT NULL,
                users_id TEXT NOT NULL,
                role TEXT NOT NULL,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.subscriptions (
                id TEXT PRIMARY KEY,
                applications_id TEXT NOT NULL,
                api_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                client_id TEXT,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.approvals (
                id TEXT PRIMARY KEY,
                subscriptions_id TEXT NOT NULL,
                applications_id TEXT NOT NULL,
                api_id TEXT NOT NULL,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.verifications (
                id TEXT PRIMARY KEY,
                users_id TEXT NOT NULL,
                expires BIGINT NOT NULL,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.grants (
                id TEXT PRIMARY KEY,
                users_id TEXT NOT NULL,
                api_id TEXT NOT NULL,
                applications_id TEXT NOT NULL,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.webhook_listeners (
                id TEXT PRIMARY KEY,
                data JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {schema}.webhook_events (
                id TEXT PRIMARY KEY,
                webhook_listeners_id TEXT NOT NULL,
                data JSONB NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        description: "Lookup indexes",
        sql: r"
            CREATE INDEX IF NOT EXISTS idx_users_email ON {schema}.users (email);
            CREATE INDEX IF NOT EXISTS idx_users_custom_id ON {schema}.users (custom_id);
            CREATE INDEX IF NOT EXISTS idx_registrations_pool_user ON {schema}.registrations (pool_id, users_id);
            CREATE INDEX IF NOT EXISTS idx_registrations_user ON {schema}.registrations (users_id);
            CREATE INDEX IF NOT EXISTS idx_owners_application ON {schema}.owners (applications_id);
            CREATE INDEX IF NOT EXISTS idx_owners_user ON {schema}.owners (users_id);
            CREATE INDEX IF NOT EXISTS idx_subscriptions_application ON {schema}.subscriptions (applications_id);
            CREATE INDEX IF NOT EXISTS idx_subscriptions_api ON {schema}.subscriptions (api_id);
            CREATE INDEX IF NOT EXISTS idx_subscriptions_client_id ON {schema}.subscriptions (client_id);
            CREATE INDEX IF NOT EXISTS idx_approvals_subscription ON {schema}.approvals (subscriptions_id);
            CREATE INDEX IF NOT EXISTS idx_verifications_user ON {schema}.verifications (users_id);
            CREATE INDEX IF NOT EXISTS idx_grants_user ON {schema}.grants (users_id);
            CREATE INDEX IF NOT EXISTS idx_webhook_events_listener ON {schema}.webhook_events (webhook_listeners_id);
        ",
    },
];

/// Maximum version across a set of migrations.
#[must_use]
pub fn max_version(migrations: &[Migration]) -> i32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Substitutes the schema placeholder and splits into statements.
fn statements(migration: &Migration, schema: &str) -> Vec<String> {
    migration
        .sql
        .replace("{schema}", &quote_ident(schema))
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs migrations for one schema.
pub struct MigrationRunner<'a> {
    backend: &'a PostgresBackend,
}

impl<'a> MigrationRunner<'a> {
    /// Creates a new migration runner.
    #[must_use]
    pub const fn new(backend: &'a PostgresBackend) -> Self {
        Self { backend }
    }

    /// Creates the schema and metadata row if missing, then applies every
    /// pending migration. Returns the version reached.
    ///
    /// # Errors
    ///
    /// Returns `Error::Migration` naming the first failing version.
    pub async fn run(&self, migrations: &[Migration]) -> Result<i32> {
        self.ensure_meta_table().await?;

        let mut pending: Vec<Migration> = migrations.to_vec();
        pending.sort_by_key(|m| m.version);

        let mut version = self.current_version().await?;
        for migration in pending {
            if migration.version > version {
                self.apply_migration(migration).await?;
                version = migration.version;
            }
        }
        Ok(version)
    }

    /// Returns the applied version.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata row cannot be read.
    pub async fn current_version(&self) -> Result<i32> {
        Ok(self.backend.read_metadata().await?.version)
    }

    async fn ensure_meta_table(&self) -> Result<()> {
        let schema = quote_ident(self.backend.schema());
        let client = self.backend.client().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {schema}.meta (
                     id INTEGER PRIMARY KEY,
                     data JSONB NOT NULL
                 )"
            ))
            .await
            .map_err(|e| Error::operation("create_meta_table", e))?;

        let initial = serde_json::to_value(Metadata::initial())
            .map_err(|e| Error::operation("serialize_metadata", e))?;
        client
            .execute(
                &format!(
                    "INSERT INTO {schema}.meta (id, data) VALUES (1, $1) ON CONFLICT (id) DO NOTHING"
                ),
                &[&initial],
            )
            .await
            .map_err(|e| Error::operation("seed_meta_row", e))?;
        Ok(())
    }

    /// Applies a single migration within a transaction.
    async fn apply_migration(&self, migration: Migration) -> Result<()> {
        let schema = self.backend.schema().to_string();
        let statements = statements(&migration, &schema);

        let applied = self
            .backend
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let meta_table = format!("{}.meta", quote_ident(&schema));
                    tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&schema])
                        .await
                        .map_err(|e| Error::operation("migration_lock", e))?;

                    // Another instance may have applied it while we waited.
                    let row = tx
                        .query_one(&format!("SELECT data FROM {meta_table} WHERE id = 1"), &[])
                        .await
                        .map_err(|e| Error::operation("migration_read_version", e))?;
                    let data = row
                        .try_get(0)
                        .map_err(|e| Error::operation("migration_read_version", e))?;
                    let metadata: Metadata = serde_json::from_value(data)
                        .map_err(|e| Error::operation("migration_decode_metadata", e))?;
                    if metadata.version >= migration.version {
                        return Ok(false);
                    }

                    for statement in &statements {
                        tx.batch_execute(statement)
                            .await
                            .map_err(|e| Error::operation(migration.description, e))?;
                    }

                    let advanced = serde_json::to_value(metadata.advanced_to(migration.version))
                        .map_err(|e| Error::operation("serialize_metadata", e))?;
                    tx.execute(
                        &format!("UPDATE {meta_table} SET data = $1 WHERE id = 1"),
                        &[&advanced],
                    )
                    .await
                    .map_err(|e| Error::operation("record_migration", e))?;
                    Ok(true)
                })
            })
            .await
            .map_err(|e| Error::Migration {
                version: migration.version,
                cause: e.to_string(),
            })?;

        if applied {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                schema = self.backend.schema(),
                "Applied migration"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::EntityKind;

    #[test]
    fn test_versions_are_sequential() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, i32::try_from(i).unwrap() + 1);
        }
        assert_eq!(max_version(MIGRATIONS), 2);
        assert_eq!(max_version(&[]), 0);
    }

    #[test]
    fn test_base_schema_matches_entity_table() {
        let base = MIGRATIONS[0].sql;
        for kind in EntityKind::all() {
            let schema = kind.schema();
            let start = base
                .find(&format!("{{schema}}.{} (", schema.table))
                .unwrap_or_else(|| panic!("missing table {}", schema.table));
            let body = &base[start..];
            let body = &body[..body.find(");").unwrap()];
            for property in schema.properties {
                assert!(
                    body.contains(&format!("{} ", property.column)),
                    "{}.{} missing",
                    schema.table,
                    property.column
                );
            }
            assert!(body.contains("data JSONB NOT NULL"));
        }
    }

    #[test]
    fn test_statements_substitute_quoted_schema() {
        let statements = statements(&MIGRATIONS[1], "tenant_a");
        assert_eq!(statements.len(), 13);
        assert!(statements[0].contains(r#""tenant_a".users (email)"#));
        assert!(!statements.iter().any(|s| s.contains("{schema}")));
    }
}
