//! PostgreSQL storage backend.
//!
//! One table per entity kind inside a dedicated schema: a `TEXT` primary key,
//! the indexed properties as typed columns and the rest of the record as a
//! `JSONB` payload. Connections come from a `deadpool-postgres` pool;
//! notifications use a separate listening connection.
//!
//! # Bootstrap
//!
//! [`PostgresBackend::connect`] waits for the server (retrying while it is
//! unreachable or still starting up), creates the database if it does not
//! exist, then creates the schema and applies the embedded migrations.

mod count_cache;
mod migrations;
mod notify;
mod query;

pub use count_cache::CountCache;
pub use migrations::{MIGRATIONS, Migration, MigrationRunner, max_version};
pub use notify::{PgNotifier, decode_payload};
pub use query::{CompiledQuery, SqlParam, SqlQuery, compile, compile_delete, quote_ident};

use crate::config::{BackendType, PostgresConfig};
use crate::models::{Metadata, Page};
use crate::storage::query::Query;
use crate::storage::record;
use crate::storage::schema::{EntityKind, is_identifier};
use crate::storage::traits::{NotificationCallback, StorageBackend};
use crate::{Error, Result};
use async_trait::async_trait;
use deadpool_postgres::{Config, Object, Pool, Runtime, Transaction};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;

/// Interval between count cache sweeps.
const COUNT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Boxed future returned by transaction bodies.
pub type TransactionFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// PostgreSQL-based storage backend.
pub struct PostgresBackend {
    /// Connection pool.
    pool: Pool,
    /// Schema holding every table.
    schema: String,
    /// Connection settings, reused for the listening connection.
    pg_config: tokio_postgres::Config,
    count_cache: Arc<CountCache>,
    sweeper: JoinHandle<()>,
    notifier: OnceCell<PgNotifier>,
}

/// Helper to map pool errors.
fn pool_error(e: impl std::fmt::Display) -> Error {
    Error::operation("postgres_get_client", e)
}

/// Helper to map query errors.
fn query_error(op: &str, e: impl std::fmt::Display) -> Error {
    Error::operation(op, e)
}

/// Whether a connection failure is worth retrying.
fn is_transient(e: &tokio_postgres::Error) -> bool {
    // No SQLSTATE means the server was never reached (I/O, refused, timeout).
    e.code()
        .is_none_or(|code| *code == SqlState::CANNOT_CONNECT_NOW)
}

/// Extracts host string from tokio-postgres Host.
#[cfg(unix)]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    match h {
        tokio_postgres::config::Host::Tcp(s) => s.clone(),
        tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
    }
}

/// Extracts host string from tokio-postgres Host (Windows: Tcp only).
#[cfg(not(unix))]
fn host_to_string(h: &tokio_postgres::config::Host) -> String {
    let tokio_postgres::config::Host::Tcp(s) = h;
    s.clone()
}

/// `host:port/database`, for logs and errors.
fn describe(config: &tokio_postgres::Config) -> String {
    format!(
        "{}:{}/{}",
        config
            .get_hosts()
            .first()
            .map_or_else(|| "localhost".to_string(), host_to_string),
        config.get_ports().first().copied().unwrap_or(5432),
        config.get_dbname().unwrap_or_default()
    )
}

impl PostgresBackend {
    /// Connects, bootstraps the database and schema, and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an invalid schema name or URL,
    /// `Error::Connectivity` if the server stays unreachable after the
    /// configured retries, or `Error::Migration` if a migration fails.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        if !is_identifier(&config.schema) {
            return Err(Error::Validation(format!(
                "invalid schema name '{}'",
                config.schema
            )));
        }

        let pg_config = Self::build_pg_config(config)?;
        Self::ensure_database(&pg_config, config).await?;

        let pool = Self::build_pool_config(&pg_config, config.pool_max_size)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| query_error("postgres_create_pool", e))?;

        let count_cache = Arc::new(CountCache::new(Duration::from_secs(
            config.count_cache_ttl_secs,
        )));
        let sweeper = CountCache::spawn_sweeper(&count_cache, COUNT_CACHE_SWEEP_INTERVAL);

        let backend = Self {
            pool,
            schema: config.schema.clone(),
            pg_config,
            count_cache,
            sweeper,
            notifier: OnceCell::new(),
        };
        let version = backend.migrate().await?;

        tracing::info!(
            server = %describe(&backend.pg_config),
            schema = backend.schema,
            version,
            "Connected to PostgreSQL"
        );
        Ok(backend)
    }

    /// Builds the connection settings from a URL or the discrete fields.
    fn build_pg_config(config: &PostgresConfig) -> Result<tokio_postgres::Config> {
        let mut pg = if let Some(url) = &config.url {
            url.parse::<tokio_postgres::Config>()
                .map_err(|e| Error::Validation(format!("invalid PostgreSQL URL: {e}")))?
        } else {
            let mut pg = tokio_postgres::Config::new();
            pg.host(&config.host).port(config.port).user(&config.user);
            if let Some(password) = &config.password {
                pg.password(password.expose_secret());
            }
            pg
        };
        if pg.get_dbname().is_none() {
            pg.dbname(&config.database);
        }
        if pg.get_connect_timeout().is_none() {
            pg.connect_timeout(Duration::from_secs(5));
        }
        Ok(pg)
    }

    /// Builds a deadpool config from tokio-postgres config.
    ///
    /// Acquire, create and recycle are each bounded by a 5 second timeout.
    fn build_pool_config(config: &tokio_postgres::Config, pool_max_size: usize) -> Config {
        let mut cfg = Config::new();
        cfg.host = config.get_hosts().first().map(host_to_string);
        cfg.port = config.get_ports().first().copied();
        cfg.user = config.get_user().map(String::from);
        cfg.password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());
        cfg.dbname = config.get_dbname().map(String::from);
        cfg.connect_timeout = config.get_connect_timeout().copied();

        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_max_size.max(1),
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });

        cfg.manager = Some(deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        });

        cfg
    }

    /// Waits for the server and creates the database if it is missing.
    async fn ensure_database(pg: &tokio_postgres::Config, config: &PostgresConfig) -> Result<()> {
        let target = describe(pg);
        let delay = Duration::from_millis(config.retry_delay_ms);
        let mut attempts = 0;
        let mut created = false;

        loop {
            match pg.connect(NoTls).await {
                Ok(_) => return Ok(()),
                Err(e) if !created && e.code() == Some(&SqlState::INVALID_CATALOG_NAME) => {
                    Self::create_database(pg).await?;
                    created = true;
                },
                Err(e) if is_transient(&e) && attempts < config.connect_retries => {
                    attempts += 1;
                    tracing::warn!(
                        server = %target,
                        attempt = attempts,
                        max_attempts = config.connect_retries,
                        error = %e,
                        "PostgreSQL not reachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    return Err(Error::Connectivity {
                        target,
                        cause: e.to_string(),
                    });
                },
            }
        }
    }

    /// Creates the configured database through the `postgres` maintenance database.
    async fn create_database(pg: &tokio_postgres::Config) -> Result<()> {
        let name = pg.get_dbname().unwrap_or_default().to_string();
        let mut maintenance = pg.clone();
        maintenance.dbname("postgres");

        let (client, connection) =
            maintenance
                .connect(NoTls)
                .await
                .map_err(|e| Error::Connectivity {
                    target: describe(&maintenance),
                    cause: e.to_string(),
                })?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Maintenance connection closed");
            }
        });

        let result = client
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(&name)))
            .await;
        drop(client);
        let _ = driver.await;

        match result {
            Ok(()) => {
                tracing::info!(database = name, "Created database");
                Ok(())
            },
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(()),
            Err(e) => Err(query_error("postgres_create_database", e)),
        }
    }

    /// Applies pending schema migrations. Returns the version reached.
    ///
    /// # Errors
    ///
    /// Returns `Error::Migration` naming the first failing version.
    pub async fn migrate(&self) -> Result<i32> {
        MigrationRunner::new(self).run(MIGRATIONS).await
    }

    /// Returns the schema name.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the count cache.
    #[must_use]
    pub fn count_cache(&self) -> &CountCache {
        &self.count_cache
    }

    /// Checks out a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::OperationFailed` if no connection becomes available in time.
    pub async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(pool_error)
    }

    /// Runs `body` inside a transaction on one pooled connection.
    ///
    /// Commits if `body` succeeds and rolls back otherwise; the body's error is
    /// returned unchanged. A panicking body drops the transaction, which also
    /// rolls it back.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or `Error::OperationFailed` if the
    /// transaction cannot be started or committed.
    pub async fn with_transaction<T, F>(&self, body: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t Transaction<'t>) -> TransactionFuture<'t, T> + Send,
    {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| query_error("postgres_begin", e))?;

        match body(&tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("postgres_commit", e))?;
                Ok(value)
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            },
        }
    }

    /// Reads the metadata row.
    pub(crate) async fn read_metadata(&self) -> Result<Metadata> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT data FROM {}.meta WHERE id = 1", quote_ident(&self.schema)),
                &[],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNDEFINED_TABLE) {
                    Error::NotFound(format!("metadata of schema '{}'", self.schema))
                } else {
                    query_error("postgres_read_metadata", e)
                }
            })?
            .ok_or_else(|| Error::NotFound(format!("metadata of schema '{}'", self.schema)))?;

        let data: Value = row
            .try_get(0)
            .map_err(|e| query_error("postgres_read_metadata", e))?;
        serde_json::from_value(data).map_err(|e| query_error("postgres_decode_metadata", e))
    }
}

impl Drop for PostgresBackend {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Postgres
    }

    async fn init(&self) -> Result<()> {
        self.migrate().await?;
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        let statement = query::compile_get(&self.schema, kind, id);
        let client = self.client().await?;
        let row = client
            .query_opt(&statement.sql, &statement.bind())
            .await
            .map_err(|e| query_error("postgres_get", e))?;
        row.map(|row| query::row_to_record(kind, &row)).transpose()
    }

    async fn upsert(&self, kind: EntityKind, record: Value) -> Result<()> {
        let row = record::split(kind.schema(), &record)?;
        let statement = query::compile_upsert(&self.schema, kind, &row);
        let client = self.client().await?;
        client
            .execute(&statement.sql, &statement.bind())
            .await
            .map_err(|e| query_error("postgres_upsert", e))?;
        tracing::trace!(kind = %kind, id = row.id, "Upserted record");
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let client = self.client().await?;
        let removed = client
            .execute(
                &format!("DELETE FROM {} WHERE id = $1", query::table_name(&self.schema, kind)),
                &[&id],
            )
            .await
            .map_err(|e| query_error("postgres_delete", e))?;
        Ok(removed > 0)
    }

    async fn delete_where(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        let statement = compile_delete(&self.schema, kind, query)?;
        let removed = self
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.execute(&statement.sql, &statement.bind())
                        .await
                        .map_err(|e| query_error("postgres_delete_where", e))
                })
            })
            .await?;
        tracing::debug!(kind = %kind, removed, "Deleted matching records");
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn index(&self, kind: EntityKind, query: &Query) -> Result<Page<Value>> {
        let compiled = compile(&self.schema, kind, query)?;
        let client = self.client().await?;
        let rows = client
            .query(&compiled.select.sql, &compiled.select.bind())
            .await
            .map_err(|e| query_error("postgres_index", e))?;

        let (count, count_cached) = if query.limit == 0 && query.offset == 0 {
            (rows.len(), false)
        } else {
            let key = CountCache::key(&compiled.count);
            self.count_cache
                .get_or_fetch(&key, query.bypass_count_cache, || async {
                    let row = client
                        .query_one(&compiled.count.sql, &compiled.count.bind())
                        .await
                        .map_err(|e| query_error("postgres_count", e))?;
                    let count: i64 = row
                        .try_get(0)
                        .map_err(|e| query_error("postgres_count", e))?;
                    Ok(usize::try_from(count).unwrap_or(0))
                })
                .await?
        };

        query::rows_to_page(kind, &rows, count, count_cached)
    }

    async fn count(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        let compiled = compile(&self.schema, kind, query)?;
        let key = CountCache::key(&compiled.count);
        let (count, _) = self
            .count_cache
            .get_or_fetch(&key, query.bypass_count_cache, || async {
                let client = self.client().await?;
                let row = client
                    .query_one(&compiled.count.sql, &compiled.count.bind())
                    .await
                    .map_err(|e| query_error("postgres_count", e))?;
                let count: i64 = row
                    .try_get(0)
                    .map_err(|e| query_error("postgres_count", e))?;
                Ok(usize::try_from(count).unwrap_or(0))
            })
            .await?;
        Ok(count)
    }

    async fn metadata(&self) -> Result<Metadata> {
        self.read_metadata().await
    }

    async fn wipe(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&self.schema)
            ))
            .await
            .map_err(|e| query_error("postgres_wipe", e))?;
        self.count_cache.clear();
        tracing::info!(schema = self.schema, "Dropped schema");
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        notify::validate_channel(channel)?;
        let text = payload.to_string();
        let client = self.client().await?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &text])
            .await
            .map_err(|e| query_error("postgres_notify", e))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str, callback: NotificationCallback) -> Result<()> {
        let notifier = self
            .notifier
            .get_or_try_init(|| PgNotifier::connect(&self.pg_config))
            .await?;
        notifier.listen(channel, callback).await
    }
}
