//! Configuration management.
//!
//! Storage and migration settings are read from TOML or JSON files, then
//! overlaid with `PORTAL_*` environment variables:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `PORTAL_STORAGE_TYPE` | `json` or `postgres`; switches the backend |
//! | `PORTAL_JSON_PATH` | JSON store root |
//! | `PORTAL_PG_URL` | PostgreSQL connection URL (wins over the discrete fields) |
//! | `PORTAL_PG_HOST` / `PORTAL_PG_PORT` | PostgreSQL server |
//! | `PORTAL_PG_USER` / `PORTAL_PG_PASSWORD` | PostgreSQL credentials |
//! | `PORTAL_PG_DATABASE` / `PORTAL_PG_SCHEMA` | PostgreSQL database and schema |
//! | `PORTAL_CREDENTIAL_KEY` | base64 AES-256 key for subscription credentials |

use crate::{Error, Result};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// JSON flat files.
    Json,
    /// PostgreSQL.
    Postgres,
}

impl BackendType {
    /// Returns the backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Postgres => "postgres",
        }
    }

    /// Parses a backend name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonConfig {
    /// Store root directory.
    pub path: PathBuf,
}

impl Default for JsonConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
        }
    }
}

impl JsonConfig {
    /// Creates settings for the given root.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Returns the platform data directory for the JSON store.
///
/// Falls back to `./.portal-data` when no home directory can be determined.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "portal-dao").map_or_else(
        || PathBuf::from(".portal-data"),
        |dirs| dirs.data_dir().join("store"),
    )
}

/// PostgreSQL backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostgresConfig {
    /// Connection URL; when set, the discrete connection fields are ignored.
    pub url: Option<String>,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    #[serde(with = "optional_secret_serde", skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretString>,
    /// Database name; created on first connect if missing.
    pub database: String,
    /// Schema holding every table.
    pub schema: String,
    /// Maximum pooled connections.
    pub pool_max_size: usize,
    /// Connection attempts while the server is unreachable or starting up.
    pub connect_retries: u32,
    /// Delay between connection attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Lifetime of cached counts in seconds.
    pub count_cache_ttl_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "portal".to_string(),
            schema: "portal".to_string(),
            pool_max_size: 20,
            connect_retries: 30,
            retry_delay_ms: 1000,
            count_cache_ttl_secs: 60,
        }
    }
}

impl PostgresConfig {
    /// Creates settings from a connection URL.
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Sets the schema name.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

/// Backend selection with its settings.
///
/// Serialized as `{"type": "json", "config": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum BackendConfig {
    /// JSON flat files.
    Json(JsonConfig),
    /// PostgreSQL.
    Postgres(PostgresConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Json(JsonConfig::default())
    }
}

impl BackendConfig {
    /// Returns the backend type.
    #[must_use]
    pub const fn backend_type(&self) -> BackendType {
        match self {
            Self::Json(_) => BackendType::Json,
            Self::Postgres(_) => BackendType::Postgres,
        }
    }

    fn apply_overrides(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        if let Some(kind) = lookup("PORTAL_STORAGE_TYPE").and_then(|v| BackendType::parse(&v)) {
            if kind != self.backend_type() {
                self = match kind {
                    BackendType::Json => Self::Json(JsonConfig::default()),
                    BackendType::Postgres => Self::Postgres(PostgresConfig::default()),
                };
            }
        }

        match &mut self {
            Self::Json(json) => {
                if let Some(path) = lookup("PORTAL_JSON_PATH") {
                    json.path = PathBuf::from(path);
                }
            },
            Self::Postgres(pg) => {
                if let Some(url) = lookup("PORTAL_PG_URL") {
                    pg.url = Some(url);
                }
                if let Some(host) = lookup("PORTAL_PG_HOST") {
                    pg.host = host;
                }
                if let Some(port) = lookup("PORTAL_PG_PORT").and_then(|v| v.parse().ok()) {
                    pg.port = port;
                }
                if let Some(user) = lookup("PORTAL_PG_USER") {
                    pg.user = user;
                }
                if let Some(password) = lookup("PORTAL_PG_PASSWORD") {
                    pg.password = Some(SecretString::from(password));
                }
                if let Some(database) = lookup("PORTAL_PG_DATABASE") {
                    pg.database = database;
                }
                if let Some(schema) = lookup("PORTAL_PG_SCHEMA") {
                    pg.schema = schema;
                }
            },
        }
        self
    }
}

/// Settings for opening a [`Dao`](crate::Dao).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// The backend to open.
    pub storage: BackendConfig,
    /// Base64 AES-256 key for subscription credentials.
    #[serde(with = "optional_secret_serde", skip_serializing_if = "Option::is_none")]
    pub credential_key: Option<SecretString>,
}

impl StorageConfig {
    /// Creates settings for a backend without a credential key.
    #[must_use]
    pub const fn new(storage: BackendConfig) -> Self {
        Self {
            storage,
            credential_key: None,
        }
    }

    /// Sets the credential key.
    #[must_use]
    pub fn with_credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = Some(SecretString::from(key.into()));
        self
    }

    /// Loads settings from a TOML or JSON file (by extension).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        load_file(path)
    }

    /// Loads settings from the default location, or defaults, then applies
    /// `.env` and environment overrides.
    ///
    /// Checks `<config dir>/portal-dao/config.toml`.
    #[must_use]
    pub fn load_default() -> Self {
        let _ = dotenvy::dotenv();

        let config = directories::ProjectDirs::from("", "", "portal-dao")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.exists())
            .and_then(|path| match Self::load_from_file(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                    None
                },
            })
            .unwrap_or_default();

        config.with_env_overrides()
    }

    /// Applies `PORTAL_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(&|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        self.storage = self.storage.apply_overrides(lookup);
        if let Some(key) = lookup("PORTAL_CREDENTIAL_KEY") {
            self.credential_key = Some(SecretString::from(key));
        }
        self
    }
}

/// Settings for a cross-backend migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Store to copy from.
    pub source: BackendConfig,
    /// Store to copy into.
    pub target: BackendConfig,
    /// Wipe and re-initialize the target before copying.
    #[serde(default)]
    pub wipe_target: bool,
    /// Base64 AES-256 key shared by source and target.
    #[serde(
        default,
        with = "optional_secret_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_key: Option<SecretString>,
    /// Records fetched per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

const fn default_page_size() -> usize {
    5
}

impl MigrationConfig {
    /// Creates settings with the default page size and no wipe.
    #[must_use]
    pub const fn new(source: BackendConfig, target: BackendConfig) -> Self {
        Self {
            source,
            target,
            wipe_target: false,
            credential_key: None,
            page_size: default_page_size(),
        }
    }

    /// Loads settings from a TOML or JSON file (by extension).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        load_file(path)
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
        operation: "read_config_file".to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;

    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str(&contents)
            .map_err(|e| Error::Validation(format!("invalid config {}: {e}", path.display())))
    } else {
        toml::from_str(&contents)
            .map_err(|e| Error::Validation(format!("invalid config {}: {e}", path.display())))
    }
}

mod optional_secret_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret {
            // Never serialize the actual secret
            Some(_) => serializer.serialize_str("***REDACTED***"),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(SecretString::from))
    }
}
