//! Ingestion configuration
//!
//! Database and runtime settings come from environment variables (a `.env`
//! file is honoured by the binary). The list of sources comes from a JSON
//! catalog shaped like:
//!
//! ```json
//! {
//!   "s1": { "name": "Regional poles", "archive_url": "https://example.org/poles.kmz" },
//!   "s2": { "name": "Backbone",       "kmz_file":    "https://example.org/fiber.kmz" }
//! }
//! ```
//!
//! Catalog order is processing order.

use anyhow::{Context, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

pub const DEFAULT_SOURCES_PATH: &str = "kmz_files.json";
pub const DEFAULT_TABLE: &str = "kmz_features";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_USER_AGENT: &str = concat!("geoarc-ingest/", env!("CARGO_PKG_VERSION"));

const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 6432;
const DEFAULT_DB_NAME: &str = "metrics";
const DEFAULT_DB_USER: &str = "admin";
const DEFAULT_DB_PASSWORD: &str = "admin123";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ============================================================================
// Database
// ============================================================================

/// Connection settings for the spatial database
///
/// `DATABASE_URL` wins over the individual `DB_*` variables when set.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            name: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: DEFAULT_DB_PASSWORD.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("target", &self.display_target())
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            host: env_string("DB_HOST", DEFAULT_DB_HOST),
            port: env_or("DB_PORT", DEFAULT_DB_PORT),
            name: env_string("DB_NAME", DEFAULT_DB_NAME),
            user: env_string("DB_USER", DEFAULT_DB_USER),
            password: env_string("DB_PASSWORD", DEFAULT_DB_PASSWORD),
            max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        match &self.url {
            Some(url) => url.parse().context("DATABASE_URL is not a valid Postgres URL"),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.name)
                .username(&self.user)
                .password(&self.password)),
        }
    }

    /// Connection target without credentials, for logs
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(url) => match Url::parse(url) {
                Ok(parsed) => format!(
                    "{}:{}{}",
                    parsed.host_str().unwrap_or("localhost"),
                    parsed.port().unwrap_or(5432),
                    parsed.path()
                ),
                Err(_) => "<unparseable DATABASE_URL>".to_string(),
            },
            None => format!("{}:{}/{}", self.host, self.port, self.name),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("DB_CONNECT_TIMEOUT must be greater than 0");
        }
        self.connect_options()?;
        Ok(())
    }
}

// ============================================================================
// Fetching
// ============================================================================

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Draw a progress bar while downloading
    pub show_progress: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            show_progress: false,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        Self {
            timeout_secs: env_or("GEOARC_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS),
            user_agent: env_string("GEOARC_USER_AGENT", DEFAULT_USER_AGENT),
            show_progress: false,
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub fetch: FetchConfig,
    /// Path of the JSON source catalog
    pub sources_path: PathBuf,
    /// Destination table for feature rows
    pub table: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            fetch: FetchConfig::default(),
            sources_path: PathBuf::from(DEFAULT_SOURCES_PATH),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database: DatabaseConfig::from_env(),
            fetch: FetchConfig::from_env(),
            sources_path: PathBuf::from(env_string("GEOARC_SOURCES_PATH", DEFAULT_SOURCES_PATH)),
            table: env_string("GEOARC_TABLE", DEFAULT_TABLE),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("GEOARC_FETCH_TIMEOUT_SECS must be greater than 0");
        }
        validate_table_name(&self.table)?;
        Ok(())
    }
}

/// Table names are interpolated into SQL and must be plain lowercase identifiers
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > 63 {
        anyhow::bail!(
            "Invalid table name '{}': expected a lowercase identifier of at most 63 characters",
            name
        );
    }
    Ok(())
}

// ============================================================================
// Source catalog
// ============================================================================

/// One configured archive to ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub archive_url: Url,
}

/// Ordered, duplicate-free list of sources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCatalog {
    sources: Vec<SourceDescriptor>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    name: String,
    #[serde(alias = "kmz_file")]
    archive_url: String,
}

impl SourceCatalog {
    pub fn new(sources: Vec<SourceDescriptor>) -> Self {
        Self { sources }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid source catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source catalog {}", path.display()))?;
        Self::from_json_str(&json)
            .with_context(|| format!("Failed to load source catalog {}", path.display()))
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<'de> Deserialize<'de> for SourceCatalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(CatalogVisitor)
    }
}

struct CatalogVisitor;

impl<'de> Visitor<'de> for CatalogVisitor {
    type Value = SourceCatalog;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of source id to {name, archive_url}")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(map.size_hint().unwrap_or(0));

        while let Some((id, entry)) = map.next_entry::<String, SourceEntry>()? {
            if id.trim().is_empty() {
                return Err(de::Error::custom("source id must not be empty"));
            }
            if !seen.insert(id.clone()) {
                return Err(de::Error::custom(format!("duplicate source id '{}'", id)));
            }

            let archive_url = Url::parse(&entry.archive_url).map_err(|e| {
                de::Error::custom(format!(
                    "source '{}' has invalid archive_url '{}': {}",
                    id, entry.archive_url, e
                ))
            })?;
            if !matches!(archive_url.scheme(), "http" | "https") {
                return Err(de::Error::custom(format!(
                    "source '{}' archive_url must use http or https",
                    id
                )));
            }

            sources.push(SourceDescriptor {
                id,
                name: entry.name,
                archive_url,
            });
        }

        Ok(SourceCatalog { sources })
    }
}
