use crate::engine::sqlite::SqliteLocation;
use crate::engine::{OpenRequest, SqliteEngine, SCHEMA_VERSION};
use crate::store::DEFAULT_READY_TIMEOUT;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "ChatDB";
pub const DEFAULT_COLLECTION: &str = "Chats";

const ENV_DIR: &str = "CHATDB_DIR";
const ENV_NAME: &str = "CHATDB_NAME";
const ENV_COLLECTION: &str = "CHATDB_COLLECTION";
const ENV_READY_TIMEOUT_MS: &str = "CHATDB_READY_TIMEOUT_MS";
const ENV_IN_MEMORY: &str = "CHATDB_IN_MEMORY";

/// Where and how the chat store is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database: String,
    pub collection: String,
    pub location: SqliteLocation,
    /// How long an operation waits for the store to become ready.
    pub ready_timeout: Duration,
    /// How long SQLite waits on a lock held by another connection.
    pub busy_timeout: Duration,
    /// How often a live connection looks for a newer schema version.
    pub version_check_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            location: SqliteLocation::Directory(default_data_dir()),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            busy_timeout: Duration::from_secs(5),
            version_check_interval: Duration::from_secs(1),
        }
    }
}

impl StoreConfig {
    /// Builds the config from `CHATDB_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DIR) {
            config.location = SqliteLocation::Directory(PathBuf::from(dir));
        }
        if let Some(flag) = lookup(ENV_IN_MEMORY) {
            let in_memory = parse_flag(&flag)
                .with_context(|| format!("Invalid value for {}: {:?}", ENV_IN_MEMORY, flag))?;
            if in_memory {
                config.location = SqliteLocation::Memory;
            }
        }
        if let Some(name) = lookup(ENV_NAME) {
            config.database = name;
        }
        if let Some(collection) = lookup(ENV_COLLECTION) {
            config.collection = collection;
        }
        if let Some(ms) = lookup(ENV_READY_TIMEOUT_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", ENV_READY_TIMEOUT_MS, ms))?;
            config.ready_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        log::debug!("Loaded store config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            bail!("Database name must not be empty");
        }
        if self.database.contains(['/', '\\']) {
            bail!("Database name must not contain path separators: {}", self.database);
        }
        let valid_collection = !self.collection.is_empty()
            && self
                .collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_collection {
            bail!(
                "Collection name must be letters, digits or underscores: {:?}",
                self.collection
            );
        }
        Ok(())
    }

    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            database: self.database.clone(),
            collection: self.collection.clone(),
            version: SCHEMA_VERSION,
        }
    }

    pub fn engine(&self) -> SqliteEngine {
        SqliteEngine::new(self.location.clone())
            .busy_timeout(self.busy_timeout)
            .version_check_interval(self.version_check_interval)
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got {:?}", other),
    }
}

// $XDG_DATA_HOME/chatdb, else ~/.local/share/chatdb, else ./chatdb
fn default_data_dir() -> PathBuf {
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data_home).join("chatdb");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local").join("share").join("chatdb");
    }
    PathBuf::from("chatdb")
}
