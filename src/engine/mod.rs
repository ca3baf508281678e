//! Transactional key-value engine abstraction.
//!
//! [`Engine`] opens a named database and hands back a [`Connection`]; every
//! record operation runs inside one [`Transaction`] begun on that
//! connection. The default implementation is [`sqlite::SqliteEngine`];
//! [`memory::MemoryEngine`] keeps everything in process memory. To swap in
//! another backing store, implement these traits for it.

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;

/// Schema version every engine creates and expects.
pub const SCHEMA_VERSION: u32 = 1;

/// Primary key of a stored record.
///
/// Records written by this crate always use `Text`. `Int` only exists to
/// reach rows left behind by the old auto-incrementing key path. Integers
/// order before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// The numeric key an integer-looking string id may have been stored under.
    pub fn legacy_numeric(id: &str) -> Option<RecordKey> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        id.parse().ok().map(RecordKey::Int)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{}", n),
            RecordKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RecordKey {
    fn from(id: &str) -> Self {
        RecordKey::Text(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// What to open: a database name, one collection inside it, and the schema
/// version the caller expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub database: String,
    pub collection: String,
    pub version: u32,
}

impl OpenRequest {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            version: SCHEMA_VERSION,
        }
    }
}

/// Why a live connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Another opener moved the database to a newer schema version.
    VersionChange { requested: u32 },
    /// The engine lost the connection.
    ConnectionLost(String),
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidation::VersionChange { requested } => {
                write!(f, "version change to {}", requested)
            }
            Invalidation::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
        }
    }
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Connection: Connection;

    /// Opens the database, creating the collection (keyed by `id`) if it is
    /// missing. An open blocked by another connection waits rather than fails.
    async fn open(&self, request: &OpenRequest) -> Result<Arc<Self::Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn Transaction>>;

    /// Resolves once this connection has been invalidated from outside.
    async fn invalidated(&self) -> Invalidation;

    async fn close(&self);
}

/// One atomic unit of work on a single collection.
///
/// Nothing is visible to other transactions until [`Transaction::commit`]
/// returns. Dropping a transaction without committing discards it.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &RecordKey) -> Result<Option<Value>>;

    async fn get_all(&mut self) -> Result<Vec<Value>>;

    /// Inserts or overwrites the value under `key`.
    async fn put(&mut self, key: &RecordKey, value: Value) -> Result<()>;

    /// Removes `key`; removing an absent key is not an error.
    async fn delete(&mut self, key: &RecordKey) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_numeric_only_for_digit_strings() {
        assert_eq!(RecordKey::legacy_numeric("42"), Some(RecordKey::Int(42)));
        assert_eq!(RecordKey::legacy_numeric("007"), Some(RecordKey::Int(7)));
        assert_eq!(RecordKey::legacy_numeric(""), None);
        assert_eq!(RecordKey::legacy_numeric("-3"), None);
        assert_eq!(RecordKey::legacy_numeric("4a"), None);
        assert_eq!(RecordKey::legacy_numeric("99999999999999999999"), None);
    }

    #[test]
    fn test_integer_keys_sort_before_text_keys() {
        let mut keys = vec![RecordKey::from("a"), RecordKey::Int(10), RecordKey::Int(2)];
        keys.sort();
        assert_eq!(keys, vec![RecordKey::Int(2), RecordKey::Int(10), RecordKey::from("a")]);
    }
}
