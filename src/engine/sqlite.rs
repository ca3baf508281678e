use super::{Connection, Engine, Invalidation, OpenRequest, RecordKey, Transaction, TxMode};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// Primary SQLite result codes for a locked database. Extended codes such as
// SQLITE_BUSY_SNAPSHOT (517) carry the primary code in their low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

const BLOCKED_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Where the database file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    /// `<dir>/<database>.sqlite`
    Directory(PathBuf),
    /// A private in-memory database, gone when the connection closes.
    Memory,
}

/// SQLite-backed [`Engine`].
///
/// Each collection is one table with an untyped `id` primary key, so a text
/// id and an integer id never collide. The schema version is kept in
/// `PRAGMA user_version`. The pool holds a single connection: every
/// transaction in this process runs on it in turn.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    location: SqliteLocation,
    busy_timeout: Duration,
    version_check_interval: Duration,
}

impl SqliteEngine {
    pub fn new(location: SqliteLocation) -> Self {
        Self {
            location,
            busy_timeout: Duration::from_secs(5),
            version_check_interval: Duration::from_secs(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(SqliteLocation::Memory)
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// How often a live connection checks for a newer schema version
    /// written by another process.
    pub fn version_check_interval(mut self, interval: Duration) -> Self {
        self.version_check_interval = interval;
        self
    }

    /// Resolves the database URL, creating the directory and file if needed.
    async fn database_url(&self, database: &str) -> Result<String> {
        match &self.location {
            SqliteLocation::Memory => Ok("sqlite::memory:".to_string()),
            SqliteLocation::Directory(dir) => {
                // Ensure the parent directory exists
                tokio::fs::create_dir_all(dir).await.map_err(StoreError::storage)?;

                let db_path = dir.join(format!("{}.sqlite", database));
                let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
                log::info!("Connecting to database: {}", db_url);

                // Create the database file if it doesn't exist
                if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
                    log::info!("Database file not found, creating...");
                    Sqlite::create_database(&db_url).await?;
                }
                Ok(db_url)
            }
        }
    }

    async fn connect(&self, db_url: &str) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(db_url)?.busy_timeout(self.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            // A private in-memory database must outlive idle periods.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(pool)
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    type Connection = SqliteConnection;

    async fn open(&self, request: &OpenRequest) -> Result<Arc<SqliteConnection>> {
        let table = table_name(&request.collection)?;
        let db_url = self.database_url(&request.database).await?;
        let pool = self.connect(&db_url).await?;

        let mut reported_blocked = false;
        loop {
            match create_schema(&pool, &table, request.version).await {
                Ok(()) => break,
                Err(e) if is_busy(&e) => {
                    if !reported_blocked {
                        log::warn!(
                            "Opening {} is blocked by another connection; waiting for it to release",
                            request.database
                        );
                        reported_blocked = true;
                    }
                    tokio::time::sleep(BLOCKED_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        Ok(Arc::new(SqliteConnection {
            pool,
            table,
            version: request.version,
            version_check_interval: self.version_check_interval,
        }))
    }
}

/// Creates the collection table if missing and stamps the schema version.
async fn create_schema(pool: &SqlitePool, table: &str, version: u32) -> Result<()> {
    let mut tx = pool.begin().await?;

    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *tx)
        .await?;
    if current > i64::from(version) {
        return Err(StoreError::storage(format!(
            "database is at schema version {}, newer than supported {}",
            current, version
        )));
    }

    let create = format!(
        "CREATE TABLE IF NOT EXISTS {} (id PRIMARY KEY NOT NULL, record TEXT NOT NULL)",
        table
    );
    sqlx::query(&create).execute(&mut *tx).await?;

    if current < i64::from(version) {
        log::info!("Setting schema version {} -> {}", current, version);
        // PRAGMA does not take bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {}", version))
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await.map_err(StoreError::transaction)?;
    Ok(())
}

fn is_busy(err: &StoreError) -> bool {
    let StoreError::Storage(source) = err else {
        return false;
    };
    match source.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => db.code().map_or(false, |code| is_busy_code(&code)),
        _ => false,
    }
}

fn is_busy_code(code: &str) -> bool {
    match code.parse::<i32>() {
        Ok(code) => matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
        Err(_) => false,
    }
}

/// Quotes a collection name for use as a table identifier.
fn table_name(collection: &str) -> Result<String> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::storage(format!("invalid collection name: {:?}", collection)));
    }
    Ok(format!("\"{}\"", collection))
}

#[derive(Debug)]
pub struct SqliteConnection {
    pool: SqlitePool,
    table: String,
    version: u32,
    version_check_interval: Duration,
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn Transaction>> {
        let mut conn = self.pool.acquire().await?;
        // Writers take the write lock up front so a competing writer in
        // another process waits in the busy handler.
        let begin = match mode {
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
            TxMode::ReadOnly => "BEGIN",
        };
        sqlx::query(begin)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::transaction)?;
        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
            table: self.table.clone(),
            mode,
        }))
    }

    async fn invalidated(&self) -> Invalidation {
        let mut ticker = tokio::time::interval(self.version_check_interval);
        loop {
            ticker.tick().await;
            match sqlx::query_scalar::<_, i64>("PRAGMA user_version")
                .fetch_one(&self.pool)
                .await
            {
                Ok(found) if found > i64::from(self.version) => {
                    return Invalidation::VersionChange {
                        requested: u32::try_from(found).unwrap_or(u32::MAX),
                    };
                }
                Ok(_) => {}
                Err(sqlx::Error::PoolClosed) => {
                    return Invalidation::ConnectionLost("pool closed".to_string());
                }
                Err(e) => log::debug!("Schema version check failed: {}", e),
            }
        }
    }

    async fn close(&self) {
        log::info!("Closing database connection");
        self.pool.close().await;
    }
}

/// An open `BEGIN` on a pooled connection. Dropped without a commit, it
/// rolls back before the connection goes back to the pool.
struct SqliteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
    table: String,
    mode: TxMode,
}

impl SqliteTransaction {
    fn conn(&mut self) -> Result<&mut PoolConnection<Sqlite>> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::transaction("transaction already finished"))
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::storage("write attempted in a read-only transaction")),
        }
    }
}

fn decode(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn get(&mut self, key: &RecordKey) -> Result<Option<Value>> {
        let sql = format!("SELECT record FROM {} WHERE id = ?1", self.table);
        let query = sqlx::query_scalar::<_, String>(&sql);
        let query = match key {
            RecordKey::Int(n) => query.bind(*n),
            RecordKey::Text(s) => query.bind(s.clone()),
        };
        let raw = query.fetch_optional(&mut **self.conn()?).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn get_all(&mut self) -> Result<Vec<Value>> {
        let sql = format!("SELECT record FROM {}", self.table);
        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut **self.conn()?).await?;
        rows.iter().map(|raw| decode(raw)).collect()
    }

    async fn put(&mut self, key: &RecordKey, value: Value) -> Result<()> {
        self.check_writable()?;
        let sql = format!(
            "INSERT INTO {} (id, record) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            self.table
        );
        let record = serde_json::to_string(&value)?;
        let query = sqlx::query(&sql);
        let query = match key {
            RecordKey::Int(n) => query.bind(*n),
            RecordKey::Text(s) => query.bind(s.clone()),
        };
        query.bind(record).execute(&mut **self.conn()?).await?;
        Ok(())
    }

    async fn delete(&mut self, key: &RecordKey) -> Result<()> {
        self.check_writable()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
        let query = sqlx::query(&sql);
        let query = match key {
            RecordKey::Int(n) => query.bind(*n),
            RecordKey::Text(s) => query.bind(s.clone()),
        };
        let result = query.execute(&mut **self.conn()?).await?;
        if result.rows_affected() == 0 {
            log::debug!("Delete of absent key {}", key);
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::transaction("transaction already finished"))?;
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                log::warn!("Rollback after failed commit failed: {}", rollback);
            }
            return Err(StoreError::transaction(e));
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        log::warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            // Closing the raw connection discards the open transaction.
            Err(_) => drop(conn.detach()),
        }
    }
}
