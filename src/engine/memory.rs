//! Process-local engine.
//!
//! Each named database lives behind one async mutex, so transactions run one
//! at a time. A transaction works on a staged copy of its collection and
//! swaps it in on commit. Nothing survives the process.

use super::{Connection, Engine, Invalidation, OpenRequest, RecordKey, Transaction, TxMode};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

type Collection = BTreeMap<RecordKey, Value>;

#[derive(Debug, Default)]
struct Data {
    version: u32,
    collections: HashMap<String, Collection>,
}

#[derive(Debug)]
struct MemoryDatabase {
    data: Arc<AsyncMutex<Data>>,
    // Latest schema version requested by any opener.
    versions: watch::Sender<u32>,
}

impl MemoryDatabase {
    fn new() -> Self {
        let (versions, _) = watch::channel(0);
        Self {
            data: Arc::new(AsyncMutex::new(Data::default())),
            versions,
        }
    }
}

/// In-memory [`Engine`]. Cloning shares the same databases.
#[derive(Clone, Debug, Default)]
pub struct MemoryEngine {
    databases: Arc<Mutex<HashMap<String, Arc<MemoryDatabase>>>>,
    quota: Option<usize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits every collection to `max_records`; puts beyond it fail.
    pub fn with_quota(max_records: usize) -> Self {
        Self {
            quota: Some(max_records),
            ..Self::default()
        }
    }

    fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let mut databases = self
            .databases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new()))
            .clone()
    }

    /// Moves `database` to `version` the way a competing opener with a newer
    /// schema would. Live connections at an older version are invalidated.
    pub async fn request_upgrade(&self, database: &str, version: u32) {
        let db = self.database(database);
        let mut data = db.data.lock().await;
        if version > data.version {
            log::info!("Upgrading in-memory database {} from {} to {}", database, data.version, version);
            data.version = version;
            db.versions.send_replace(version);
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    type Connection = MemoryConnection;

    async fn open(&self, request: &OpenRequest) -> Result<Arc<MemoryConnection>> {
        let db = self.database(&request.database);
        {
            let mut data = db.data.lock().await;
            if data.version > request.version {
                return Err(StoreError::storage(format!(
                    "database {} is at version {}, newer than requested {}",
                    request.database, data.version, request.version
                )));
            }
            if data.version < request.version {
                data.version = request.version;
                db.versions.send_replace(request.version);
            }
            if !data.collections.contains_key(&request.collection) {
                log::info!("Creating in-memory collection {}/{}", request.database, request.collection);
                data.collections.insert(request.collection.clone(), Collection::new());
            }
        }

        Ok(Arc::new(MemoryConnection {
            versions: db.versions.subscribe(),
            db,
            collection: request.collection.clone(),
            version: request.version,
            quota: self.quota,
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    versions: watch::Receiver<u32>,
    collection: String,
    version: u32,
    quota: Option<usize>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn Transaction>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::storage("connection is closed"));
        }
        let guard = self.db.data.clone().lock_owned().await;
        if guard.version != self.version {
            return Err(StoreError::storage(format!(
                "connection opened at version {} but database is at {}",
                self.version, guard.version
            )));
        }
        let staged = guard
            .collections
            .get(&self.collection)
            .cloned()
            .ok_or_else(|| StoreError::storage(format!("no collection named {}", self.collection)))?;

        Ok(Box::new(MemoryTransaction {
            guard,
            collection: self.collection.clone(),
            staged,
            mode,
            quota: self.quota,
        }))
    }

    async fn invalidated(&self) -> Invalidation {
        let mut versions = self.versions.clone();
        let version = self.version;
        // Bound first so the watch borrow ends before `versions` is dropped.
        #[allow(clippy::let_and_return)]
        let reason = match versions.wait_for(|requested| *requested > version).await {
            Ok(requested) => Invalidation::VersionChange { requested: *requested },
            Err(_) => Invalidation::ConnectionLost("database dropped".to_string()),
        };
        reason
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Data>,
    collection: String,
    staged: Collection,
    mode: TxMode,
    quota: Option<usize>,
}

impl MemoryTransaction {
    fn check_writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::storage("write attempted in a read-only transaction")),
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &RecordKey) -> Result<Option<Value>> {
        Ok(self.staged.get(key).cloned())
    }

    async fn get_all(&mut self) -> Result<Vec<Value>> {
        Ok(self.staged.values().cloned().collect())
    }

    async fn put(&mut self, key: &RecordKey, value: Value) -> Result<()> {
        self.check_writable()?;
        if let Some(quota) = self.quota {
            if !self.staged.contains_key(key) && self.staged.len() >= quota {
                return Err(StoreError::storage(format!(
                    "quota of {} records exceeded in {}",
                    quota, self.collection
                )));
            }
        }
        self.staged.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&mut self, key: &RecordKey) -> Result<()> {
        self.check_writable()?;
        self.staged.remove(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, collection, staged, mode, .. } = *self;
        if mode == TxMode::ReadWrite {
            guard.collections.insert(collection, staged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> OpenRequest {
        OpenRequest::new("ChatDB", "Chats")
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let engine = MemoryEngine::new();
        let conn = engine.open(&request()).await.unwrap();

        let mut tx = conn.begin(TxMode::ReadWrite).await.unwrap();
        tx.put(&RecordKey::from("a"), json!({"id": "a"})).await.unwrap();
        drop(tx);

        let mut tx = conn.begin(TxMode::ReadOnly).await.unwrap();
        assert!(tx.get(&RecordKey::from("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_transaction_rejects_writes() {
        let engine = MemoryEngine::new();
        let conn = engine.open(&request()).await.unwrap();

        let mut tx = conn.begin(TxMode::ReadOnly).await.unwrap();
        let err = tx.put(&RecordKey::from("a"), json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn test_quota_rejects_new_keys_but_allows_overwrite() {
        let engine = MemoryEngine::with_quota(1);
        let conn = engine.open(&request()).await.unwrap();

        let mut tx = conn.begin(TxMode::ReadWrite).await.unwrap();
        tx.put(&RecordKey::from("a"), json!(1)).await.unwrap();
        tx.put(&RecordKey::from("a"), json!(2)).await.unwrap();
        assert!(tx.put(&RecordKey::from("b"), json!(3)).await.is_err());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_invalidates_and_blocks_older_opens() {
        let engine = MemoryEngine::new();
        let conn = engine.open(&request()).await.unwrap();

        engine.request_upgrade("ChatDB", 2).await;
        assert_eq!(conn.invalidated().await, Invalidation::VersionChange { requested: 2 });
        assert!(conn.begin(TxMode::ReadOnly).await.is_err());
        assert!(engine.open(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_transactions() {
        let engine = MemoryEngine::new();
        let conn = engine.open(&request()).await.unwrap();
        conn.close().await;
        assert!(conn.begin(TxMode::ReadOnly).await.is_err());
    }
}
