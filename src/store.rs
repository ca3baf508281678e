use crate::config::StoreConfig;
use crate::engine::{Connection, Engine, OpenRequest, RecordKey, SqliteEngine, Transaction, TxMode};
use crate::error::{Result, StoreError};
use crate::gate::{Readiness, ReadySignal};
use crate::id::IdGenerator;
use crate::lifecycle::Lifecycle;
use crate::models::{now_millis, ChatRecord, ChatTurn, NewChatRecord};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default bound on how long an operation waits for the store to open.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(2000);

/// The chat record store.
///
/// Every operation first waits on the readiness gate (bounded by the
/// configured timeout), then runs in exactly one engine transaction.
pub struct ChatStore<E: Engine = SqliteEngine> {
    lifecycle: Lifecycle<E>,
    ids: IdGenerator,
    ready_timeout: Duration,
    // One fair lock per id with an update in flight, so appends land in call order.
    update_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// A caller's claim on an id's update lock.
///
/// Dropping it, even when the update future is cancelled, removes the map
/// entry once no other caller holds a claim.
struct UpdateSlot<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> UpdateSlot<'a> {
    fn enter(locks: &'a DashMap<String, Arc<Mutex<()>>>, id: &'a str) -> Self {
        let lock = locks.entry(id.to_string()).or_default().clone();
        Self { locks, id, lock }
    }
}

impl Drop for UpdateSlot<'_> {
    fn drop(&mut self) {
        // The map's handle plus this slot's.
        self.locks
            .remove_if(self.id, |_, lock| Arc::strong_count(lock) == 2);
    }
}

impl ChatStore<SqliteEngine> {
    /// Opens the SQLite store described by `config`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::open(config.engine(), config.open_request(), config.ready_timeout)
    }
}

impl<E: Engine> ChatStore<E> {
    /// Starts opening the store in the background and returns immediately.
    /// Operations issued before the open finishes wait for it.
    pub fn open(engine: E, request: OpenRequest, ready_timeout: Duration) -> Self {
        Self {
            lifecycle: Lifecycle::open(engine, request),
            ids: IdGenerator::new(),
            ready_timeout,
            update_locks: DashMap::new(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.lifecycle.gate().readiness()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    pub fn subscribe(&self) -> ReadySignal<E::Connection> {
        self.lifecycle.gate().subscribe()
    }

    /// Waits for the store to become ready, bounded by the configured timeout.
    pub async fn wait_ready(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// See [`Lifecycle::reopen`].
    pub fn reopen(&self) -> bool {
        self.lifecycle.reopen()
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    async fn connection(&self) -> Result<Arc<E::Connection>> {
        self.lifecycle.gate().await_ready(self.ready_timeout).await
    }

    /// Stores a new record under a freshly generated id and returns the id.
    pub async fn add_record(&self, new: NewChatRecord) -> Result<String> {
        let conn = self.connection().await?;
        let id = self.ids.next_id();
        let record = new.into_record(id.clone());

        let mut tx = conn.begin(TxMode::ReadWrite).await?;
        tx.put(&RecordKey::Text(id.clone()), serde_json::to_value(&record)?)
            .await?;
        tx.commit().await?;

        log::info!("Added chat record {} ({:?})", id, record.chat_title);
        Ok(id)
    }

    /// Looks a record up by id. Integer-looking ids also match legacy
    /// records stored under a numeric key.
    pub async fn get_record(&self, id: &str) -> Result<Option<ChatRecord>> {
        log::debug!("Fetching chat record {}", id);
        let conn = self.connection().await?;
        let mut tx = conn.begin(TxMode::ReadOnly).await?;
        let found = find(&mut *tx, id).await?;
        tx.commit().await?;
        found.map(|(_, value)| decode_record(value)).transpose()
    }

    /// Every stored record, in no particular order.
    pub async fn get_all_records(&self) -> Result<Vec<ChatRecord>> {
        log::debug!("Fetching all chat records");
        let conn = self.connection().await?;
        let mut tx = conn.begin(TxMode::ReadOnly).await?;
        let values = tx.get_all().await?;
        tx.commit().await?;

        let records = values
            .into_iter()
            .map(decode_record)
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Fetched {} chat records", records.len());
        Ok(records)
    }

    /// Appends `new_turns` to the record's conversation and returns the
    /// merged conversation.
    ///
    /// Read and write happen in one transaction. Calls for the same id are
    /// applied in the order they were first polled. An empty `new_turns`
    /// leaves the record untouched.
    pub async fn update_record(&self, id: &str, new_turns: Vec<ChatTurn>) -> Result<Vec<ChatTurn>> {
        let slot = UpdateSlot::enter(&self.update_locks, id);
        let _turn = slot.lock.lock().await;
        self.append_turns(id, new_turns).await
    }

    async fn append_turns(&self, id: &str, new_turns: Vec<ChatTurn>) -> Result<Vec<ChatTurn>> {
        let conn = self.connection().await?;
        let mut tx = conn.begin(TxMode::ReadWrite).await?;

        let (key, value) = find(&mut *tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut record = decode_record(value)?;
        if new_turns.is_empty() {
            log::debug!("No turns to append to chat record {}", id);
            return Ok(record.convo);
        }

        let appended = new_turns.len();
        record.convo.extend(new_turns);
        record.updated_at = now_millis().max(record.updated_at);
        tx.put(&key, serde_json::to_value(&record)?).await?;
        tx.commit().await?;

        log::info!("Appended {} turn(s) to chat record {}", appended, id);
        Ok(record.convo)
    }

    /// Removes the record if it exists. Deleting an absent id succeeds.
    pub async fn delete_record(&self, id: &str) -> Result<()> {
        let conn = self.connection().await?;
        let mut tx = conn.begin(TxMode::ReadWrite).await?;

        let existed = find(&mut *tx, id).await?.is_some();
        tx.delete(&RecordKey::from(id)).await?;
        if let Some(legacy) = RecordKey::legacy_numeric(id) {
            tx.delete(&legacy).await?;
        }
        tx.commit().await?;

        if existed {
            log::info!("Deleted chat record {}", id);
        } else {
            log::warn!("Attempted to delete non-existent chat record: {}", id);
        }
        Ok(())
    }
}

/// Exact-key lookup with the legacy numeric-key fallback.
async fn find(tx: &mut dyn Transaction, id: &str) -> Result<Option<(RecordKey, Value)>> {
    let key = RecordKey::from(id);
    if let Some(value) = tx.get(&key).await? {
        return Ok(Some((key, value)));
    }
    let Some(legacy) = RecordKey::legacy_numeric(id) else {
        return Ok(None);
    };
    Ok(tx.get(&legacy).await?.map(|value| (legacy, value)))
}

fn decode_record(value: Value) -> Result<ChatRecord> {
    Ok(serde_json::from_value(value)?)
}
