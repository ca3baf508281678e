use async_trait::async_trait;
use chatdb_lib::engine::memory::MemoryConnection;
use chatdb_lib::engine::sqlite::SqliteLocation;
use chatdb_lib::engine::Engine;
use futures::future::join_all;
use chatdb_lib::error::Result;
use chatdb_lib::{
    ChatStore, ChatTurn, MemoryEngine, NewChatRecord, OpenRequest, Readiness, StoreConfig, StoreError,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;

fn hello() -> NewChatRecord {
    NewChatRecord {
        chat_title: "Hello".to_string(),
        convo: vec![ChatTurn::new("Hi")],
        created_at: 1000,
        updated_at: 1000,
    }
}

/// Opens a memory database after a delay.
struct SlowEngine {
    inner: MemoryEngine,
    delay: Duration,
}

#[async_trait]
impl Engine for SlowEngine {
    type Connection = MemoryConnection;

    async fn open(&self, request: &OpenRequest) -> Result<Arc<MemoryConnection>> {
        tokio::time::sleep(self.delay).await;
        self.inner.open(request).await
    }
}

/// Never finishes opening.
struct StuckEngine;

#[async_trait]
impl Engine for StuckEngine {
    type Connection = MemoryConnection;

    async fn open(&self, _request: &OpenRequest) -> Result<Arc<MemoryConnection>> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_operations_issued_before_open_wait_for_it() {
    let engine = SlowEngine {
        inner: MemoryEngine::new(),
        delay: Duration::from_millis(500),
    };
    let store = ChatStore::open(engine, OpenRequest::new("ChatDB", "Chats"), Duration::from_secs(2));
    assert_eq!(store.readiness(), Readiness::Opening);
    assert!(!store.is_ready());

    let id = store.add_record(hello()).await.unwrap();
    assert!(store.is_ready());
    assert!(store.get_record(&id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_operations_fail_not_ready_after_timeout() {
    let store = ChatStore::open(StuckEngine, OpenRequest::new("ChatDB", "Chats"), Duration::from_millis(2000));

    let started = tokio::time::Instant::now();
    let err = store.get_all_records().await.unwrap_err();
    assert!(matches!(err, StoreError::NotReady(_)));
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(store.readiness(), Readiness::Opening);
}

#[tokio::test]
async fn test_operations_after_close_fail_immediately() {
    let store = ChatStore::open(MemoryEngine::new(), OpenRequest::new("ChatDB", "Chats"), Duration::from_secs(60));
    store.wait_ready().await.unwrap();
    store.close().await;

    let attempt = tokio::time::timeout(Duration::from_secs(1), store.add_record(hello())).await;
    let err = attempt.expect("should not wait for readiness").unwrap_err();
    assert!(matches!(err, StoreError::NotReady(_)));
    assert!(!store.reopen());
}

#[tokio::test]
async fn test_competing_upgrade_flips_readiness() {
    let engine = MemoryEngine::new();
    let store = ChatStore::open(engine.clone(), OpenRequest::new("ChatDB", "Chats"), Duration::from_millis(200));
    let mut signal = store.subscribe();
    let id = store.add_record(hello()).await.unwrap();

    engine.request_upgrade("ChatDB", 2).await;
    while signal.current() != Readiness::Closed {
        signal.changed().await.unwrap();
    }
    assert!(!store.is_ready());

    let err = store.get_record(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotReady(_)));
}

#[tokio::test]
async fn test_stores_on_one_engine_share_records() {
    let engine = MemoryEngine::new();
    let store = ChatStore::open(engine.clone(), OpenRequest::new("ChatDB", "Chats"), Duration::from_secs(2));
    let id = store.add_record(hello()).await.unwrap();

    // A second store opened on the same collection sees the same records.
    let other = ChatStore::open(engine, OpenRequest::new("ChatDB", "Chats"), Duration::from_secs(2));
    assert!(other.get_record(&id).await.unwrap().is_some());
    other.close().await;

    assert!(!store.reopen());
    assert_eq!(store.get_all_records().await.unwrap().len(), 1);
}

fn file_config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        location: SqliteLocation::Directory(dir.to_path_buf()),
        version_check_interval: Duration::from_millis(20),
        ready_timeout: Duration::from_millis(500),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn test_sqlite_file_persists_across_opens() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let store = ChatStore::from_config(&config);
    let id = store.add_record(hello()).await.unwrap();
    store
        .update_record(&id, vec![ChatTurn::with_reply("More", vec!["Sure".to_string()])])
        .await
        .unwrap();
    store.close().await;
    assert!(dir.path().join("ChatDB.sqlite").exists());

    let store = ChatStore::from_config(&config);
    let record = store.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.chat_title, "Hello");
    assert_eq!(record.convo.len(), 2);
    assert_eq!(record.convo[1].reply, vec!["Sure".to_string()]);
    store.close().await;
}

#[tokio::test]
async fn test_sqlite_legacy_integer_keys() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let store = ChatStore::from_config(&config);
    store.wait_ready().await.unwrap();
    store.close().await;

    let url = format!("sqlite://{}", dir.path().join("ChatDB.sqlite").display());
    let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
    sqlx::query("INSERT INTO \"Chats\" (id, record) VALUES (?1, ?2)")
        .bind(7_i64)
        .bind(r#"{"id":7,"chatTitle":"Legacy","convo":[{"query":"old","reply":[]}],"createdAt":5,"updatedAt":5}"#)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let store = ChatStore::from_config(&config);
    let record = store.get_record("7").await.unwrap().unwrap();
    assert_eq!(record.id, "7");
    assert_eq!(record.chat_title, "Legacy");

    let convo = store.update_record("7", vec![ChatTurn::new("new")]).await.unwrap();
    assert_eq!(convo.len(), 2);
    assert_eq!(store.get_all_records().await.unwrap().len(), 1);

    store.delete_record("7").await.unwrap();
    assert!(store.get_record("7").await.unwrap().is_none());
    store.close().await;
}

#[tokio::test]
async fn test_sqlite_external_schema_upgrade_invalidates_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let store = ChatStore::from_config(&config);
    let mut signal = store.subscribe();
    store.add_record(hello()).await.unwrap();

    let url = format!("sqlite://{}", dir.path().join("ChatDB.sqlite").display());
    let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
    sqlx::query("PRAGMA user_version = 2").execute(&pool).await.unwrap();
    pool.close().await;

    while signal.current() != Readiness::Closed {
        signal.changed().await.unwrap();
    }

    // The file now carries a schema this store does not understand.
    assert!(store.reopen());
    let err = store.get_all_records().await.unwrap_err();
    assert!(matches!(err, StoreError::NotReady(_)));
    assert_eq!(store.readiness(), Readiness::Closed);
}

#[tokio::test]
async fn test_sqlite_writers_from_two_stores_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        ready_timeout: Duration::from_secs(5),
        ..file_config(dir.path())
    };

    let first = ChatStore::from_config(&config);
    let id = first.add_record(hello()).await.unwrap();
    let second = ChatStore::from_config(&config);
    second.wait_ready().await.unwrap();

    let updates = (0..20).map(|n| {
        let store = if n % 2 == 0 { &first } else { &second };
        let id = id.clone();
        async move {
            store
                .update_record(&id, vec![ChatTurn::new(format!("turn {}", n))])
                .await
        }
    });
    for result in join_all(updates).await {
        result.unwrap();
    }

    let record = first.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.convo.len(), 21);
    let queries: std::collections::HashSet<String> = record.convo.into_iter().map(|t| t.query).collect();
    assert_eq!(queries.len(), 21);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_sqlite_blocked_open_waits_for_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("ChatDB.sqlite").display());
    let blocker = SqlitePoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    let mut held = blocker.acquire().await.unwrap();
    sqlx::query("BEGIN EXCLUSIVE").execute(&mut *held).await.unwrap();

    let config = StoreConfig {
        busy_timeout: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(5),
        ..file_config(dir.path())
    };
    let store = ChatStore::from_config(&config);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.readiness(), Readiness::Opening);

    sqlx::query("COMMIT").execute(&mut *held).await.unwrap();
    drop(held);
    blocker.close().await;

    store.wait_ready().await.unwrap();
    let id = store.add_record(hello()).await.unwrap();
    assert!(store.get_record(&id).await.unwrap().is_some());
    store.close().await;
}
