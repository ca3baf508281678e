use crate::engine::{Connection, Engine, OpenRequest};
use crate::gate::ReadinessGate;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Owns the database connection for its whole life.
///
/// Opening runs in the background and publishes the connection through the
/// [`ReadinessGate`]. Once ready, the same task watches the connection; when
/// it is invalidated from outside the gate drops back to closed and the
/// connection is closed. [`Lifecycle::close`] is terminal.
pub struct Lifecycle<E: Engine> {
    engine: Arc<E>,
    request: OpenRequest,
    gate: Arc<ReadinessGate<E::Connection>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Engine> Lifecycle<E> {
    /// Starts opening `request` on `engine`. Must be called inside a tokio runtime.
    pub fn open(engine: E, request: OpenRequest) -> Self {
        let lifecycle = Self {
            engine: Arc::new(engine),
            request,
            gate: Arc::new(ReadinessGate::new()),
            task: Mutex::new(None),
        };
        lifecycle.start();
        lifecycle
    }

    pub fn gate(&self) -> &ReadinessGate<E::Connection> {
        &self.gate
    }

    /// Opens again after an invalidation or a failed open.
    ///
    /// Returns false when there is nothing to do: the store is already
    /// opening or ready, or it has been closed for good.
    pub fn reopen(&self) -> bool {
        self.start()
    }

    fn start(&self) -> bool {
        if !self.gate.begin_opening() {
            return false;
        }
        log::info!(
            "Opening database {} (collection {}, version {})",
            self.request.database,
            self.request.collection,
            self.request.version
        );

        let engine = self.engine.clone();
        let request = self.request.clone();
        let gate = self.gate.clone();
        let handle = tokio::spawn(async move {
            let conn = match engine.open(&request).await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Database {} open error: {}", request.database, e);
                    gate.open_failed();
                    return;
                }
            };
            if !gate.set_ready(conn.clone()) {
                // Torn down while the open was in flight.
                conn.close().await;
                return;
            }
            log::info!("Database {} ready", request.database);

            let reason = conn.invalidated().await;
            if gate.invalidate(&conn) {
                log::warn!("Database {} closed due to {}", request.database, reason);
                conn.close().await;
            }
        });

        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Closes the connection. No operation can be issued afterwards.
    pub async fn close(&self) {
        let conn = self.gate.shutdown();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(conn) = conn {
            conn.close().await;
            log::info!("Database {} closed", self.request.database);
        }
    }
}

impl<E: Engine> Drop for Lifecycle<E> {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::error::StoreError;
    use crate::gate::Readiness;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_open_becomes_ready() {
        let lifecycle = Lifecycle::open(MemoryEngine::new(), OpenRequest::new("ChatDB", "Chats"));
        lifecycle.gate().await_ready(TIMEOUT).await.unwrap();
        assert_eq!(lifecycle.gate().readiness(), Readiness::Ready);
        assert!(!lifecycle.reopen());
    }

    #[tokio::test]
    async fn test_version_change_closes_and_reopen_is_refused_by_engine() {
        let engine = MemoryEngine::new();
        let lifecycle = Lifecycle::open(engine.clone(), OpenRequest::new("ChatDB", "Chats"));
        let mut signal = lifecycle.gate().subscribe();
        lifecycle.gate().await_ready(TIMEOUT).await.unwrap();

        engine.request_upgrade("ChatDB", 2).await;
        while signal.current() != Readiness::Closed {
            signal.changed().await.unwrap();
        }

        // The database now has a newer schema than this store understands.
        assert!(lifecycle.reopen());
        while signal.current() != Readiness::Closed {
            signal.changed().await.unwrap();
        }
        let err = lifecycle
            .gate()
            .await_ready(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let lifecycle = Lifecycle::open(MemoryEngine::new(), OpenRequest::new("ChatDB", "Chats"));
        lifecycle.gate().await_ready(TIMEOUT).await.unwrap();

        lifecycle.close().await;
        lifecycle.close().await;
        assert_eq!(lifecycle.gate().readiness(), Readiness::Closed);
        assert!(!lifecycle.reopen());
        assert!(lifecycle.gate().await_ready(TIMEOUT).await.is_err());
    }
}
