//! Readiness gate.
//!
//! The lifecycle publishes the connection through a `watch` channel. A
//! `Ready` state always carries the connection itself, so a caller that sees
//! the store as ready also holds a usable handle.

use crate::error::{Result, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Externally visible readiness of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Closed,
    Opening,
    Ready,
}

enum Slot<C> {
    Closed,
    Opening,
    Ready(Arc<C>),
    // Terminal: the store was torn down.
    Shutdown,
}

impl<C> Slot<C> {
    fn readiness(&self) -> Readiness {
        match self {
            Slot::Closed | Slot::Shutdown => Readiness::Closed,
            Slot::Opening => Readiness::Opening,
            Slot::Ready(_) => Readiness::Ready,
        }
    }
}

pub struct ReadinessGate<C> {
    slot: watch::Sender<Slot<C>>,
}

impl<C> Default for ReadinessGate<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ReadinessGate<C> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Slot::Closed);
        Self { slot }
    }

    pub fn readiness(&self) -> Readiness {
        self.slot.borrow().readiness()
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Shutdown)
    }

    pub fn subscribe(&self) -> ReadySignal<C> {
        ReadySignal {
            rx: self.slot.subscribe(),
        }
    }

    /// Closed -> Opening. Returns false if the gate was not closed.
    pub(crate) fn begin_opening(&self) -> bool {
        self.slot.send_if_modified(|slot| match slot {
            Slot::Closed => {
                *slot = Slot::Opening;
                true
            }
            _ => false,
        })
    }

    /// Opening -> Ready. Returns false if the gate moved on meanwhile
    /// (for example it was shut down while the open was in flight).
    pub(crate) fn set_ready(&self, conn: Arc<C>) -> bool {
        self.slot.send_if_modified(|slot| match slot {
            Slot::Opening => {
                *slot = Slot::Ready(conn);
                true
            }
            _ => false,
        })
    }

    /// Opening -> Closed after a failed open.
    pub(crate) fn open_failed(&self) {
        self.slot.send_if_modified(|slot| match slot {
            Slot::Opening => {
                *slot = Slot::Closed;
                true
            }
            _ => false,
        });
    }

    /// Ready(conn) -> Closed, only if `conn` is still the published
    /// connection. Returns whether the gate changed.
    pub(crate) fn invalidate(&self, conn: &Arc<C>) -> bool {
        self.slot.send_if_modified(|slot| match slot {
            Slot::Ready(current) if Arc::ptr_eq(current, conn) => {
                *slot = Slot::Closed;
                true
            }
            _ => false,
        })
    }

    /// Moves to the terminal state, handing back the connection if one was live.
    pub(crate) fn shutdown(&self) -> Option<Arc<C>> {
        match self.slot.send_replace(Slot::Shutdown) {
            Slot::Ready(conn) => Some(conn),
            _ => None,
        }
    }

    /// Waits until the store is ready and returns the live connection.
    ///
    /// Fails with [`StoreError::NotReady`] once `timeout` elapses, or right
    /// away if the store has been shut down.
    pub async fn await_ready(&self, timeout: Duration) -> Result<Arc<C>> {
        self.subscribe().ready(timeout).await
    }
}

/// A subscription to readiness changes.
pub struct ReadySignal<C> {
    rx: watch::Receiver<Slot<C>>,
}

impl<C> ReadySignal<C> {
    pub fn current(&self) -> Readiness {
        self.rx.borrow().readiness()
    }

    /// Waits for the next readiness change and returns the new value.
    /// Returns `None` once the gate itself is gone.
    pub async fn changed(&mut self) -> Option<Readiness> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().readiness())
    }

    pub async fn ready(&mut self, timeout: Duration) -> Result<Arc<C>> {
        let wait = self
            .rx
            .wait_for(|slot| matches!(slot, Slot::Ready(_) | Slot::Shutdown));
        let slot = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return Err(StoreError::NotReady("store dropped".to_string())),
            Err(_) => {
                return Err(StoreError::NotReady(format!(
                    "not ready after {} ms",
                    timeout.as_millis()
                )))
            }
        };
        match &*slot {
            Slot::Ready(conn) => Ok(conn.clone()),
            _ => Err(StoreError::NotReady("store is closed".to_string())),
        }
    }
}
