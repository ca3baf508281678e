use crate::engine::{Engine, SqliteEngine};
use crate::store::ChatStore;
use std::sync::Arc;

// Application state handed to every command
pub struct AppState<E: Engine = SqliteEngine> {
    // The store serializes its own transactions, so it is shared without an outer lock.
    pub store: Arc<ChatStore<E>>,
}

impl<E: Engine> AppState<E> {
    pub fn new(store: ChatStore<E>) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

// Allow cloning for background tasks
impl<E: Engine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}
