// Commands the chat UI issues against the store. Each one logs its failure
// and hands the UI a printable message.

use crate::engine::Engine;
use crate::models::{ChatRecord, ChatTurn, NewChatRecord};
use crate::state::AppState;

const DEFAULT_TITLE: &str = "New Chat";
const MAX_TITLE_CHARS: usize = 60;

/// Lists all conversations, most recently updated first.
pub async fn list_conversations<E: Engine>(state: &AppState<E>) -> Result<Vec<ChatRecord>, String> {
    log::info!("[CMD] list_conversations");
    match state.store.get_all_records().await {
        Ok(mut records) => {
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(records)
        }
        Err(e) => {
            log::error!("[CMD] Failed to list conversations: {:?}", e);
            Err(format!("Failed to load conversations: {}", e))
        }
    }
}

/// Starts a new conversation from the user's first message.
pub async fn create_conversation<E: Engine>(
    state: &AppState<E>,
    first_query: String,
) -> Result<ChatRecord, String> {
    if first_query.trim().is_empty() {
        return Err("Message must not be empty".to_string());
    }
    let new = NewChatRecord::new(title_from_query(&first_query), ChatTurn::new(first_query));
    log::info!("[CMD] create_conversation {:?}", new.chat_title);

    match state.store.add_record(new.clone()).await {
        Ok(id) => Ok(new.into_record(id)),
        Err(e) => {
            log::error!("[CMD] Failed to create conversation: {:?}", e);
            Err(format!("Failed to create conversation: {}", e))
        }
    }
}

pub async fn get_conversation<E: Engine>(
    state: &AppState<E>,
    conversation_id: &str,
) -> Result<Option<ChatRecord>, String> {
    log::info!("[CMD] get_conversation {}", conversation_id);
    state.store.get_record(conversation_id).await.map_err(|e| {
        log::error!("[CMD] Failed to get conversation {}: {:?}", conversation_id, e);
        format!("Failed to load conversation: {}", e)
    })
}

/// Appends one turn to a conversation and returns the whole conversation.
/// `reply` holds whatever the reply generator produced, possibly nothing yet.
pub async fn send_message<E: Engine>(
    state: &AppState<E>,
    conversation_id: &str,
    query: String,
    reply: Vec<String>,
) -> Result<Vec<ChatTurn>, String> {
    if query.trim().is_empty() {
        return Err("Message must not be empty".to_string());
    }
    log::info!("[CMD] send_message to {}", conversation_id);

    state
        .store
        .update_record(conversation_id, vec![ChatTurn::with_reply(query, reply)])
        .await
        .map_err(|e| {
            log::error!("[CMD] Failed to save message to {}: {:?}", conversation_id, e);
            format!("Failed to save message: {}", e)
        })
}

pub async fn delete_conversation<E: Engine>(
    state: &AppState<E>,
    conversation_id: &str,
) -> Result<(), String> {
    log::warn!("[CMD] delete_conversation {}", conversation_id);
    state.store.delete_record(conversation_id).await.map_err(|e| {
        log::error!("[CMD] Failed to delete conversation {}: {:?}", conversation_id, e);
        format!("Failed to delete conversation: {}", e)
    })
}

/// First non-empty line of the message, trimmed and cut to a sidebar-friendly length.
pub fn title_from_query(query: &str) -> String {
    let line = query
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if line.chars().count() <= MAX_TITLE_CHARS {
        return line.to_string();
    }
    // Leave room for the ellipsis.
    let mut title: String = line.chars().take(MAX_TITLE_CHARS - 1).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}
