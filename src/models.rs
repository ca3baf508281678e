use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

// One exchange within a thread: the user's query and the reply fragments
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatTurn {
    pub query: String,
    #[serde(default)] // Older records may have been written before a reply existed
    pub reply: Vec<String>,
}

impl ChatTurn {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), reply: Vec::new() }
    }

    pub fn with_reply(query: impl Into<String>, reply: Vec<String>) -> Self {
        Self { query: query.into(), reply }
    }
}

// Represents a persisted conversation thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub chat_title: String,
    #[serde(default)]
    pub convo: Vec<ChatTurn>,
    pub created_at: i64, // Milliseconds since epoch
    pub updated_at: i64, // Milliseconds since epoch, never below created_at
}

// A ChatRecord before the store has assigned it an id
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewChatRecord {
    pub chat_title: String,
    pub convo: Vec<ChatTurn>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NewChatRecord {
    /// Starts a thread with its first turn, stamped with the current time.
    pub fn new(chat_title: impl Into<String>, first_turn: ChatTurn) -> Self {
        let now = now_millis();
        Self {
            chat_title: chat_title.into(),
            convo: vec![first_turn],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn into_record(self, id: String) -> ChatRecord {
        ChatRecord {
            id,
            chat_title: self.chat_title,
            convo: self.convo,
            created_at: self.created_at,
            updated_at: self.updated_at.max(self.created_at),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// Legacy rows were keyed by an auto-incremented number, so their `id` field is a JSON number.
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}
