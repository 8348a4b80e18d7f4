use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Absent for group threads.
    pub receiver_id: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-delete tombstone. Retained for audit, never physically purged.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Must reference a message in the same thread.
    pub reply_to_id: Option<Uuid>,
    pub version: i32,
    /// At most one reaction per (user, emoji) pair.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
    pub reacted_at: DateTime<Utc>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Deterministic total order over the messages of a thread. The id breaks
/// ties between equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Input for a message append. `created_at` is advisory (stamped from the
/// transport envelope when present); appends are linearized by arrival at
/// the store regardless.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: Option<DateTime<Utc>>,
    pub reply_to_id: Option<Uuid>,
    pub metadata: Map<String, JsonValue>,
}

impl NewMessage {
    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            receiver_id: None,
            content: content.into(),
            kind: MessageKind::Text,
            created_at: None,
            reply_to_id: None,
            metadata: Map::new(),
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn reply_to(mut self, message_id: Uuid) -> Self {
        self.reply_to_id = Some(message_id);
        self
    }
}

/// One page of a descending `(created_at, id)` listing. The cursor is
/// opaque; feeding it back resumes the sequence exactly where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}
