use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    Archived,
    Muted,
    Resolved,
    Deleted,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversationStatus::Active => "ACTIVE",
            ConversationStatus::Archived => "ARCHIVED",
            ConversationStatus::Muted => "MUTED",
            ConversationStatus::Resolved => "RESOLVED",
            ConversationStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Support,
    Group,
}

/// Conversation member. The `support_agent` capability flag comes from the
/// external identity collaborator; the core only checks it, never derives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    #[serde(default)]
    pub support_agent: bool,
}

impl Participant {
    pub fn member(user_id: Uuid) -> Self {
        Self {
            user_id,
            support_agent: false,
        }
    }

    pub fn agent(user_id: Uuid) -> Self {
        Self {
            user_id,
            support_agent: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub title: String,
    pub kind: ConversationKind,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Derived pointer to the newest non-deleted message, never an
    /// independent source of truth.
    pub last_message_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participant_ids(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.user_id).collect()
    }

    /// Everyone in the thread except the given sender.
    pub fn recipients_of(&self, sender_id: Uuid) -> Vec<Uuid> {
        self.participants
            .iter()
            .map(|p| p.user_id)
            .filter(|id| *id != sender_id)
            .collect()
    }
}

/// Append-only audit record of an executed moderation transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationAction {
    pub conversation_id: Uuid,
    pub actor_id: Uuid,
    pub from_status: ConversationStatus,
    pub to_status: ConversationStatus,
    pub occurred_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Per-viewer conversation statistics, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    /// Includes soft-deleted messages; tombstones stay in the count.
    pub total_messages: usize,
    pub sent_messages: usize,
    pub received_messages: usize,
    pub unread_count: usize,
    /// Mean gap between a message and the next one from a different
    /// sender. `None` until the thread has at least one exchange.
    pub average_response_ms: Option<i64>,
}
