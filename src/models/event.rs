use crate::models::conversation::ConversationStatus;
use crate::models::message::MessageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "message.delivered")]
    MessageDelivered,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "conversation.status")]
    ConversationStatus,
}

/// Envelope used on both sides of the channel layer: the transport
/// collaborator hands these in, and subscribers receive the normalized
/// rebroadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub conversation_id: Uuid,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, conversation_id: Uuid, payload: JsonValue) -> Self {
        Self {
            kind,
            conversation_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of `message.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreated {
    pub sender_id: Uuid,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

/// Payload of `message.delivered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelivered {
    pub message_id: Uuid,
    pub recipient_id: Uuid,
}

/// Payload of `message.read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRead {
    pub recipient_id: Uuid,
    pub up_to: DateTime<Utc>,
}

/// Payload of `conversation.status`. Actor capability flags are trusted
/// from the boundary, same as everywhere else in the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChanged {
    pub status: ConversationStatus,
    pub actor_id: Uuid,
    #[serde(default)]
    pub actor_admin: bool,
    #[serde(default)]
    pub reason: Option<String>,
}
