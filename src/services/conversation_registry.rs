//! Thread metadata and participant sets, plus per-thread serialization of
//! moderation actions.
//!
//! Status transitions for one conversation run under a dedicated async
//! mutex, so racing moderation calls cannot interleave a check with a
//! stale apply. The registry and the message store are the sole sources of
//! truth; everything derived (unread counts, `last_message_id`) is computed
//! from them.

use crate::error::{ChatError, ChatResult};
use crate::models::conversation::{
    Conversation, ConversationKind, ConversationStatus, ModerationAction, Participant,
};
use crate::models::Actor;
use crate::services::moderation::{ModerationEngine, Transition};
use chrono::Utc;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Result of a status update; `changed` is false for the no-op
/// self-transition case.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub conversation: Conversation,
    pub changed: bool,
}

#[derive(Default)]
pub struct ConversationRegistry {
    inner: RwLock<HashMap<Uuid, Conversation>>,
    // Per-thread moderation locks, created lazily.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation. At least two participants are required; a
    /// support conversation must carry exactly one designated support-agent
    /// participant (the flag is supplied by the identity collaborator).
    pub async fn create(
        &self,
        participants: Vec<Participant>,
        kind: ConversationKind,
        title: impl Into<String>,
    ) -> ChatResult<Conversation> {
        if participants.len() < 2 {
            return Err(ChatError::Validation(format!(
                "a conversation needs at least 2 participants, got {}",
                participants.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &participants {
            if !seen.insert(p.user_id) {
                return Err(ChatError::Validation(format!(
                    "duplicate participant {}",
                    p.user_id
                )));
            }
        }
        if kind == ConversationKind::Support {
            let agents = participants.iter().filter(|p| p.support_agent).count();
            if agents != 1 {
                return Err(ChatError::Validation(format!(
                    "a support conversation needs exactly one support agent, got {agents}"
                )));
            }
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            participants,
            title: title.into(),
            kind,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            last_message_id: None,
            metadata: Map::new(),
        };

        self.inner
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        tracing::info!(conversation_id = %conversation.id, ?kind, "conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, conversation_id: Uuid) -> ChatResult<Conversation> {
        self.inner
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))
    }

    /// Conversations the user participates in, most recently updated first.
    /// Deleted conversations stay out of listings.
    pub async fn list_for_user(&self, user_id: Uuid) -> Vec<Conversation> {
        let guard = self.inner.read().await;
        let mut out: Vec<Conversation> = guard
            .values()
            .filter(|c| c.status != ConversationStatus::Deleted)
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Applies a status transition, serialized per thread. Legality is
    /// delegated to the moderation engine; any actual transition requires
    /// admin capability. A self-transition succeeds as a no-op without an
    /// audit record.
    pub async fn update_status(
        &self,
        conversation_id: Uuid,
        new_status: ConversationStatus,
        actor: Actor,
        reason: Option<String>,
        engine: &ModerationEngine,
    ) -> ChatResult<StatusUpdate> {
        // Existence check before touching the lock map, so unknown ids
        // never leave an entry behind.
        self.get(conversation_id).await?;
        let lock = self.thread_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let current = self.get(conversation_id).await?;
        let transition = engine.check(current.status, new_status).map_err(|e| {
            tracing::warn!(
                conversation_id = %conversation_id,
                from = %current.status,
                to = %new_status,
                "illegal status transition rejected"
            );
            e
        })?;

        if transition == Transition::NoOp {
            return Ok(StatusUpdate {
                conversation: current,
                changed: false,
            });
        }
        if !actor.admin {
            return Err(ChatError::PermissionDenied(format!(
                "actor {} lacks admin capability to change conversation {conversation_id} status",
                actor.id
            )));
        }

        let updated = {
            let mut guard = self.inner.write().await;
            let conversation = guard
                .get_mut(&conversation_id)
                .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
            conversation.status = new_status;
            conversation.updated_at = Utc::now();
            conversation.clone()
        };

        engine
            .record(ModerationAction {
                conversation_id,
                actor_id: actor.id,
                from_status: current.status,
                to_status: new_status,
                occurred_at: updated.updated_at,
                reason,
            })
            .await;

        // DELETED is terminal; the thread needs no moderation lock anymore.
        if new_status == ConversationStatus::Deleted {
            self.locks.lock().await.remove(&conversation_id);
        }

        Ok(StatusUpdate {
            conversation: updated,
            changed: true,
        })
    }

    /// Updates the derived `last_message_id` pointer and bumps `updated_at`.
    pub async fn record_message(&self, conversation_id: Uuid, message_id: Uuid) -> ChatResult<()> {
        let mut guard = self.inner.write().await;
        let conversation = guard
            .get_mut(&conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.last_message_id = Some(message_id);
        conversation.updated_at = Utc::now();
        Ok(())
    }

    /// Re-derives the pointer after a tombstone, without touching
    /// `updated_at`.
    pub async fn set_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Option<Uuid>,
    ) -> ChatResult<()> {
        let mut guard = self.inner.write().await;
        let conversation = guard
            .get_mut(&conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.last_message_id = message_id;
        Ok(())
    }

    async fn thread_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn lock_entries(&self) -> usize {
        self.locks.lock().await.len()
    }
}
