//! Conversation status state machine and its append-only audit log.
//!
//! DELETED is terminal. Self-transitions are permitted no-ops and leave no
//! audit record. Everything else follows the transition table in
//! `transition_allowed`.

use crate::error::{ChatError, ChatResult};
use crate::models::conversation::{ConversationStatus, ModerationAction};
use crate::models::Actor;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outcome of a legality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same-status transition; succeed without doing anything.
    NoOp,
    /// Legal move; the caller should apply it and record the action.
    Apply,
}

#[derive(Default)]
pub struct ModerationEngine {
    log: RwLock<Vec<ModerationAction>>,
}

impl ModerationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition_allowed(from: ConversationStatus, to: ConversationStatus) -> bool {
        use ConversationStatus::*;
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Active, Muted)
                | (Muted, Active)
                | (Active, Archived)
                | (Active, Resolved)
                | (Muted, Archived)
                | (Muted, Resolved)
                | (Resolved, Active)
                | (Active, Deleted)
                | (Archived, Deleted)
                | (Muted, Deleted)
                | (Resolved, Deleted)
        )
    }

    pub fn check(
        &self,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> ChatResult<Transition> {
        if from == to {
            return Ok(Transition::NoOp);
        }
        if Self::transition_allowed(from, to) {
            Ok(Transition::Apply)
        } else {
            Err(ChatError::InvalidStateTransition { from, to })
        }
    }

    /// Appends an executed transition to the audit log. The log is
    /// append-only; nothing ever mutates or removes entries.
    pub async fn record(&self, action: ModerationAction) {
        tracing::info!(
            conversation_id = %action.conversation_id,
            actor_id = %action.actor_id,
            from = %action.from_status,
            to = %action.to_status,
            "moderation transition recorded"
        );
        self.log.write().await.push(action);
    }

    /// The audit trail for a conversation, admin-capability actors only.
    /// Persists even for DELETED conversations.
    pub async fn audit_log(
        &self,
        conversation_id: Uuid,
        actor: Actor,
    ) -> ChatResult<Vec<ModerationAction>> {
        if !actor.admin {
            return Err(ChatError::PermissionDenied(format!(
                "actor {} may not read the audit log of conversation {conversation_id}",
                actor.id
            )));
        }
        let guard = self.log.read().await;
        Ok(guard
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
