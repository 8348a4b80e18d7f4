//! Wiring and cross-component operations.
//!
//! `ChatCore` owns the store, registry, tracker, moderation engine, channel
//! manager, and gateway client, and exposes the operations that touch more
//! than one of them. The store and the registry remain the sole sources of
//! truth; this layer only coordinates.

use crate::channel::{ChannelManager, Reconnection, SubscriberId, SubscriptionHandle};
use crate::config::{Config, MAX_PAGE_SIZE};
use crate::error::{ChatError, ChatResult};
use crate::models::conversation::{
    Conversation, ConversationKind, ConversationStats, ConversationStatus, ModerationAction,
    Participant,
};
use crate::models::event::{
    EventEnvelope, EventKind, MessageCreated, MessageDelivered, MessageRead, StatusChanged,
};
use crate::models::message::{Message, MessagePage, NewMessage};
use crate::models::Actor;
use crate::services::conversation_registry::ConversationRegistry;
use crate::services::delivery_tracker::{DeliveryReceipt, DeliveryTracker};
use crate::services::gateway::{
    ApiGatewayClient, NoopBackend, Operation, PersistenceBackend, PersistenceRequest,
};
use crate::services::message_store::MessageStore;
use crate::services::moderation::ModerationEngine;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub struct ChatCore {
    config: Config,
    store: MessageStore,
    registry: ConversationRegistry,
    tracker: DeliveryTracker,
    moderation: ModerationEngine,
    channels: ChannelManager,
    gateway: ApiGatewayClient,
}

impl ChatCore {
    pub fn new(config: Config, backend: Arc<dyn PersistenceBackend>) -> Self {
        let channels = ChannelManager::new(config.replay_capacity, config.replay_window);
        let gateway = ApiGatewayClient::new(backend, config.retry.clone());
        Self {
            config,
            store: MessageStore::new(),
            registry: ConversationRegistry::new(),
            tracker: DeliveryTracker::new(),
            moderation: ModerationEngine::new(),
            channels,
            gateway,
        }
    }

    /// Core without a persistence backend, for tests and transport-less
    /// embedding.
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Arc::new(NoopBackend))
    }

    // ---- conversations ----

    pub async fn create_conversation(
        &self,
        participants: Vec<Participant>,
        kind: ConversationKind,
        title: impl Into<String>,
    ) -> ChatResult<Conversation> {
        let conversation = self.registry.create(participants, kind, title).await?;
        self.persist(
            PersistenceRequest::new(
                Operation::CreateConversation,
                serde_json::to_value(&conversation).unwrap_or_default(),
            )
            .with_key(conversation.id.to_string()),
            conversation.id,
        )
        .await?;
        Ok(conversation)
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> ChatResult<Conversation> {
        self.registry.get(conversation_id).await
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> Vec<Conversation> {
        self.registry.list_for_user(user_id).await
    }

    /// Computed on demand, never denormalized.
    pub async fn unread_count(&self, conversation_id: Uuid, viewer_id: Uuid) -> ChatResult<usize> {
        self.registry.get(conversation_id).await?;
        let marker = self.tracker.last_read(conversation_id, viewer_id).await;
        Ok(self
            .store
            .count_unread(conversation_id, viewer_id, marker)
            .await)
    }

    pub async fn conversation_stats(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> ChatResult<ConversationStats> {
        let (total_messages, sent_messages, received_messages) =
            self.store.tally(conversation_id, viewer_id).await;
        let unread_count = self.unread_count(conversation_id, viewer_id).await?;
        let average_response_ms = self.store.average_response_ms(conversation_id).await;
        Ok(ConversationStats {
            total_messages,
            sent_messages,
            received_messages,
            unread_count,
            average_response_ms,
        })
    }

    // ---- messages ----

    /// Appends a message, initializes receipts, updates the derived
    /// conversation fields, persists, and fans the event out.
    pub async fn send_message(&self, new: NewMessage) -> ChatResult<Message> {
        let conversation = self.registry.get(new.conversation_id).await?;
        if conversation.status == ConversationStatus::Deleted {
            return Err(ChatError::Validation(format!(
                "conversation {} is deleted",
                conversation.id
            )));
        }

        let message = self.store.append(new, &conversation).await?;
        let recipients = conversation.recipients_of(message.sender_id);
        self.tracker.init_receipts(message.id, &recipients).await;
        self.registry
            .record_message(conversation.id, message.id)
            .await?;

        self.persist(
            PersistenceRequest::new(
                Operation::CreateMessage,
                serde_json::to_value(&message).unwrap_or_default(),
            )
            .with_key(message.id.to_string()),
            conversation.id,
        )
        .await?;

        let envelope = EventEnvelope::new(
            EventKind::MessageCreated,
            conversation.id,
            serde_json::to_value(&message).unwrap_or_default(),
        );
        self.channels
            .dispatch(&conversation.participant_ids(), &envelope)
            .await;

        Ok(message)
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> ChatResult<MessagePage> {
        self.registry.get(conversation_id).await?;
        let limit = limit.unwrap_or(self.config.page_size).min(MAX_PAGE_SIZE);
        self.store.list(conversation_id, cursor, limit).await
    }

    pub async fn edit_message(
        &self,
        message_id: Uuid,
        actor: Actor,
        content: String,
    ) -> ChatResult<Message> {
        let message = self.store.edit(message_id, actor, content).await?;
        self.persist(
            PersistenceRequest::new(
                Operation::UpdateMessage,
                serde_json::to_value(&message).unwrap_or_default(),
            )
            .with_key(format!("{}:{}", message.id, message.version)),
            message.conversation_id,
        )
        .await?;
        Ok(message)
    }

    /// Tombstones the message and re-derives the conversation's
    /// `last_message_id` when the tail was deleted.
    pub async fn soft_delete_message(&self, message_id: Uuid, actor: Actor) -> ChatResult<Message> {
        let message = self.store.soft_delete(message_id, actor).await?;
        let conversation = self.registry.get(message.conversation_id).await?;
        if conversation.last_message_id == Some(message.id) {
            let latest = self.store.latest_visible(conversation.id).await;
            self.registry
                .set_last_message(conversation.id, latest.map(|m| m.id))
                .await?;
        }
        self.persist(
            PersistenceRequest::new(
                Operation::DeleteMessage,
                json!({ "message_id": message.id }),
            )
            .with_key(message.id.to_string()),
            conversation.id,
        )
        .await?;
        Ok(message)
    }

    /// Participant-only; one reaction per (user, emoji) pair, repeat calls
    /// are no-ops.
    pub async fn add_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<Message> {
        let message = self.store.get(message_id).await?;
        let conversation = self.registry.get(message.conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(ChatError::PermissionDenied(format!(
                "user {user_id} is not a participant of conversation {}",
                conversation.id
            )));
        }
        let message = self.store.add_reaction(message_id, user_id, emoji).await?;
        self.persist(
            PersistenceRequest::new(
                Operation::AddReaction,
                json!({ "message_id": message_id, "user_id": user_id, "emoji": emoji }),
            ),
            conversation.id,
        )
        .await?;
        Ok(message)
    }

    /// Removes the caller's own reaction; absent reactions are a no-op.
    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<Message> {
        let message = self.store.remove_reaction(message_id, user_id, emoji).await?;
        self.persist(
            PersistenceRequest::new(
                Operation::RemoveReaction,
                json!({ "message_id": message_id, "user_id": user_id, "emoji": emoji }),
            ),
            message.conversation_id,
        )
        .await?;
        Ok(message)
    }

    // ---- delivery / read ----

    pub async fn mark_delivered(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> ChatResult<DeliveryReceipt> {
        let message = self.store.get(message_id).await?;
        let conversation = self.registry.get(message.conversation_id).await?;
        if !conversation.is_participant(recipient_id) {
            return Err(ChatError::PermissionDenied(format!(
                "recipient {recipient_id} is not a participant of conversation {}",
                conversation.id
            )));
        }

        let receipt = self.tracker.mark_delivered(message_id, recipient_id, at).await;
        self.persist(
            PersistenceRequest::new(
                Operation::MarkDelivered,
                json!({
                    "message_id": message_id,
                    "recipient_id": recipient_id,
                    "delivered_at": at,
                }),
            ),
            conversation.id,
        )
        .await?;

        let envelope = EventEnvelope::new(
            EventKind::MessageDelivered,
            conversation.id,
            json!({ "message_id": message_id, "recipient_id": recipient_id }),
        );
        self.channels
            .dispatch(&conversation.participant_ids(), &envelope)
            .await;
        Ok(receipt)
    }

    /// Marks everything up to the watermark as read for the recipient.
    /// Idempotent and monotonic; a stale watermark is a harmless no-op.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        up_to: DateTime<Utc>,
    ) -> ChatResult<usize> {
        let conversation = self.registry.get(conversation_id).await?;
        if !conversation.is_participant(recipient_id) {
            return Err(ChatError::PermissionDenied(format!(
                "recipient {recipient_id} is not a participant of conversation {conversation_id}"
            )));
        }

        let messages = self.store.messages_up_to(conversation_id, up_to).await;
        let advanced = self
            .tracker
            .mark_read(conversation_id, recipient_id, up_to, &messages)
            .await;

        self.persist(
            PersistenceRequest::new(
                Operation::MarkRead,
                json!({
                    "conversation_id": conversation_id,
                    "recipient_id": recipient_id,
                    "up_to": up_to,
                }),
            ),
            conversation_id,
        )
        .await?;

        let envelope = EventEnvelope::new(
            EventKind::MessageRead,
            conversation_id,
            json!({ "recipient_id": recipient_id, "up_to": up_to }),
        );
        self.channels
            .dispatch(&conversation.participant_ids(), &envelope)
            .await;
        Ok(advanced)
    }

    pub async fn receipt(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
    ) -> Option<DeliveryReceipt> {
        self.tracker.receipt(message_id, recipient_id).await
    }

    // ---- moderation ----

    pub async fn archive(&self, conversation_id: Uuid, actor: Actor) -> ChatResult<Conversation> {
        self.update_status(conversation_id, ConversationStatus::Archived, actor, None, None)
            .await
    }

    pub async fn mute(&self, conversation_id: Uuid, actor: Actor) -> ChatResult<Conversation> {
        self.update_status(conversation_id, ConversationStatus::Muted, actor, None, None)
            .await
    }

    pub async fn resolve(&self, conversation_id: Uuid, actor: Actor) -> ChatResult<Conversation> {
        self.update_status(conversation_id, ConversationStatus::Resolved, actor, None, None)
            .await
    }

    pub async fn delete(&self, conversation_id: Uuid, actor: Actor) -> ChatResult<Conversation> {
        self.update_status(conversation_id, ConversationStatus::Deleted, actor, None, None)
            .await
    }

    /// One moderation transition: legality check and per-thread
    /// serialization in the registry, audit append in the engine, then
    /// persistence and rebroadcast. Without an idempotency key the
    /// persistence call executes at most once.
    pub async fn update_status(
        &self,
        conversation_id: Uuid,
        new_status: ConversationStatus,
        actor: Actor,
        reason: Option<String>,
        idempotency_key: Option<String>,
    ) -> ChatResult<Conversation> {
        let update = self
            .registry
            .update_status(conversation_id, new_status, actor, reason.clone(), &self.moderation)
            .await?;
        if !update.changed {
            return Ok(update.conversation);
        }

        let mut request = PersistenceRequest::new(
            Operation::UpdateConversationStatus,
            json!({
                "conversation_id": conversation_id,
                "status": new_status,
                "actor_id": actor.id,
                "reason": reason,
            }),
        );
        if let Some(key) = idempotency_key {
            request = request.with_key(key);
        }
        self.persist(request, conversation_id).await?;

        let envelope = EventEnvelope::new(
            EventKind::ConversationStatus,
            conversation_id,
            json!({
                "status": new_status,
                "actor_id": actor.id,
            }),
        );
        self.channels
            .dispatch(&update.conversation.participant_ids(), &envelope)
            .await;
        Ok(update.conversation)
    }

    /// Admin-only view of the moderation audit trail.
    pub async fn audit_log(
        &self,
        conversation_id: Uuid,
        actor: Actor,
    ) -> ChatResult<Vec<ModerationAction>> {
        self.moderation.audit_log(conversation_id, actor).await
    }

    // ---- channel sessions ----

    pub async fn subscribe(&self, user_id: Uuid) -> SubscriptionHandle {
        self.channels.subscribe(user_id).await
    }

    pub async fn dispose(&self, subscriber: SubscriberId) {
        self.channels.dispose(subscriber).await
    }

    pub async fn suspend(&self, subscriber: SubscriberId) -> ChatResult<()> {
        self.channels.suspend(subscriber).await
    }

    pub async fn reconnect(&self, subscriber: SubscriberId) -> ChatResult<Reconnection> {
        self.channels.reconnect(subscriber).await
    }

    // ---- inbound events ----

    /// Normalizes one inbound transport event into the corresponding
    /// mutation, then rebroadcasts to observers.
    pub async fn ingest(&self, envelope: EventEnvelope) -> ChatResult<()> {
        match envelope.kind {
            EventKind::MessageCreated => {
                let payload: MessageCreated = parse_payload(&envelope)?;
                self.send_message(NewMessage {
                    conversation_id: envelope.conversation_id,
                    sender_id: payload.sender_id,
                    receiver_id: payload.receiver_id,
                    content: payload.content,
                    kind: payload.kind,
                    created_at: Some(envelope.timestamp),
                    reply_to_id: payload.reply_to_id,
                    metadata: payload.metadata,
                })
                .await?;
            }
            EventKind::MessageDelivered => {
                let payload: MessageDelivered = parse_payload(&envelope)?;
                self.mark_delivered(payload.message_id, payload.recipient_id, envelope.timestamp)
                    .await?;
            }
            EventKind::MessageRead => {
                let payload: MessageRead = parse_payload(&envelope)?;
                self.mark_read(envelope.conversation_id, payload.recipient_id, payload.up_to)
                    .await?;
            }
            EventKind::ConversationStatus => {
                let payload: StatusChanged = parse_payload(&envelope)?;
                let actor = Actor {
                    id: payload.actor_id,
                    admin: payload.actor_admin,
                };
                self.update_status(
                    envelope.conversation_id,
                    payload.status,
                    actor,
                    payload.reason,
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn persist(&self, request: PersistenceRequest, conversation_id: Uuid) -> ChatResult<()> {
        self.gateway.call(request).await.map_err(|e| {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "persistence call failed"
            );
            e
        })?;
        Ok(())
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(envelope: &EventEnvelope) -> ChatResult<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        tracing::warn!(
            conversation_id = %envelope.conversation_id,
            kind = ?envelope.kind,
            "malformed event payload: {e}"
        );
        ChatError::Validation(format!("malformed {:?} payload: {e}", envelope.kind))
    })
}
