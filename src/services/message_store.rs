//! Canonical append-ordered record of messages per thread.
//!
//! Appends are linearized by lock acquisition order; the `(created_at, id)`
//! key gives every thread a deterministic total order even when client
//! timestamps collide.

use crate::error::{ChatError, ChatResult};
use crate::models::conversation::Conversation;
use crate::models::message::{Message, MessagePage, NewMessage, OrderKey, Reaction};
use crate::models::Actor;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct StoreInner {
    threads: HashMap<Uuid, BTreeMap<OrderKey, Message>>,
    // message id -> (conversation id, order key)
    index: HashMap<Uuid, (Uuid, OrderKey)>,
}

#[derive(Default)]
pub struct MessageStore {
    inner: RwLock<StoreInner>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates sender participancy and reply-target scope, assigns the
    /// order key, and stores the message. Side effects (registry update,
    /// receipt initialization, fanout) belong to the caller.
    pub async fn append(
        &self,
        new: NewMessage,
        conversation: &Conversation,
    ) -> ChatResult<Message> {
        if new.conversation_id != conversation.id {
            return Err(ChatError::Validation(format!(
                "message addressed to conversation {} but appended to {}",
                new.conversation_id, conversation.id
            )));
        }
        if !conversation.is_participant(new.sender_id) {
            return Err(ChatError::PermissionDenied(format!(
                "sender {} is not a participant of conversation {}",
                new.sender_id, conversation.id
            )));
        }
        if new.content.is_empty() {
            return Err(ChatError::Validation(
                "message content cannot be empty".into(),
            ));
        }

        let mut guard = self.inner.write().await;

        if let Some(reply_to) = new.reply_to_id {
            match guard.index.get(&reply_to) {
                None => {
                    return Err(ChatError::NotFound(format!(
                        "reply target {reply_to} does not exist"
                    )))
                }
                Some((thread, _)) if *thread != conversation.id => {
                    return Err(ChatError::Validation(format!(
                        "reply target {reply_to} belongs to a different thread"
                    )))
                }
                Some(_) => {}
            }
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content: new.content,
            kind: new.kind,
            created_at: new.created_at.unwrap_or_else(Utc::now),
            edited_at: None,
            deleted_at: None,
            reply_to_id: new.reply_to_id,
            version: 1,
            reactions: Vec::new(),
            metadata: new.metadata,
        };

        let key = message.order_key();
        guard.index.insert(message.id, (conversation.id, key));
        guard
            .threads
            .entry(conversation.id)
            .or_default()
            .insert(key, message.clone());

        tracing::debug!(
            message_id = %message.id,
            conversation_id = %conversation.id,
            sender_id = %message.sender_id,
            "message appended"
        );

        Ok(message)
    }

    /// Descending `(created_at, id)` page. An unknown thread yields an empty
    /// page; existence checks belong to the registry.
    pub async fn list(
        &self,
        conversation_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> ChatResult<MessagePage> {
        let before = cursor.map(decode_cursor).transpose()?;
        let guard = self.inner.read().await;

        let Some(thread) = guard.threads.get(&conversation_id) else {
            return Ok(MessagePage {
                messages: Vec::new(),
                next_cursor: None,
            });
        };

        let mut iter: Box<dyn Iterator<Item = (&OrderKey, &Message)> + '_> = match before {
            Some(key) => Box::new(thread.range(..key).rev()),
            None => Box::new(thread.iter().rev()),
        };

        let mut messages = Vec::with_capacity(limit.min(64));
        let mut last_key = None;
        for (key, message) in iter.by_ref().take(limit) {
            last_key = Some(*key);
            messages.push(message.clone());
        }
        let next_cursor = match (last_key, iter.next()) {
            (Some(key), Some(_)) => Some(encode_cursor(&key)),
            _ => None,
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    pub async fn get(&self, message_id: Uuid) -> ChatResult<Message> {
        let guard = self.inner.read().await;
        guard
            .index
            .get(&message_id)
            .and_then(|(thread, key)| guard.threads.get(thread)?.get(key))
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }

    /// Sets the tombstone. Permitted for the sender or an admin actor;
    /// ordering and total count are unaffected. Idempotent.
    pub async fn soft_delete(&self, message_id: Uuid, actor: Actor) -> ChatResult<Message> {
        let mut guard = self.inner.write().await;
        let message = lookup_mut(&mut guard, message_id)?;

        if message.sender_id != actor.id && !actor.admin {
            return Err(ChatError::PermissionDenied(format!(
                "actor {} may not delete message {message_id}",
                actor.id
            )));
        }
        if message.deleted_at.is_none() {
            message.deleted_at = Some(Utc::now());
            tracing::info!(
                message_id = %message_id,
                conversation_id = %message.conversation_id,
                actor_id = %actor.id,
                "message soft-deleted"
            );
        }
        Ok(message.clone())
    }

    /// Sender-only edit; bumps the version and stamps `edited_at`.
    pub async fn edit(
        &self,
        message_id: Uuid,
        actor: Actor,
        content: String,
    ) -> ChatResult<Message> {
        if content.is_empty() {
            return Err(ChatError::Validation(
                "message content cannot be empty".into(),
            ));
        }
        let mut guard = self.inner.write().await;
        let message = lookup_mut(&mut guard, message_id)?;

        if message.sender_id != actor.id {
            return Err(ChatError::PermissionDenied(format!(
                "only the sender may edit message {message_id}"
            )));
        }
        if message.is_deleted() {
            return Err(ChatError::Validation(format!(
                "message {message_id} is deleted and cannot be edited"
            )));
        }

        message.content = content;
        message.version += 1;
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    /// Adds one reaction per (user, emoji) pair; repeat calls are no-ops.
    /// Tombstones cannot be reacted to.
    pub async fn add_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<Message> {
        if emoji.is_empty() {
            return Err(ChatError::Validation("reaction emoji cannot be empty".into()));
        }
        let mut guard = self.inner.write().await;
        let message = lookup_mut(&mut guard, message_id)?;
        if message.is_deleted() {
            return Err(ChatError::Validation(format!(
                "message {message_id} is deleted and cannot be reacted to"
            )));
        }
        if !message
            .reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            message.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id,
                reacted_at: Utc::now(),
            });
        }
        Ok(message.clone())
    }

    /// Removes the caller's own reaction; absent reactions are a no-op.
    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<Message> {
        let mut guard = self.inner.write().await;
        let message = lookup_mut(&mut guard, message_id)?;
        message
            .reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        Ok(message.clone())
    }

    /// Non-deleted messages from others, created strictly after the viewer's
    /// last-read marker (all of them when the marker is absent).
    pub async fn count_unread(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> usize {
        let guard = self.inner.read().await;
        guard
            .threads
            .get(&conversation_id)
            .map(|thread| {
                thread
                    .values()
                    .filter(|m| !m.is_deleted())
                    .filter(|m| m.sender_id != viewer_id)
                    .filter(|m| after.map_or(true, |marker| m.created_at > marker))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Tombstones included; soft deletion never shrinks the total.
    pub async fn count_total(&self, conversation_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard
            .threads
            .get(&conversation_id)
            .map(|thread| thread.len())
            .unwrap_or(0)
    }

    /// Messages with `created_at <= up_to`, for read-marking.
    pub async fn messages_up_to(
        &self,
        conversation_id: Uuid,
        up_to: DateTime<Utc>,
    ) -> Vec<Message> {
        let guard = self.inner.read().await;
        guard
            .threads
            .get(&conversation_id)
            .map(|thread| {
                thread
                    .values()
                    .filter(|m| m.created_at <= up_to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Newest non-deleted message, used to re-derive the registry's
    /// `last_message_id` after a tombstone lands on the tail.
    pub async fn latest_visible(&self, conversation_id: Uuid) -> Option<Message> {
        let guard = self.inner.read().await;
        guard
            .threads
            .get(&conversation_id)?
            .values()
            .rev()
            .find(|m| !m.is_deleted())
            .cloned()
    }

    /// Sent/received tallies for a viewer, tombstones excluded except from
    /// the total.
    pub async fn tally(&self, conversation_id: Uuid, viewer_id: Uuid) -> (usize, usize, usize) {
        let guard = self.inner.read().await;
        let Some(thread) = guard.threads.get(&conversation_id) else {
            return (0, 0, 0);
        };
        let total = thread.len();
        let mut sent = 0;
        let mut received = 0;
        for m in thread.values().filter(|m| !m.is_deleted()) {
            if m.sender_id == viewer_id {
                sent += 1;
            } else {
                received += 1;
            }
        }
        (total, sent, received)
    }

    /// Mean gap between consecutive non-deleted messages whose senders
    /// differ. `None` until the thread holds at least one such exchange.
    pub async fn average_response_ms(&self, conversation_id: Uuid) -> Option<i64> {
        let guard = self.inner.read().await;
        let thread = guard.threads.get(&conversation_id)?;
        let mut gaps = Vec::new();
        let mut prev: Option<&Message> = None;
        for m in thread.values().filter(|m| !m.is_deleted()) {
            if let Some(p) = prev {
                if p.sender_id != m.sender_id {
                    gaps.push((m.created_at - p.created_at).num_milliseconds());
                }
            }
            prev = Some(m);
        }
        if gaps.is_empty() {
            None
        } else {
            Some(gaps.iter().sum::<i64>() / gaps.len() as i64)
        }
    }
}

fn lookup_mut(guard: &mut StoreInner, message_id: Uuid) -> ChatResult<&mut Message> {
    let (thread, key) = guard
        .index
        .get(&message_id)
        .copied()
        .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
    guard
        .threads
        .get_mut(&thread)
        .and_then(|t| t.get_mut(&key))
        .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
}

fn encode_cursor(key: &OrderKey) -> String {
    let nanos = key.created_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
    STANDARD.encode(format!("{nanos}:{}", key.id))
}

fn decode_cursor(raw: &str) -> ChatResult<OrderKey> {
    let invalid = || ChatError::Validation(format!("malformed cursor: {raw}"));
    let bytes = STANDARD.decode(raw).map_err(|_| invalid())?;
    let decoded = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (nanos, id) = decoded.split_once(':').ok_or_else(invalid)?;
    let nanos: i64 = nanos.parse().map_err(|_| invalid())?;
    let id: Uuid = id.parse().map_err(|_| invalid())?;
    Ok(OrderKey {
        created_at: DateTime::from_timestamp_nanos(nanos),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::{ConversationKind, ConversationStatus, Participant};
    use chrono::Duration;
    use serde_json::Map;

    fn conversation(participants: &[Uuid]) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            participants: participants.iter().map(|u| Participant::member(*u)).collect(),
            title: "test".into(),
            kind: ConversationKind::Direct,
            status: ConversationStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_message_id: None,
            metadata: Map::new(),
        }
    }

    fn new_message(conv: &Conversation, sender: Uuid, content: &str) -> NewMessage {
        NewMessage::text(conv.id, sender, content)
    }

    #[tokio::test]
    async fn listing_is_ordered_regardless_of_append_order() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);

        let base = Utc::now();
        // Append out of chronological order.
        for offset in [3i64, 1, 2] {
            store
                .append(
                    new_message(&conv, a, &format!("m{offset}"))
                        .at(base + Duration::seconds(offset)),
                    &conv,
                )
                .await
                .unwrap();
        }

        let page = store.list(conv.id, None, 10).await.unwrap();
        let contents: Vec<_> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m3", "m2", "m1"]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn equal_timestamps_are_tie_broken_by_id() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let at = Utc::now();

        for i in 0..5 {
            store
                .append(new_message(&conv, a, &format!("m{i}")).at(at), &conv)
                .await
                .unwrap();
        }

        let page = store.list(conv.id, None, 10).await.unwrap();
        assert_eq!(page.messages.len(), 5);
        let ids: Vec<_> = page.messages.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_by(|x, y| y.cmp(x));
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn cursor_pagination_is_restartable() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let base = Utc::now();

        for i in 0..7i64 {
            store
                .append(
                    new_message(&conv, a, &format!("m{i}")).at(base + Duration::seconds(i)),
                    &conv,
                )
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store.list(conv.id, cursor.as_deref(), 3).await.unwrap();
            seen.extend(page.messages.iter().map(|m| m.content.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, ["m6", "m5", "m4", "m3", "m2", "m1", "m0"]);
    }

    #[tokio::test]
    async fn non_participant_sender_is_rejected() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let outsider = Uuid::new_v4();

        let err = store
            .append(new_message(&conv, outsider, "hi"), &conv)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn reply_must_target_same_thread() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv1 = conversation(&[a, b]);
        let conv2 = conversation(&[a, b]);

        let original = store
            .append(new_message(&conv1, a, "root"), &conv1)
            .await
            .unwrap();

        let err = store
            .append(new_message(&conv2, a, "reply").reply_to(original.id), &conv2)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = store
            .append(
                new_message(&conv1, a, "reply").reply_to(Uuid::new_v4()),
                &conv1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        store
            .append(new_message(&conv1, b, "reply").reply_to(original.id), &conv1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn soft_delete_requires_sender_or_admin() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let msg = store
            .append(new_message(&conv, a, "hello"), &conv)
            .await
            .unwrap();

        let err = store.soft_delete(msg.id, Actor::user(b)).await.unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let deleted = store.soft_delete(msg.id, Actor::user(a)).await.unwrap();
        assert!(deleted.is_deleted());

        // Admin may delete someone else's message; repeat calls are no-ops.
        let again = store.soft_delete(msg.id, Actor::admin(b)).await.unwrap();
        assert_eq!(again.deleted_at, deleted.deleted_at);
        assert_eq!(store.count_total(conv.id).await, 1);
    }

    #[tokio::test]
    async fn edit_bumps_version_and_rejects_tombstones() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let msg = store
            .append(new_message(&conv, a, "v1"), &conv)
            .await
            .unwrap();

        let err = store
            .edit(msg.id, Actor::user(b), "nope".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let edited = store.edit(msg.id, Actor::user(a), "v2".into()).await.unwrap();
        assert_eq!(edited.content, "v2");
        assert_eq!(edited.version, 2);
        assert!(edited.edited_at.is_some());

        store.soft_delete(msg.id, Actor::user(a)).await.unwrap();
        let err = store
            .edit(msg.id, Actor::user(a), "v3".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn reactions_are_per_user_per_emoji() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let msg = store
            .append(new_message(&conv, a, "hello"), &conv)
            .await
            .unwrap();

        store.add_reaction(msg.id, b, "👍").await.unwrap();
        // Same pair again is a no-op; a second emoji stacks.
        store.add_reaction(msg.id, b, "👍").await.unwrap();
        let updated = store.add_reaction(msg.id, b, "❤️").await.unwrap();
        assert_eq!(updated.reactions.len(), 2);

        let updated = store.remove_reaction(msg.id, b, "👍").await.unwrap();
        assert_eq!(updated.reactions.len(), 1);
        assert_eq!(updated.reactions[0].emoji, "❤️");

        // Removing what is not there changes nothing.
        let updated = store.remove_reaction(msg.id, a, "❤️").await.unwrap();
        assert_eq!(updated.reactions.len(), 1);

        store.soft_delete(msg.id, Actor::user(a)).await.unwrap();
        let err = store.add_reaction(msg.id, b, "👍").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn average_response_covers_sender_changes_only() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);
        let base = Utc::now();

        store
            .append(new_message(&conv, a, "q1").at(base), &conv)
            .await
            .unwrap();
        assert_eq!(store.average_response_ms(conv.id).await, None);

        // a -> b after 2s, b -> a after 4s; a's follow-up to itself is
        // not a response.
        store
            .append(
                new_message(&conv, b, "a1").at(base + Duration::seconds(2)),
                &conv,
            )
            .await
            .unwrap();
        store
            .append(
                new_message(&conv, a, "q2").at(base + Duration::seconds(6)),
                &conv,
            )
            .await
            .unwrap();
        store
            .append(
                new_message(&conv, a, "q3").at(base + Duration::seconds(7)),
                &conv,
            )
            .await
            .unwrap();

        assert_eq!(store.average_response_ms(conv.id).await, Some(3000));
    }

    #[tokio::test]
    async fn unread_excludes_own_and_deleted_messages() {
        let store = MessageStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(&[a, b]);

        let m1 = store
            .append(new_message(&conv, a, "one"), &conv)
            .await
            .unwrap();
        store
            .append(new_message(&conv, a, "two"), &conv)
            .await
            .unwrap();
        store
            .append(new_message(&conv, b, "mine"), &conv)
            .await
            .unwrap();

        assert_eq!(store.count_unread(conv.id, b, None).await, 2);

        store.soft_delete(m1.id, Actor::user(a)).await.unwrap();
        assert_eq!(store.count_unread(conv.id, b, None).await, 1);
        assert_eq!(store.count_total(conv.id).await, 3);
    }
}
