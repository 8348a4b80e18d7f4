//! Per-recipient delivery and read state.
//!
//! Receipts are monotonic: `delivered_at` keeps the earliest value ever
//! recorded, `read_at` the latest, and a read always implies a delivery no
//! later than the read itself.
//! Concurrent read-marks for the same (thread, recipient) pair commute and
//! converge to the maximum watermark observed.

use crate::models::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TrackerInner {
    // (message id, recipient id) -> receipt
    receipts: HashMap<(Uuid, Uuid), DeliveryReceipt>,
    // (conversation id, recipient id) -> last-read watermark
    last_read: HashMap<(Uuid, Uuid), DateTime<Utc>>,
}

#[derive(Default)]
pub struct DeliveryTracker {
    inner: RwLock<TrackerInner>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty receipts for every recipient of a freshly appended
    /// message. Existing receipts are left alone.
    pub async fn init_receipts(&self, message_id: Uuid, recipients: &[Uuid]) {
        let mut guard = self.inner.write().await;
        for recipient in recipients {
            guard
                .receipts
                .entry((message_id, *recipient))
                .or_default();
        }
    }

    /// Idempotent: the earliest recorded delivery wins.
    pub async fn mark_delivered(
        &self,
        message_id: Uuid,
        recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> DeliveryReceipt {
        let mut guard = self.inner.write().await;
        let receipt = guard.receipts.entry((message_id, recipient_id)).or_default();
        receipt.delivered_at = Some(match receipt.delivered_at {
            Some(existing) => existing.min(at),
            None => at,
        });
        *receipt
    }

    /// Marks every message with `created_at <= up_to` and a different sender
    /// as read for the recipient, backfilling `delivered_at` where absent.
    /// Advances the last-read watermark to the monotonic maximum; a stale
    /// `up_to` never regresses anything. Returns how many receipts moved.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        up_to: DateTime<Utc>,
        messages: &[Message],
    ) -> usize {
        let mut guard = self.inner.write().await;
        let mut advanced = 0;

        for message in messages {
            if message.sender_id == recipient_id || message.created_at > up_to {
                continue;
            }
            let receipt = guard
                .receipts
                .entry((message.id, recipient_id))
                .or_default();
            let read_at = match receipt.read_at {
                Some(existing) => existing.max(up_to),
                None => up_to,
            };
            if receipt.read_at != Some(read_at) {
                advanced += 1;
            }
            receipt.read_at = Some(read_at);
            // Reading implies delivery, and delivery can never postdate the
            // read. Earliest delivery wins.
            receipt.delivered_at = Some(match receipt.delivered_at {
                Some(existing) => existing.min(read_at),
                None => read_at,
            });
        }

        guard
            .last_read
            .entry((conversation_id, recipient_id))
            .and_modify(|existing| *existing = (*existing).max(up_to))
            .or_insert(up_to);

        tracing::debug!(
            conversation_id = %conversation_id,
            recipient_id = %recipient_id,
            %up_to,
            advanced,
            "read marker advanced"
        );
        advanced
    }

    pub async fn receipt(&self, message_id: Uuid, recipient_id: Uuid) -> Option<DeliveryReceipt> {
        let guard = self.inner.read().await;
        guard.receipts.get(&(message_id, recipient_id)).copied()
    }

    pub async fn last_read(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
    ) -> Option<DateTime<Utc>> {
        let guard = self.inner.read().await;
        guard.last_read.get(&(conversation_id, recipient_id)).copied()
    }
}
