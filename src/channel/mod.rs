//! Session/subscription layer.
//!
//! Subscribers register per user and receive every event for conversations
//! they participate in. Dispatch and disposal both run under the registry
//! write lock, so once `dispose` returns no further event can reach the
//! handle. Events for one thread arrive in dispatch order; nothing is
//! guaranteed across threads.
//!
//! A session whose outbound channel fails is suspended instead of dropped:
//! up to `replay_capacity` of its most recent undelivered events are kept,
//! and a reconnect inside the grace window replays them in order. Past the
//! window, or after the buffer overflows, replay cannot be trusted and the
//! caller must re-fetch thread state from the store and the registry.

use crate::error::{ChatError, ChatResult};
use crate::models::event::EventEnvelope;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier for a subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposable handle returned by `subscribe`.
pub struct SubscriptionHandle {
    pub id: SubscriberId,
    pub user_id: Uuid,
    pub events: UnboundedReceiver<EventEnvelope>,
}

/// What a reconnecting subscriber got back.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Buffered events were replayed onto the fresh channel, in order.
    Replayed(usize),
    /// Buffer overflowed or the grace window lapsed; the caller must
    /// re-fetch state instead of trusting replay.
    ResyncRequired,
}

#[derive(Debug)]
pub struct Reconnection {
    pub events: UnboundedReceiver<EventEnvelope>,
    pub outcome: ReplayOutcome,
}

enum Outlet {
    Live(UnboundedSender<EventEnvelope>),
    Suspended {
        buffer: VecDeque<EventEnvelope>,
        since: Instant,
        overflowed: bool,
    },
}

struct Session {
    user_id: Uuid,
    outlet: Outlet,
}

pub struct ChannelManager {
    inner: RwLock<HashMap<SubscriberId, Session>>,
    replay_capacity: usize,
    replay_window: Duration,
}

impl ChannelManager {
    pub fn new(replay_capacity: usize, replay_window: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            replay_capacity,
            replay_window,
        }
    }

    /// Opens a logical session for the user.
    pub async fn subscribe(&self, user_id: Uuid) -> SubscriptionHandle {
        let (tx, rx) = unbounded_channel();
        let id = SubscriberId::new();
        self.inner.write().await.insert(
            id,
            Session {
                user_id,
                outlet: Outlet::Live(tx),
            },
        );
        tracing::debug!(subscriber = ?id, user_id = %user_id, "subscriber registered");
        SubscriptionHandle {
            id,
            user_id,
            events: rx,
        }
    }

    /// Scoped release. Runs under the same lock as dispatch, so after this
    /// returns no event is delivered to the handle.
    pub async fn dispose(&self, subscriber: SubscriberId) {
        if self.inner.write().await.remove(&subscriber).is_some() {
            tracing::debug!(subscriber = ?subscriber, "subscriber disposed");
        }
    }

    /// Delivers the event to every session belonging to one of the given
    /// participants. Sessions with a dead sender are suspended and start
    /// buffering.
    pub async fn dispatch(&self, participants: &[Uuid], event: &EventEnvelope) {
        let mut guard = self.inner.write().await;
        for (id, session) in guard.iter_mut() {
            if !participants.contains(&session.user_id) {
                continue;
            }
            match &mut session.outlet {
                Outlet::Live(tx) => {
                    if tx.send(event.clone()).is_err() {
                        tracing::debug!(
                            subscriber = ?id,
                            conversation_id = %event.conversation_id,
                            "send failed, suspending subscriber"
                        );
                        let mut buffer = VecDeque::with_capacity(8);
                        buffer.push_back(event.clone());
                        session.outlet = Outlet::Suspended {
                            buffer,
                            since: Instant::now(),
                            overflowed: false,
                        };
                    }
                }
                Outlet::Suspended {
                    buffer, overflowed, ..
                } => {
                    buffer.push_back(event.clone());
                    if buffer.len() > self.replay_capacity {
                        buffer.pop_front();
                        *overflowed = true;
                    }
                }
            }
        }
    }

    /// Flags the session's transport as failed; subsequent events are
    /// buffered for replay.
    pub async fn suspend(&self, subscriber: SubscriberId) -> ChatResult<()> {
        let mut guard = self.inner.write().await;
        let session = guard
            .get_mut(&subscriber)
            .ok_or_else(|| ChatError::NotFound(format!("subscriber {:?}", subscriber)))?;
        if matches!(session.outlet, Outlet::Live(_)) {
            session.outlet = Outlet::Suspended {
                buffer: VecDeque::new(),
                since: Instant::now(),
                overflowed: false,
            };
        }
        Ok(())
    }

    /// Re-opens the session on a fresh channel. Buffered events are
    /// replayed in arrival order when the buffer held and the grace window
    /// has not lapsed; otherwise the caller is told to resync.
    pub async fn reconnect(&self, subscriber: SubscriberId) -> ChatResult<Reconnection> {
        let mut guard = self.inner.write().await;
        let session = guard
            .get_mut(&subscriber)
            .ok_or_else(|| ChatError::NotFound(format!("subscriber {:?}", subscriber)))?;

        let (tx, rx) = unbounded_channel();
        let outcome = match std::mem::replace(&mut session.outlet, Outlet::Live(tx.clone())) {
            Outlet::Live(_) => ReplayOutcome::Replayed(0),
            Outlet::Suspended {
                buffer,
                since,
                overflowed,
            } => {
                if overflowed || since.elapsed() > self.replay_window {
                    tracing::warn!(
                        subscriber = ?subscriber,
                        buffered = buffer.len(),
                        overflowed,
                        "replay unavailable, resync required"
                    );
                    ReplayOutcome::ResyncRequired
                } else {
                    let count = buffer.len();
                    for event in buffer {
                        // Receiver is held right here; sends cannot fail.
                        let _ = tx.send(event);
                    }
                    ReplayOutcome::Replayed(count)
                }
            }
        };

        Ok(Reconnection {
            events: rx,
            outcome,
        })
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventKind;
    use serde_json::json;

    fn manager() -> ChannelManager {
        ChannelManager::new(500, Duration::from_secs(30))
    }

    fn event(conversation_id: Uuid, n: u64) -> EventEnvelope {
        EventEnvelope::new(
            EventKind::MessageCreated,
            conversation_id,
            json!({ "n": n }),
        )
    }

    fn seq(e: &EventEnvelope) -> u64 {
        e.payload["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn events_arrive_in_dispatch_order() {
        let channels = manager();
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let mut handle = channels.subscribe(user).await;

        for n in 0..5 {
            channels.dispatch(&[user], &event(thread, n)).await;
        }

        for expected in 0..5 {
            let received = handle.events.recv().await.unwrap();
            assert_eq!(seq(&received), expected);
            assert_eq!(received.conversation_id, thread);
        }
    }

    #[tokio::test]
    async fn only_participants_receive_events() {
        let channels = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let thread = Uuid::new_v4();
        let mut handle_a = channels.subscribe(a).await;
        let mut handle_b = channels.subscribe(b).await;

        channels.dispatch(&[a], &event(thread, 1)).await;

        assert_eq!(seq(&handle_a.events.recv().await.unwrap()), 1);
        assert!(handle_b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_event_after_dispose_returns() {
        let channels = manager();
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let mut handle = channels.subscribe(user).await;

        channels.dispatch(&[user], &event(thread, 1)).await;
        channels.dispose(handle.id).await;
        channels.dispatch(&[user], &event(thread, 2)).await;

        // The pre-disposal event is still queued; nothing after it.
        assert_eq!(seq(&handle.events.recv().await.unwrap()), 1);
        assert!(handle.events.recv().await.is_none());
        assert_eq!(channels.session_count().await, 0);
    }

    #[tokio::test]
    async fn suspended_session_replays_on_reconnect() {
        let channels = manager();
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let handle = channels.subscribe(user).await;

        channels.suspend(handle.id).await.unwrap();
        for n in 0..3 {
            channels.dispatch(&[user], &event(thread, n)).await;
        }

        let mut reconnection = channels.reconnect(handle.id).await.unwrap();
        assert_eq!(reconnection.outcome, ReplayOutcome::Replayed(3));
        for expected in 0..3 {
            assert_eq!(seq(&reconnection.events.recv().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn dropped_receiver_triggers_buffering() {
        let channels = manager();
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let handle = channels.subscribe(user).await;
        let id = handle.id;
        drop(handle);

        channels.dispatch(&[user], &event(thread, 7)).await;
        channels.dispatch(&[user], &event(thread, 8)).await;

        let mut reconnection = channels.reconnect(id).await.unwrap();
        assert_eq!(reconnection.outcome, ReplayOutcome::Replayed(2));
        assert_eq!(seq(&reconnection.events.recv().await.unwrap()), 7);
        assert_eq!(seq(&reconnection.events.recv().await.unwrap()), 8);
    }

    #[tokio::test]
    async fn buffer_overflow_forces_resync() {
        let channels = ChannelManager::new(2, Duration::from_secs(30));
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let handle = channels.subscribe(user).await;

        channels.suspend(handle.id).await.unwrap();
        for n in 0..3 {
            channels.dispatch(&[user], &event(thread, n)).await;
        }

        let reconnection = channels.reconnect(handle.id).await.unwrap();
        assert_eq!(reconnection.outcome, ReplayOutcome::ResyncRequired);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_grace_window_forces_resync() {
        let channels = ChannelManager::new(500, Duration::from_secs(30));
        let user = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let handle = channels.subscribe(user).await;

        channels.suspend(handle.id).await.unwrap();
        channels.dispatch(&[user], &event(thread, 1)).await;

        tokio::time::advance(Duration::from_secs(31)).await;

        let reconnection = channels.reconnect(handle.id).await.unwrap();
        assert_eq!(reconnection.outcome, ReplayOutcome::ResyncRequired);

        // The fresh channel works normally afterwards.
        let mut reconnection2 = channels.reconnect(handle.id).await.unwrap();
        assert_eq!(reconnection2.outcome, ReplayOutcome::Replayed(0));
        channels.dispatch(&[user], &event(thread, 2)).await;
        assert_eq!(seq(&reconnection2.events.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn unknown_subscriber_is_not_found() {
        let channels = manager();
        let err = channels.reconnect(SubscriberId::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
