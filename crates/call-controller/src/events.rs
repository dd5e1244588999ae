//! Call lifecycle events.
//!
//! The event bus is an explicit, dependency-injected interface handed to
//! each component at construction. Production wiring uses the in-process
//! [`BroadcastBus`]; tests substitute the same type and observe events
//! through a subscription. Publishing is best-effort: a delivery failure
//! never blocks or fails the operation that triggered it.
//!
//! Consumers outside this core: the notification delivery service (match /
//! hangup / skip announcements) and the message-relay layer.

use crate::models::{CallRequest, EndReason};
use common::{CallId, ChannelId, GuildId};
use tokio::sync::broadcast;
use tracing::debug;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUS_CAPACITY: usize = 256;

/// One side of a freshly created call, as seen by notification consumers.
#[derive(Debug, Clone)]
pub struct MatchedSide {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub webhook_url: String,
}

/// Events emitted by the call core.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A request entered the queue.
    Queued { request: CallRequest },
    /// Two requests were paired into a call.
    Matched {
        call_id: CallId,
        sides: [MatchedSide; 2],
    },
    /// A call ended; `notify_channel` is the side that did not trigger
    /// the termination and should be told about it.
    Ended {
        call_id: CallId,
        notify_channel: ChannelId,
        reason: EndReason,
    },
}

/// Event-publishing interface injected into each component.
pub trait EventBus: Send + Sync {
    /// Publish an event. Best-effort; never blocks.
    fn publish(&self, event: CallEvent);

    /// Subscribe to the event stream.
    fn subscribe(&self) -> broadcast::Receiver<CallEvent>;
}

/// In-process event bus over a tokio broadcast channel.
pub struct BroadcastBus {
    sender: broadcast::Sender<CallEvent>,
}

impl BroadcastBus {
    /// Create a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: CallEvent) {
        // send() only fails when there are no subscribers, which is a
        // normal state for a process that hosts no notification consumer.
        if self.sender.send(event).is_err() {
            debug!(target: "cc.events", "Event published with no subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{RequestId, UserId};

    fn request() -> CallRequest {
        CallRequest {
            id: RequestId::new(),
            channel_id: ChannelId(1),
            guild_id: GuildId(2),
            webhook_url: "https://hooks.example/1".to_string(),
            initiator_id: UserId(3),
            queued_at: Utc::now(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = BroadcastBus::default();
        let mut rx = bus.subscribe();

        bus.publish(CallEvent::Queued { request: request() });

        match rx.recv().await.unwrap() {
            CallEvent::Queued { request } => assert_eq!(request.channel_id, ChannelId(1)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = BroadcastBus::default();
        // Must not panic or error
        bus.publish(CallEvent::Ended {
            call_id: CallId::new(),
            notify_channel: ChannelId(9),
            reason: EndReason::Hangup,
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = BroadcastBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(CallEvent::Queued { request: request() });

        assert!(matches!(rx1.recv().await.unwrap(), CallEvent::Queued { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), CallEvent::Queued { .. }));
    }
}
