//! Typed lifecycle and delivery events.
//!
//! Components publish onto a shared broadcast bus instead of calling each
//! other back. Collaborators (and the server's forwarding tasks) subscribe
//! and react; a slow subscriber lags and drops the oldest events rather than
//! blocking publishers.

use crate::connection::{ConnectionId, UserId};
use crate::presence::PresenceStatus;
use crate::queue::{MessageId, Target};
use crate::room::RoomId;
use tokio::sync::broadcast;
use tracing::trace;

/// An event emitted by one of the core components.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection completed the transport handshake.
    ConnectionEstablished {
        connection_id: ConnectionId,
        remote_addr: Option<String>,
    },

    /// A connection was closed and removed from the registry.
    ConnectionClosed {
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        code: u16,
        reason: String,
    },

    /// A connection presented valid credentials.
    UserAuthenticated {
        connection_id: ConnectionId,
        user_id: UserId,
        session_id: String,
    },

    /// A user did something worth refreshing presence for.
    Activity { user_id: UserId },

    /// A user's presence status changed.
    PresenceChanged {
        user_id: UserId,
        previous: Option<PresenceStatus>,
        status: PresenceStatus,
    },

    /// A room was created.
    RoomCreated { room_id: RoomId },

    /// A user joined a room.
    RoomJoined { room_id: RoomId, user_id: UserId },

    /// A user left a room (or was kicked/banned out of it).
    RoomLeft { room_id: RoomId, user_id: UserId },

    /// A queued message reached its target.
    MessageDelivered { message_id: MessageId, target: Target },

    /// A queued message was expired, dead-lettered, or rejected.
    MessageFailed {
        message_id: MessageId,
        target: Target,
        reason: String,
    },

    /// A component detected an internal invariant violation.
    Fault {
        component: &'static str,
        detail: String,
    },
}

impl Event {
    /// Short name for logging and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::UserAuthenticated { .. } => "user_authenticated",
            Self::Activity { .. } => "activity",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::RoomCreated { .. } => "room_created",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageFailed { .. } => "message_failed",
            Self::Fault { .. } => "fault",
        }
    }
}

/// Broadcast bus carrying [`Event`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(Event::Activity {
            user_id: "alice".to_string(),
        });

        match rx.recv().await.unwrap() {
            Event::Activity { user_id } => assert_eq!(user_id, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.emit(Event::RoomCreated {
            room_id: "lobby".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::RoomCreated {
            room_id: "lobby".to_string(),
        });

        assert!(matches!(rx1.recv().await, Ok(Event::RoomCreated { .. })));
        assert!(matches!(rx2.recv().await, Ok(Event::RoomCreated { .. })));
    }
}
