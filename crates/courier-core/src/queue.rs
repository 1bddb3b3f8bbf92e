//! Queue entities for the delivery engine.

use crate::connection::{ConnectionId, UserId};
use crate::filter::FilterExpr;
use crate::room::RoomId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// The five logical queues, one per delivery style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Plain ordered delivery.
    Fifo,
    /// Priority-weighted delivery.
    Priority,
    /// Held until `delay_until`.
    Delayed,
    /// Room fan-out.
    Broadcast,
    /// Survives restarts when a store is attached.
    Persistent,
}

impl QueueKind {
    /// All queue kinds, in processing order.
    pub const ALL: [QueueKind; 5] = [
        QueueKind::Fifo,
        QueueKind::Priority,
        QueueKind::Delayed,
        QueueKind::Broadcast,
        QueueKind::Persistent,
    ];

    /// Queue name for logs and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::Delayed => "delayed",
            Self::Broadcast => "broadcast",
            Self::Persistent => "persistent",
        }
    }
}

/// Lifecycle of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
    Expired,
    Cancelled,
}

impl MessageStatus {
    /// Whether the message has left the active queue for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Expired | Self::Cancelled)
    }
}

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// One specific connection.
    Connection(ConnectionId),
    /// Any live connection of a user.
    User(UserId),
    /// Every member of a room.
    Room(RoomId),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(id) => write!(f, "connection:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Room(id) => write!(f, "room:{id}"),
        }
    }
}

/// Priority bounds. Values outside are clamped on enqueue.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

/// A message owned by the delivery engine.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Unique identifier.
    pub id: MessageId,
    /// Which queue holds it.
    pub kind: QueueKind,
    /// 1 (lowest) to 5 (highest).
    pub priority: u8,
    /// Lifecycle state.
    pub status: MessageStatus,
    /// Destination.
    pub target: Target,
    /// Envelope body handed to the recipient.
    pub payload: Value,
    /// Broadcast filter conjunction, room targets only.
    pub filters: Option<Vec<FilterExpr>>,
    /// Users excluded from a room fan-out (typically the sender).
    pub exclude: Vec<UserId>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Attempt cap before dead-lettering.
    pub max_retries: u32,
    /// Not eligible before this point.
    pub delay_until: Option<Instant>,
    /// Dropped as expired at this point.
    pub expires_at: Option<Instant>,
    /// Enqueue instant, used for ordering ties.
    pub created: Instant,
    /// Wall-clock enqueue time.
    pub created_at: DateTime<Utc>,
    /// Connection a `Processing` attempt is running against.
    pub in_flight: Option<ConnectionId>,
    /// Most recent delivery error.
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// Whether the message has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Whether the message may be processed now.
    #[must_use]
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.status == MessageStatus::Queued
            && match self.delay_until {
                Some(at) => now >= at,
                None => true,
            }
    }
}

/// Snapshot of a message moved to the dead-letter store.
#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    /// The message as it looked when it failed.
    pub message: QueuedMessage,
    /// Why it was dead-lettered.
    pub reason: String,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The target queue is at capacity.
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    /// The message outlived its TTL.
    #[error("Message expired")]
    Expired,

    /// No message with that id.
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),
}

/// Parameters for [`enqueue`](crate::delivery::DeliveryEngine::enqueue).
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub target: Target,
    pub payload: Value,
    pub kind: QueueKind,
    pub priority: u8,
    /// Overrides the engine's configured retry cap when set.
    pub max_retries: Option<u32>,
    /// Hold the message this long before the first attempt.
    pub delay: Option<Duration>,
    /// Expire the message this long after enqueue.
    pub ttl: Option<Duration>,
    pub filters: Option<Vec<FilterExpr>>,
    pub exclude: Vec<UserId>,
}

impl EnqueueRequest {
    /// Request with default priority and no delay, TTL, or filters.
    #[must_use]
    pub fn new(target: Target, payload: Value, kind: QueueKind) -> Self {
        Self {
            target,
            payload,
            kind,
            priority: MIN_PRIORITY,
            max_retries: None,
            delay: None,
            ttl: None,
            filters: None,
            exclude: Vec::new(),
        }
    }

    /// Set the priority (clamped to 1-5 on enqueue).
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the message before its first attempt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Expire the message after `ttl`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Override the retry cap.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attach a broadcast filter conjunction.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<FilterExpr>) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Exclude users from a room fan-out.
    #[must_use]
    pub fn with_exclude(mut self, exclude: Vec<UserId>) -> Self {
        self.exclude = exclude;
        self
    }
}

/// Result alias for [`QueueStore`] implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Optional persistence hook for `Persistent`-kind messages.
///
/// The engine persists on enqueue, removes on terminal status, and
/// re-enqueues `load`ed messages at startup. Store failures are logged by
/// the engine and never fail the triggering operation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Record a message.
    async fn persist(&self, message: &QueuedMessage) -> Result<(), StoreError>;

    /// Forget a message that reached a terminal status.
    async fn remove(&self, id: MessageId) -> Result<(), StoreError>;

    /// Messages to re-enqueue at startup.
    async fn load(&self) -> Result<Vec<QueuedMessage>, StoreError>;
}
