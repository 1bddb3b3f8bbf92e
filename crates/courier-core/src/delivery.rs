//! Message delivery engine.
//!
//! Five logical queues feed a tick loop that resolves targets against the
//! registry and router, runs the resulting sends concurrently, and applies
//! linear-backoff retries. Messages whose recipient is offline stay queued
//! untouched until the recipient comes back; messages that exhaust their
//! retry budget land in a bounded dead-letter store that supports explicit
//! requeue.

use crate::connection::ConnectionId;
use crate::events::{Event, EventBus};
use crate::queue::{
    generate_message_id, DeadLetterMessage, EnqueueRequest, MessageId, MessageStatus, QueueError,
    QueueKind, QueueStore, QueuedMessage, Target, MAX_PRIORITY, MIN_PRIORITY,
};
use crate::registry::ConnectionRegistry;
use crate::room::RoomId;
use crate::router::{RoomError, RoomRouter};
use crate::sink::{MessageSink, SinkError};
use chrono::Utc;
use courier_protocol::{codec, Envelope};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delivery engine tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Per-queue capacity before new messages are dead-lettered.
    pub max_queue_size: usize,
    /// Default retry budget for messages that do not set their own.
    pub max_retries: u32,
    /// Base retry delay. The nth retry waits n times this long.
    pub retry_delay: Duration,
    /// Window within which identical enqueues collapse into one message.
    pub deduplication_window: Duration,
    /// Dead-letter store capacity. The oldest entry is dropped beyond it.
    pub dead_letter_max_size: usize,
    /// Messages taken from one queue per tick.
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            deduplication_window: Duration::from_secs(5),
            dead_letter_max_size: 1_000,
            batch_size: 100,
        }
    }
}

/// Classification of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transient failure. The attempt counts against the retry budget.
    #[error("{0}")]
    Retryable(String),

    /// The message can never be delivered and is dead-lettered directly.
    #[error("{0}")]
    Permanent(String),
}

/// Counters produced by one [`DeliveryEngine::process_tick`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Messages picked up for a delivery attempt.
    pub attempted: usize,
    /// Attempts that reached their target.
    pub delivered: usize,
    /// Attempts re-queued with backoff.
    pub retried: usize,
    /// Messages moved to the dead-letter store.
    pub dead_lettered: usize,
    /// Messages dropped because their TTL elapsed.
    pub expired: usize,
    /// Messages left queued because their target is not reachable.
    pub deferred: usize,
}

/// Queue depths and lifetime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub fifo: usize,
    pub priority: usize,
    pub delayed: usize,
    pub broadcast: usize,
    pub persistent: usize,
    pub dead_letters: usize,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub deduplicated: u64,
}

type DedupKey = (Target, QueueKind, String);

#[derive(Debug, Clone)]
struct DedupEntry {
    id: MessageId,
    inserted: Instant,
}

enum Route {
    /// Candidate connections, tried in order until one accepts the frame.
    Direct(Vec<(ConnectionId, Arc<dyn MessageSink>)>),
    /// Room fan-out through the router.
    Room(RoomId),
}

enum Resolution {
    Route(Route),
    /// Target not reachable right now. The message stays queued untouched.
    Defer,
    /// Target can never be reached again.
    Unroutable(String),
}

enum AttemptOutcome {
    Delivered,
    Deferred,
    Failed(DeliveryError),
}

/// Queue-backed message delivery with retries and dead-lettering.
pub struct DeliveryEngine {
    queues: DashMap<QueueKind, Vec<QueuedMessage>>,
    index: DashMap<MessageId, QueueKind>,
    dedup: DashMap<DedupKey, DedupEntry>,
    dead_letters: Mutex<VecDeque<DeadLetterMessage>>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RoomRouter>,
    store: Option<Arc<dyn QueueStore>>,
    config: DeliveryConfig,
    events: EventBus,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    deduplicated: AtomicU64,
}

impl DeliveryEngine {
    /// Create an engine over the given registry and router.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<RoomRouter>,
        config: DeliveryConfig,
        events: EventBus,
    ) -> Self {
        let queues = DashMap::new();
        for kind in QueueKind::ALL {
            queues.insert(kind, Vec::new());
        }
        Self {
            queues,
            index: DashMap::new(),
            dedup: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            registry,
            router,
            store: None,
            config,
            events,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// Attach a persistence hook for `Persistent`-kind messages.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queue a message for delivery and return its snapshot.
    ///
    /// An identical (target, kind, payload) submission inside the
    /// deduplication window returns the message already queued instead of
    /// creating a second one. When the target queue is full the message
    /// goes straight to the dead-letter store and comes back with status
    /// `Failed`.
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueuedMessage {
        let now = Instant::now();
        let key = fingerprint(&request.target, request.kind, &request.payload);

        if let Some(entry) = self.dedup.get(&key) {
            if now.duration_since(entry.inserted) < self.config.deduplication_window {
                if let Some(original) = self.get(entry.id) {
                    self.deduplicated.fetch_add(1, Ordering::Relaxed);
                    debug!(message_id = original.id, "Duplicate enqueue suppressed");
                    return original;
                }
            }
        }

        let mut message = QueuedMessage {
            id: generate_message_id(),
            kind: request.kind,
            priority: request.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            status: MessageStatus::Queued,
            target: request.target,
            payload: request.payload,
            filters: request.filters,
            exclude: request.exclude,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.config.max_retries),
            delay_until: request.delay.map(|delay| now + delay),
            expires_at: request.ttl.map(|ttl| now + ttl),
            created: now,
            created_at: Utc::now(),
            in_flight: None,
            last_error: None,
        };

        let stored = match self.queues.get_mut(&message.kind) {
            Some(mut queue) => {
                if queue.len() >= self.config.max_queue_size {
                    false
                } else {
                    queue.push(message.clone());
                    true
                }
            }
            None => false,
        };

        if !stored {
            warn!(
                message_id = message.id,
                queue = message.kind.as_str(),
                "Queue full, message dead-lettered"
            );
            message.status = MessageStatus::Failed;
            message.last_error = Some("Queue full".to_string());
            self.push_dead_letter(message.clone(), "Queue full").await;
            return message;
        }

        self.index.insert(message.id, message.kind);
        self.dedup.insert(
            key,
            DedupEntry {
                id: message.id,
                inserted: now,
            },
        );
        if message.kind == QueueKind::Persistent {
            self.persist(&message).await;
        }
        debug!(
            message_id = message.id,
            queue = message.kind.as_str(),
            target = %message.target,
            "Message enqueued"
        );
        message
    }

    /// Snapshot of an active (queued or processing) message.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<QueuedMessage> {
        let kind = *self.index.get(&id)?;
        self.queues
            .get(&kind)?
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    /// Number of messages currently held in `kind`'s queue.
    #[must_use]
    pub fn depth(&self, kind: QueueKind) -> usize {
        self.queues.get(&kind).map_or(0, |queue| queue.len())
    }

    /// Run one delivery pass over every queue.
    pub async fn process_tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for kind in QueueKind::ALL {
            self.tick_queue(kind, &mut summary).await;
        }
        summary
    }

    async fn tick_queue(&self, kind: QueueKind, summary: &mut TickSummary) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut dead = Vec::new();
        let mut items = Vec::new();

        {
            let Some(mut queue) = self.queues.get_mut(&kind) else {
                return;
            };

            queue.retain(|message| {
                if message.status == MessageStatus::Queued && message.is_expired(now) {
                    expired.push(message.clone());
                    false
                } else {
                    true
                }
            });

            let mut eligible: Vec<(u8, Instant, MessageId)> = queue
                .iter()
                .filter(|message| message.is_eligible(now))
                .map(|message| (message.priority, message.created, message.id))
                .collect();
            eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            eligible.truncate(self.config.batch_size);

            for (_, _, id) in eligible {
                let Some(position) = queue.iter().position(|message| message.id == id) else {
                    continue;
                };
                match self.resolve(&queue[position].target) {
                    Resolution::Route(route) => {
                        let message = &mut queue[position];
                        message.status = MessageStatus::Processing;
                        message.in_flight = match &route {
                            Route::Direct(candidates) => {
                                candidates.first().map(|(id, _)| id.clone())
                            }
                            Route::Room(_) => None,
                        };
                        items.push((message.clone(), route));
                    }
                    Resolution::Defer => {
                        summary.deferred += 1;
                    }
                    Resolution::Unroutable(reason) => {
                        let message = queue.remove(position);
                        dead.push((message, reason));
                    }
                }
            }
        }

        for message in expired {
            self.finish_expired(message).await;
            summary.expired += 1;
        }
        for (message, reason) in dead {
            self.push_dead_letter(message, &reason).await;
            summary.dead_lettered += 1;
        }
        if items.is_empty() {
            return;
        }

        summary.attempted += items.len();
        let results = join_all(items.into_iter().map(|(message, route)| async move {
            let outcome = self.attempt(&message, route).await;
            (message.id, outcome)
        }))
        .await;

        self.apply_outcomes(kind, now, results, summary).await;
    }

    /// Map a target to the sinks an attempt should run against.
    ///
    /// Reads collaborator state but takes none of its locks across an await.
    fn resolve(&self, target: &Target) -> Resolution {
        match target {
            Target::Connection(id) => match self.registry.sink(id) {
                Some(sink) => Resolution::Route(Route::Direct(vec![(id.clone(), sink)])),
                None => {
                    if self.registry.snapshot(id).is_none() {
                        Resolution::Unroutable("Connection closed".to_string())
                    } else {
                        Resolution::Defer
                    }
                }
            },
            Target::User(user_id) => {
                let mut candidates = Vec::new();
                for id in self.registry.connections_for_user(user_id) {
                    if let Some(sink) = self.registry.sink(&id) {
                        candidates.push((id, sink));
                    }
                }
                if candidates.is_empty() {
                    Resolution::Defer
                } else {
                    Resolution::Route(Route::Direct(candidates))
                }
            }
            Target::Room(room_id) => {
                if self.router.room_exists(room_id) {
                    Resolution::Route(Route::Room(room_id.clone()))
                } else {
                    Resolution::Unroutable("Room not found".to_string())
                }
            }
        }
    }

    async fn attempt(&self, message: &QueuedMessage, route: Route) -> AttemptOutcome {
        let envelope: Envelope = match serde_json::from_value(message.payload.clone()) {
            Ok(envelope) => envelope,
            Err(error) => {
                return AttemptOutcome::Failed(DeliveryError::Permanent(format!(
                    "Invalid payload: {error}"
                )));
            }
        };

        match route {
            Route::Room(room_id) => {
                let result = self
                    .router
                    .broadcast(
                        &room_id,
                        &envelope,
                        message.filters.as_deref(),
                        &message.exclude,
                    )
                    .await;
                match result {
                    Ok(outcome) => {
                        if outcome.succeeded > 0 {
                            AttemptOutcome::Delivered
                        } else if outcome.attempted == 0 {
                            AttemptOutcome::Deferred
                        } else {
                            AttemptOutcome::Failed(DeliveryError::Retryable(format!(
                                "{} of {} sends failed",
                                outcome.failed, outcome.attempted
                            )))
                        }
                    }
                    Err(RoomError::NotFound(_)) => AttemptOutcome::Failed(
                        DeliveryError::Permanent("Room not found".to_string()),
                    ),
                    Err(RoomError::MessageTooLarge(_)) => AttemptOutcome::Failed(
                        DeliveryError::Permanent("Message too large".to_string()),
                    ),
                    Err(error) => {
                        AttemptOutcome::Failed(DeliveryError::Retryable(error.to_string()))
                    }
                }
            }
            Route::Direct(candidates) => {
                let frame = match codec::encode(&envelope) {
                    Ok(frame) => frame,
                    Err(error) => {
                        return AttemptOutcome::Failed(DeliveryError::Permanent(
                            error.to_string(),
                        ));
                    }
                };
                let connection_target = matches!(message.target, Target::Connection(_));
                let mut last_error = "No live connection".to_string();
                for (connection_id, sink) in candidates {
                    match sink.send(&frame).await {
                        Ok(()) => return AttemptOutcome::Delivered,
                        Err(SinkError::Closed) if connection_target => {
                            return AttemptOutcome::Failed(DeliveryError::Permanent(
                                "Connection closed".to_string(),
                            ));
                        }
                        Err(error) => {
                            warn!(
                                message_id = message.id,
                                connection = %connection_id,
                                %error,
                                "Delivery send failed"
                            );
                            last_error = error.to_string();
                        }
                    }
                }
                AttemptOutcome::Failed(DeliveryError::Retryable(last_error))
            }
        }
    }

    async fn apply_outcomes(
        &self,
        kind: QueueKind,
        now: Instant,
        results: Vec<(MessageId, AttemptOutcome)>,
        summary: &mut TickSummary,
    ) {
        let mut delivered = Vec::new();
        let mut dead = Vec::new();

        {
            let Some(mut queue) = self.queues.get_mut(&kind) else {
                return;
            };
            for (id, outcome) in results {
                let Some(position) = queue.iter().position(|message| message.id == id) else {
                    // Cancelled or dead-lettered while the attempt ran.
                    continue;
                };
                if queue[position].status != MessageStatus::Processing {
                    continue;
                }
                match outcome {
                    AttemptOutcome::Delivered => {
                        delivered.push(queue.remove(position));
                    }
                    AttemptOutcome::Deferred => {
                        let message = &mut queue[position];
                        message.status = MessageStatus::Queued;
                        message.in_flight = None;
                        summary.deferred += 1;
                    }
                    AttemptOutcome::Failed(DeliveryError::Permanent(reason)) => {
                        dead.push((queue.remove(position), reason));
                    }
                    AttemptOutcome::Failed(DeliveryError::Retryable(reason)) => {
                        let message = &mut queue[position];
                        message.retry_count += 1;
                        message.in_flight = None;
                        message.last_error = Some(reason.clone());
                        if message.retry_count < message.max_retries {
                            message.status = MessageStatus::Queued;
                            message.delay_until =
                                Some(now + self.config.retry_delay * message.retry_count);
                            summary.retried += 1;
                        } else {
                            dead.push((queue.remove(position), reason));
                        }
                    }
                }
            }
        }

        for message in delivered {
            self.finish_delivered(message).await;
            summary.delivered += 1;
        }
        for (message, reason) in dead {
            self.push_dead_letter(message, &reason).await;
            summary.dead_lettered += 1;
        }
    }

    /// Dead-letter in-flight messages whose attempt was running against a
    /// connection that just closed. Queued messages are left alone so a
    /// reconnecting user still receives them.
    pub async fn handle_connection_closed(&self, connection_id: &ConnectionId) -> usize {
        let mut victims = Vec::new();
        for kind in QueueKind::ALL {
            if let Some(mut queue) = self.queues.get_mut(&kind) {
                queue.retain(|message| {
                    if message.status == MessageStatus::Processing
                        && message.in_flight.as_ref() == Some(connection_id)
                    {
                        victims.push(message.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        let count = victims.len();
        for message in victims {
            self.push_dead_letter(message, "Connection closed").await;
        }
        count
    }

    /// Remove a message before delivery.
    ///
    /// Returns false when the id is unknown or already terminal.
    pub async fn cancel(&self, id: MessageId) -> bool {
        let Some(kind) = self.index.get(&id).map(|entry| *entry) else {
            return false;
        };
        let removed = {
            let Some(mut queue) = self.queues.get_mut(&kind) else {
                return false;
            };
            queue
                .iter()
                .position(|message| message.id == id)
                .map(|position| queue.remove(position))
        };
        match removed {
            Some(message) => {
                self.index.remove(&id);
                debug!(message_id = id, "Message cancelled");
                if message.kind == QueueKind::Persistent {
                    self.store_remove(id).await;
                }
                true
            }
            None => false,
        }
    }

    /// Move a dead-lettered message back into its queue.
    ///
    /// The retry budget restarts from zero. A full queue leaves the message
    /// in the dead-letter store.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMessage` if the id is not dead-lettered, or
    /// `QueueFull` if the target queue has no room.
    pub async fn retry_dead_letter(&self, id: MessageId) -> Result<QueuedMessage, QueueError> {
        let mut dead_letters = self.dead_letters.lock().await;
        let position = dead_letters
            .iter()
            .position(|entry| entry.message.id == id)
            .ok_or(QueueError::UnknownMessage(id))?;

        let mut message = dead_letters[position].message.clone();
        message.status = MessageStatus::Queued;
        message.retry_count = 0;
        message.delay_until = None;
        message.in_flight = None;
        message.last_error = None;

        {
            let Some(mut queue) = self.queues.get_mut(&message.kind) else {
                return Err(QueueError::QueueFull(message.kind.as_str()));
            };
            if queue.len() >= self.config.max_queue_size {
                return Err(QueueError::QueueFull(message.kind.as_str()));
            }
            queue.push(message.clone());
        }
        let _ = dead_letters.remove(position);
        drop(dead_letters);

        self.index.insert(message.id, message.kind);
        if message.kind == QueueKind::Persistent {
            self.persist(&message).await;
        }
        info!(
            message_id = id,
            queue = message.kind.as_str(),
            "Dead letter requeued"
        );
        Ok(message)
    }

    /// Snapshot of the dead-letter store, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    /// Re-enqueue messages from the attached store.
    ///
    /// Terminal-status entries are skipped. Returns the number restored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let loaded = match store.load().await {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(%error, "Queue store load failed");
                return 0;
            }
        };

        let mut restored = 0;
        for mut message in loaded {
            if message.status.is_terminal() {
                continue;
            }
            message.status = MessageStatus::Queued;
            message.in_flight = None;
            let kind = message.kind;
            let stored = match self.queues.get_mut(&kind) {
                Some(mut queue) => {
                    if queue.len() >= self.config.max_queue_size {
                        false
                    } else {
                        queue.push(message.clone());
                        true
                    }
                }
                None => false,
            };
            if stored {
                self.index.insert(message.id, kind);
                restored += 1;
            } else {
                warn!(message_id = message.id, "Restore skipped, queue full");
            }
        }
        if restored > 0 {
            info!(restored, "Persistent messages restored");
        }
        restored
    }

    /// Drop deduplication fingerprints older than the window.
    pub fn prune_dedup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.deduplication_window;
        let before = self.dedup.len();
        self.dedup
            .retain(|_, entry| now.duration_since(entry.inserted) < window);
        before.saturating_sub(self.dedup.len())
    }

    /// Queue depths and lifetime counters.
    pub async fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            fifo: self.depth(QueueKind::Fifo),
            priority: self.depth(QueueKind::Priority),
            delayed: self.depth(QueueKind::Delayed),
            broadcast: self.depth(QueueKind::Broadcast),
            persistent: self.depth(QueueKind::Persistent),
            dead_letters: self.dead_letters.lock().await.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }

    async fn finish_delivered(&self, mut message: QueuedMessage) {
        message.status = MessageStatus::Delivered;
        message.in_flight = None;
        self.index.remove(&message.id);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = message.id, target = %message.target, "Message delivered");
        self.events.emit(Event::MessageDelivered {
            message_id: message.id,
            target: message.target.clone(),
        });
        if message.kind == QueueKind::Persistent {
            self.store_remove(message.id).await;
        }
    }

    async fn finish_expired(&self, mut message: QueuedMessage) {
        message.status = MessageStatus::Expired;
        self.index.remove(&message.id);
        self.expired.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = message.id, "Message expired");
        self.events.emit(Event::MessageFailed {
            message_id: message.id,
            target: message.target.clone(),
            reason: "Expired".to_string(),
        });
        if message.kind == QueueKind::Persistent {
            self.store_remove(message.id).await;
        }
    }

    async fn push_dead_letter(&self, mut message: QueuedMessage, reason: &str) {
        message.status = MessageStatus::Failed;
        message.in_flight = None;
        message.last_error = Some(reason.to_string());
        self.index.remove(&message.id);
        self.failed.fetch_add(1, Ordering::Relaxed);

        let dropped = {
            let mut dead_letters = self.dead_letters.lock().await;
            let dropped = if dead_letters.len() >= self.config.dead_letter_max_size {
                dead_letters.pop_front()
            } else {
                None
            };
            dead_letters.push_back(DeadLetterMessage {
                message: message.clone(),
                reason: reason.to_string(),
                failed_at: Utc::now(),
            });
            dropped
        };
        if let Some(dropped) = dropped {
            warn!(
                message_id = dropped.message.id,
                "Dead-letter store full, oldest entry dropped"
            );
        }

        warn!(
            message_id = message.id,
            target = %message.target,
            reason = %reason,
            "Message dead-lettered"
        );
        self.events.emit(Event::MessageFailed {
            message_id: message.id,
            target: message.target.clone(),
            reason: reason.to_string(),
        });
        if message.kind == QueueKind::Persistent {
            self.store_remove(message.id).await;
        }
    }

    async fn persist(&self, message: &QueuedMessage) {
        if let Some(store) = &self.store {
            if let Err(error) = store.persist(message).await {
                warn!(message_id = message.id, %error, "Queue store persist failed");
            }
        }
    }

    async fn store_remove(&self, id: MessageId) {
        if let Some(store) = &self.store {
            if let Err(error) = store.remove(id).await {
                warn!(message_id = id, %error, "Queue store remove failed");
            }
        }
    }
}

/// Fingerprint for duplicate suppression.
///
/// Envelope ids and timestamps are fresh on every submission, so the
/// fingerprint covers the routing fields and body only.
fn fingerprint(target: &Target, kind: QueueKind, payload: &Value) -> DedupKey {
    let body = match payload.as_object() {
        Some(object) => {
            let mut stripped = object.clone();
            stripped.remove("id");
            stripped.remove("timestamp");
            Value::Object(stripped).to_string()
        }
        None => payload.to_string(),
    };
    (target.clone(), kind, body)
}
