//! User presence derived from connection lifecycle and activity.
//!
//! The tracker consumes registry events and answers "is this user online,
//! away, busy, or offline". Status is per user, not per connection: a user
//! with three tabs open is one Online record with `connections == 3`.

use crate::connection::UserId;
use crate::events::{Event, EventBus};
use crate::room::RoomId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Presence status for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    /// Wire name for the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Presence state for a single user.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// Status before the most recent change.
    pub previous: Option<PresenceStatus>,
    /// Last activity, or the moment the last connection closed.
    pub last_seen: Instant,
    /// When `status` last changed.
    pub changed_at: Instant,
    /// Open connections for this user.
    pub connections: u32,
    /// Set by an explicit status call; the sweep leaves pinned records
    /// alone until activity clears the pin.
    pub pinned: bool,
    /// Room the user most recently joined, if any.
    pub current_room: Option<RoomId>,
    /// Metadata attached to the last explicit status call.
    pub metadata: Option<Value>,
}

impl PresenceRecord {
    fn new(user_id: UserId) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            status: PresenceStatus::Offline,
            previous: None,
            last_seen: now,
            changed_at: now,
            connections: 0,
            pinned: false,
            current_room: None,
            metadata: None,
        }
    }
}

/// Idle/offline demotion thresholds.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Online becomes Away after this much inactivity.
    pub idle_timeout: Duration,
    /// A user with no connections becomes Offline after this much inactivity.
    pub offline_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            offline_timeout: Duration::from_secs(600),
        }
    }
}

/// Counts per status plus the total record count.
#[derive(Debug, Clone, Default)]
pub struct PresenceStats {
    pub total: usize,
    pub online: usize,
    pub away: usize,
    pub busy: usize,
    pub offline: usize,
}

/// Tracks presence for every known user.
pub struct PresenceTracker {
    records: DashMap<UserId, PresenceRecord>,
    config: PresenceConfig,
    events: EventBus,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(config: PresenceConfig, events: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            config,
            events,
        }
    }

    /// React to a registry event.
    ///
    /// The server forwards the bus here; callers embedding the core can
    /// feed events directly.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::UserAuthenticated { user_id, .. } => self.connection_opened(user_id),
            Event::ConnectionClosed {
                user_id: Some(user_id),
                ..
            } => self.connection_closed(user_id),
            Event::Activity { user_id } => self.touch(user_id),
            _ => {}
        }
    }

    /// Get the presence record for a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }

    /// Explicitly set a user's status.
    ///
    /// The status is pinned: the demotion sweep will not override it until
    /// the user's next activity clears the pin. Creates a record for a user
    /// the tracker has not seen yet.
    pub fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        metadata: Option<Value>,
    ) -> PresenceRecord {
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::new(user_id.to_string()));

        let previous = record.status;
        record.previous = Some(previous);
        record.status = status;
        record.changed_at = Instant::now();
        record.pinned = true;
        if metadata.is_some() {
            record.metadata = metadata;
        }

        let snapshot = record.clone();
        drop(record);

        debug!(user = %user_id, status = %status, "Presence set explicitly");
        if previous != status {
            self.events.emit(Event::PresenceChanged {
                user_id: user_id.to_string(),
                previous: Some(previous),
                status,
            });
        }
        snapshot
    }

    /// Record user activity, refreshing `last_seen` and clearing any pin.
    pub fn touch(&self, user_id: &str) {
        let Some(mut record) = self.records.get_mut(user_id) else {
            return;
        };

        record.last_seen = Instant::now();
        record.pinned = false;

        if record.connections > 0 && record.status != PresenceStatus::Online {
            let previous = record.status;
            record.previous = Some(previous);
            record.status = PresenceStatus::Online;
            record.changed_at = Instant::now();
            drop(record);
            self.events.emit(Event::PresenceChanged {
                user_id: user_id.to_string(),
                previous: Some(previous),
                status: PresenceStatus::Online,
            });
        }
    }

    /// Record which room the user is currently in.
    pub fn set_current_room(&self, user_id: &str, room: Option<RoomId>) {
        if let Some(mut record) = self.records.get_mut(user_id) {
            record.current_room = room;
        }
    }

    /// Demote idle and departed users.
    ///
    /// With `t` elapsed since `last_seen`: a user is Online for
    /// `t < idle_timeout`, Away for `idle_timeout <= t < offline_timeout`,
    /// and Offline for `t >= offline_timeout` - except that Offline also
    /// requires every connection to be gone, and pinned statuses hold until
    /// either activity or that final offline demotion.
    ///
    /// Returns the users whose status changed.
    pub fn sweep(&self) -> Vec<(UserId, PresenceStatus)> {
        let now = Instant::now();
        let mut changed = Vec::new();

        for mut record in self.records.iter_mut() {
            let idle = now.saturating_duration_since(record.last_seen);
            let gone = record.connections == 0;

            let target = if record.pinned {
                // A pinned status outlives the sweep unless the user is
                // factually gone past the offline window.
                if gone && idle >= self.config.offline_timeout {
                    PresenceStatus::Offline
                } else {
                    continue;
                }
            } else if !gone {
                if idle < self.config.idle_timeout {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Away
                }
            } else if idle >= self.config.offline_timeout {
                PresenceStatus::Offline
            } else if idle >= self.config.idle_timeout {
                PresenceStatus::Away
            } else {
                continue;
            };

            if target != record.status {
                record.previous = Some(record.status);
                record.status = target;
                record.changed_at = now;
                record.pinned = false;
                changed.push((record.user_id.clone(), target));
            }
        }

        for (user_id, status) in &changed {
            debug!(user = %user_id, status = %status, "Presence swept");
            self.events.emit(Event::PresenceChanged {
                user_id: user_id.clone(),
                previous: None,
                status: *status,
            });
        }

        changed
    }

    /// Drop Offline records untouched for longer than `older_than`.
    ///
    /// Returns the number of records removed.
    pub fn prune_offline(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            record.status != PresenceStatus::Offline
                || now.saturating_duration_since(record.changed_at) < older_than
        });
        before - self.records.len()
    }

    /// Counts per status.
    #[must_use]
    pub fn stats(&self) -> PresenceStats {
        let mut stats = PresenceStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            match record.status {
                PresenceStatus::Online => stats.online += 1,
                PresenceStatus::Away => stats.away += 1,
                PresenceStatus::Busy => stats.busy += 1,
                PresenceStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }

    fn connection_opened(&self, user_id: &str) {
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::new(user_id.to_string()));

        record.connections += 1;
        record.last_seen = Instant::now();
        record.pinned = false;

        let previous = record.status;
        if previous != PresenceStatus::Online {
            record.previous = Some(previous);
            record.status = PresenceStatus::Online;
            record.changed_at = Instant::now();
            drop(record);
            debug!(user = %user_id, "Presence online");
            self.events.emit(Event::PresenceChanged {
                user_id: user_id.to_string(),
                previous: Some(previous),
                status: PresenceStatus::Online,
            });
        }
    }

    fn connection_closed(&self, user_id: &str) {
        let Some(mut record) = self.records.get_mut(user_id) else {
            return;
        };

        record.connections = record.connections.saturating_sub(1);
        if record.connections == 0 {
            // The offline countdown starts at the moment of the last close.
            record.last_seen = Instant::now();
            debug!(user = %user_id, "Last connection closed, offline countdown started");
        }
    }
}
