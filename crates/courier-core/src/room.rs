//! Room entities: membership sets, invitations, bans, and rate limits.

use crate::connection::UserId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if id.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Room visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Anyone may join.
    Public,
    /// Joining requires a standing invitation.
    Private,
}

/// Per-room limits.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Maximum member count.
    pub max_members: usize,
    /// Maximum message payload size in bytes.
    pub max_message_bytes: usize,
    /// Messages one user may send per rate window.
    pub messages_per_user: u32,
    /// Messages the whole room may carry per rate window.
    pub messages_per_room: u32,
    /// Width of the sliding rate window.
    pub rate_window: Duration,
    /// Temporary rooms expire this long after creation.
    pub ttl: Option<Duration>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_members: 100,
            max_message_bytes: 64 * 1024,
            messages_per_user: 10,
            messages_per_room: 100,
            rate_window: Duration::from_secs(10),
            ttl: None,
        }
    }
}

/// Sliding-window hit counter.
///
/// Stores one timestamp per hit and prunes everything older than the window
/// on each query, so the cost is bounded by the configured limit rather than
/// the room's full message history.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Record a hit.
    pub fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    /// Hits inside the window ending at `now`.
    pub fn count(&mut self, window: Duration, now: Instant) -> usize {
        while let Some(front) = self.hits.front() {
            if now.saturating_duration_since(*front) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.len()
    }
}

/// A room tracked by the router.
#[derive(Debug)]
pub struct Room {
    /// Room id.
    pub id: RoomId,
    /// Visibility.
    pub kind: RoomKind,
    /// Current members.
    pub members: HashSet<UserId>,
    /// Standing invitations, consumed on join.
    pub invited: HashSet<UserId>,
    /// Users refused entry.
    pub banned: HashSet<UserId>,
    /// Limits.
    pub settings: RoomSettings,
    /// When the room was created.
    pub created_at: Instant,
    /// Temporary rooms expire at this point.
    pub expires_at: Option<Instant>,
    user_windows: HashMap<UserId, SlidingWindow>,
    room_window: SlidingWindow,
}

impl Room {
    /// Create a room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>, kind: RoomKind, settings: RoomSettings) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            kind,
            members: HashSet::new(),
            invited: HashSet::new(),
            banned: HashSet::new(),
            expires_at: settings.ttl.map(|ttl| now + ttl),
            settings,
            created_at: now,
            user_windows: HashMap::new(),
            room_window: SlidingWindow::default(),
        }
    }

    /// Current member count.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether the member cap is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.settings.max_members
    }

    /// Whether the user is a member.
    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Whether the user is banned.
    #[must_use]
    pub fn is_banned(&self, user_id: &str) -> bool {
        self.banned.contains(user_id)
    }

    /// Whether the user holds a standing invitation.
    #[must_use]
    pub fn is_invited(&self, user_id: &str) -> bool {
        self.invited.contains(user_id)
    }

    /// Whether a temporary room's TTL has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Check the per-user and per-room rate windows for a send.
    ///
    /// Records the hit in both windows only when both allow it.
    pub(crate) fn check_rate(&mut self, user_id: &str, now: Instant) -> bool {
        let window = self.settings.rate_window;
        let user_hits = self
            .user_windows
            .entry(user_id.to_string())
            .or_default()
            .count(window, now);
        if user_hits >= self.settings.messages_per_user as usize {
            return false;
        }
        if self.room_window.count(window, now) >= self.settings.messages_per_room as usize {
            return false;
        }

        if let Some(user_window) = self.user_windows.get_mut(user_id) {
            user_window.record(now);
        }
        self.room_window.record(now);
        true
    }

    /// Drop rate bookkeeping for a departed user.
    pub(crate) fn forget_rate(&mut self, user_id: &str) {
        self.user_windows.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("general").is_ok());
        assert!(validate_room_id("team:alpha").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$internal").is_err());

        let long_id = "a".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_id).is_err());
    }

    #[test]
    fn test_room_membership_flags() {
        let mut room = Room::new("general", RoomKind::Public, RoomSettings::default());
        room.members.insert("alice".to_string());
        room.banned.insert("mallory".to_string());
        room.invited.insert("bob".to_string());

        assert!(room.is_member("alice"));
        assert!(room.is_banned("mallory"));
        assert!(room.is_invited("bob"));
        assert!(!room.is_full());
    }

    #[test]
    fn test_room_full() {
        let settings = RoomSettings {
            max_members: 2,
            ..Default::default()
        };
        let mut room = Room::new("small", RoomKind::Public, settings);
        room.members.insert("a".to_string());
        assert!(!room.is_full());
        room.members.insert("b".to_string());
        assert!(room.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_expiry() {
        let settings = RoomSettings {
            ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let room = Room::new("temp", RoomKind::Public, settings);

        assert!(!room.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(room.is_expired(Instant::now()));

        let durable = Room::new("forever", RoomKind::Public, RoomSettings::default());
        assert!(!durable.is_expired(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_prunes() {
        let mut window = SlidingWindow::default();
        let width = Duration::from_secs(10);

        window.record(Instant::now());
        window.record(Instant::now());
        assert_eq!(window.count(width, Instant::now()), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(window.count(width, Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_user_rate_limit() {
        let settings = RoomSettings {
            messages_per_user: 2,
            messages_per_room: 100,
            rate_window: Duration::from_secs(10),
            ..Default::default()
        };
        let mut room = Room::new("limited", RoomKind::Public, settings);

        assert!(room.check_rate("alice", Instant::now()));
        assert!(room.check_rate("alice", Instant::now()));
        assert!(!room.check_rate("alice", Instant::now()));
        // Another user has an independent window.
        assert!(room.check_rate("bob", Instant::now()));

        // The window slides.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(room.check_rate("alice", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_wide_rate_limit() {
        let settings = RoomSettings {
            messages_per_user: 100,
            messages_per_room: 3,
            rate_window: Duration::from_secs(10),
            ..Default::default()
        };
        let mut room = Room::new("busy", RoomKind::Public, settings);

        assert!(room.check_rate("a", Instant::now()));
        assert!(room.check_rate("b", Instant::now()));
        assert!(room.check_rate("c", Instant::now()));
        assert!(!room.check_rate("d", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_not_counted() {
        let settings = RoomSettings {
            messages_per_user: 1,
            messages_per_room: 1,
            rate_window: Duration::from_secs(10),
            ..Default::default()
        };
        let mut room = Room::new("strict", RoomKind::Public, settings);

        assert!(room.check_rate("alice", Instant::now()));
        // Rejected for the room-wide cap; must not burn bob's user budget.
        assert!(!room.check_rate("bob", Instant::now()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(room.check_rate("bob", Instant::now()));
    }
}
