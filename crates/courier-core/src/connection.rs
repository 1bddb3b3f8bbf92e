//! Connection state tracked by the registry.

use crate::room::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Identifier for an authenticated user.
pub type UserId = String;

/// Atomic counter so ids stay unique even within the same nanosecond.
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let counter = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{:04x}", counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection lifecycle states.
///
/// `Reconnecting` exists for wire parity with clients that report it; the
/// registry never enters it (reconnection means opening a new connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    /// Whether the state admits no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Legal transitions: Connecting -> Connected -> Disconnecting ->
    /// Disconnected, with shortcuts to Disconnected for connections torn
    /// down before the handshake finishes, and Error reachable from any
    /// non-terminal state on a transport fault.
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Disconnecting, Error};
        match (self, next) {
            (Connecting, Connected | Disconnecting | Disconnected | Error) => true,
            (Connected, Disconnecting | Disconnected | Error) => true,
            (Disconnecting, Disconnected | Error) => true,
            _ => false,
        }
    }

    /// Wire name for the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authentication progress for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Handshake not attempted yet.
    #[default]
    Pending,
    /// Credentials validated, user assigned.
    Authenticated,
    /// Credentials rejected or the handshake timed out.
    Failed,
}

/// Client details captured at accept time.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// Remote socket address, as reported by the transport.
    pub remote_addr: Option<String>,
    /// User agent header, if the client sent one.
    pub user_agent: Option<String>,
    /// Two-letter country code resolved by the edge, if available.
    pub country: Option<String>,
    /// Negotiated subprotocol name.
    pub protocol: Option<String>,
}

impl ClientInfo {
    /// IP portion of the remote address, with any port stripped.
    #[must_use]
    pub fn ip(&self) -> Option<String> {
        let addr = self.remote_addr.as_deref()?;
        if let Some(end) = addr.rfind(']') {
            // Bracketed IPv6 form: [::1]:8080
            return Some(addr[..=end].to_string());
        }
        match addr.rsplit_once(':') {
            Some((host, _port)) => Some(host.to_string()),
            None => Some(addr.to_string()),
        }
    }
}

/// Outstanding heartbeat bookkeeping for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatState {
    /// When the last unanswered ping was sent.
    pub pending_since: Option<Instant>,
    /// When the last pong arrived.
    pub last_pong: Option<Instant>,
}

impl HeartbeatState {
    /// Record an outgoing ping.
    pub fn begin_ping(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    /// Record an incoming pong, clearing the outstanding ping.
    pub fn record_pong(&mut self, now: Instant) {
        self.pending_since = None;
        self.last_pong = Some(now);
    }

    /// Whether an outstanding ping is older than `timeout`.
    #[must_use]
    pub fn is_overdue(&self, timeout: Duration, now: Instant) -> bool {
        match self.pending_since {
            Some(sent) => now.saturating_duration_since(sent) > timeout,
            None => false,
        }
    }
}

/// A live connection as tracked by the registry.
///
/// The transport handle lives alongside this struct in the registry entry,
/// so snapshots of a `Connection` are plain data and safe to hand out.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier, stable for the connection's lifetime.
    pub id: ConnectionId,
    /// Assigned after successful authentication.
    pub user_id: Option<UserId>,
    /// Session identifier minted at authentication.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub status: ConnectionStatus,
    /// Authentication progress.
    pub auth: AuthState,
    /// Client details from accept time.
    pub client: ClientInfo,
    /// Rooms this connection has joined.
    pub rooms: HashSet<RoomId>,
    /// Attributes used by broadcast filters (role plus custom metadata).
    pub attrs: serde_json::Value,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Last frame or activity seen from the client.
    pub last_activity: Instant,
    /// Heartbeat bookkeeping.
    pub heartbeat: HeartbeatState,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    #[must_use]
    pub fn new(id: ConnectionId, client: ClientInfo) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id: None,
            session_id: None,
            status: ConnectionStatus::Connecting,
            auth: AuthState::Pending,
            client,
            rooms: HashSet::new(),
            attrs: serde_json::Value::Null,
            connected_at: now,
            last_activity: now,
            heartbeat: HeartbeatState::default(),
        }
    }

    /// Whether authentication completed successfully.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    /// Apply a status transition if the state machine allows it.
    ///
    /// Returns `false` (leaving the status unchanged) for illegal
    /// transitions.
    pub fn transition(&mut self, next: ConnectionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last client activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_status_machine() {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Disconnecting, Error};

        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Error));

        // Terminal states go nowhere.
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Connected));

        // Connected is never reachable without passing through Connecting.
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn test_transition_rejects_illegal() {
        let mut conn = Connection::new(ConnectionId::generate(), ClientInfo::default());
        assert_eq!(conn.status, ConnectionStatus::Connecting);

        assert!(conn.transition(ConnectionStatus::Connected));
        assert!(!conn.transition(ConnectionStatus::Connecting));
        assert_eq!(conn.status, ConnectionStatus::Connected);

        assert!(conn.transition(ConnectionStatus::Disconnecting));
        assert!(conn.transition(ConnectionStatus::Disconnected));
        assert!(!conn.transition(ConnectionStatus::Connected));
    }

    #[test]
    fn test_client_info_ip() {
        let v4 = ClientInfo {
            remote_addr: Some("192.168.1.10:52110".to_string()),
            ..Default::default()
        };
        assert_eq!(v4.ip().as_deref(), Some("192.168.1.10"));

        let v6 = ClientInfo {
            remote_addr: Some("[::1]:8080".to_string()),
            ..Default::default()
        };
        assert_eq!(v6.ip().as_deref(), Some("[::1]"));

        assert_eq!(ClientInfo::default().ip(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_overdue() {
        let mut hb = HeartbeatState::default();
        let timeout = Duration::from_secs(10);

        assert!(!hb.is_overdue(timeout, Instant::now()));

        hb.begin_ping(Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!hb.is_overdue(timeout, Instant::now()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(hb.is_overdue(timeout, Instant::now()));

        hb.record_pong(Instant::now());
        assert!(!hb.is_overdue(timeout, Instant::now()));
    }
}
