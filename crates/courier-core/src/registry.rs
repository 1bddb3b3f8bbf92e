//! Connection registry: the single owner of live connections.
//!
//! Everything else refers to connections by id and reads point-in-time
//! snapshots; only the registry mutates connection state. The registry also
//! enforces admission policy (per-IP caps, country blocklist, subprotocol
//! allowlist) and per-user connection caps at authentication time.

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::connection::{
    AuthState, ClientInfo, Connection, ConnectionId, ConnectionStatus, UserId,
};
use crate::events::{Event, EventBus};
use crate::sink::{MessageSink, SinkError};
use courier_protocol::{codec, Envelope};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection does not exist or its transport is not writable.
    #[error("Connection not open: {0}")]
    NotOpen(String),

    /// Per-IP connection cap reached.
    #[error("Connection limit reached for {0}")]
    LimitExceeded(String),

    /// The client's country is on the blocklist.
    #[error("Connections from {0} are not accepted")]
    GeoBlocked(String),

    /// The negotiated subprotocol is not on the allowlist.
    #[error("Protocol not allowed: {0}")]
    ProtocolNotAllowed(String),

    /// Registry invariant violation.
    #[error("Internal registry error: {0}")]
    Internal(String),
}

/// Admission policy.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum simultaneous connections per client IP.
    pub max_connections_per_ip: usize,
    /// Maximum simultaneous connections per authenticated user.
    pub max_connections_per_user: usize,
    /// Country codes refused at accept time. Empty allows all.
    pub blocked_countries: Vec<String>,
    /// Subprotocol names accepted when the client requests one. Empty
    /// allows any.
    pub allowed_protocols: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 10,
            max_connections_per_user: 5,
            blocked_countries: Vec::new(),
            allowed_protocols: Vec::new(),
        }
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: UserId,
    pub session_id: String,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Tracked connections in any state.
    pub connections: usize,
    /// Connections that completed authentication.
    pub authenticated: usize,
    /// Failed or timed-out authentication attempts since startup.
    pub auth_failures: u64,
}

struct ConnectionEntry {
    connection: Connection,
    sink: Arc<dyn MessageSink>,
}

/// The central connection registry.
pub struct ConnectionRegistry {
    /// Connections indexed by id.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Reverse index: user id -> connection ids.
    by_user: DashMap<UserId, DashSet<ConnectionId>>,
    /// Reverse index: client IP -> connection ids.
    by_ip: DashMap<String, DashSet<ConnectionId>>,
    config: RegistryConfig,
    authenticator: Arc<dyn Authenticator>,
    events: EventBus,
    auth_failures: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(
        config: RegistryConfig,
        authenticator: Arc<dyn Authenticator>,
        events: EventBus,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_ip: DashMap::new(),
            config,
            authenticator,
            events,
            auth_failures: AtomicU64::new(0),
        }
    }

    /// Admit a new connection in the `Connecting` state.
    ///
    /// # Errors
    ///
    /// Returns `GeoBlocked`, `ProtocolNotAllowed`, or `LimitExceeded` when
    /// admission policy refuses the client, and `Internal` on an id
    /// collision (which also emits a `Fault` event).
    pub fn accept(
        &self,
        sink: Arc<dyn MessageSink>,
        client: ClientInfo,
    ) -> Result<ConnectionId, ConnectionError> {
        if let Some(country) = client.country.as_deref() {
            if self
                .config
                .blocked_countries
                .iter()
                .any(|blocked| blocked.eq_ignore_ascii_case(country))
            {
                return Err(ConnectionError::GeoBlocked(country.to_string()));
            }
        }

        if !self.config.allowed_protocols.is_empty() {
            if let Some(protocol) = client.protocol.as_deref() {
                if !self.config.allowed_protocols.iter().any(|p| p == protocol) {
                    return Err(ConnectionError::ProtocolNotAllowed(protocol.to_string()));
                }
            }
        }

        let ip = client.ip();
        if let Some(ip) = &ip {
            let held = self.by_ip.get(ip).map_or(0, |set| set.len());
            if held >= self.config.max_connections_per_ip {
                return Err(ConnectionError::LimitExceeded(ip.clone()));
            }
        }

        let id = ConnectionId::generate();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.events.emit(Event::Fault {
                    component: "registry",
                    detail: format!("duplicate connection id {id}"),
                });
                return Err(ConnectionError::Internal(format!(
                    "duplicate connection id {id}"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    connection: Connection::new(id.clone(), client),
                    sink,
                });
            }
        }

        if let Some(ip) = ip {
            self.by_ip.entry(ip).or_default().insert(id.clone());
        }

        debug!(connection = %id, "Connection accepted");
        Ok(id)
    }

    /// Promote a connection from `Connecting` to `Connected`.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the connection is unknown or past `Connecting`.
    pub fn mark_established(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let remote_addr = {
            let mut entry = self
                .connections
                .get_mut(id)
                .ok_or_else(|| ConnectionError::NotOpen(id.to_string()))?;
            if !entry.connection.transition(ConnectionStatus::Connected) {
                return Err(ConnectionError::NotOpen(id.to_string()));
            }
            entry.connection.client.remote_addr.clone()
        };

        debug!(connection = %id, "Connection established");
        self.events.emit(Event::ConnectionEstablished {
            connection_id: id.clone(),
            remote_addr,
        });
        Ok(())
    }

    /// Validate credentials for a connection and bind the user to it.
    ///
    /// Unknown or non-`Connected` connection ids are rejected as invalid
    /// credentials. Every failure path counts toward `auth_failures`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential` when validation fails and
    /// `ConnectionLimit` when the user is at their connection cap.
    pub async fn authenticate(
        &self,
        id: &ConnectionId,
        credentials: Credentials,
    ) -> Result<AuthSession, AuthError> {
        {
            let Some(entry) = self.connections.get(id) else {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AuthError::InvalidCredential);
            };
            if entry.connection.status != ConnectionStatus::Connected {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AuthError::InvalidCredential);
            }
        }

        let grant = match self.authenticator.validate(&credentials).await {
            Ok(grant) => grant,
            Err(error) => {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(mut entry) = self.connections.get_mut(id) {
                    entry.connection.auth = AuthState::Failed;
                }
                warn!(connection = %id, %error, "Authentication failed");
                return Err(error);
            }
        };

        let held = self.by_user.get(&grant.user_id).map_or(0, |set| set.len());
        if held >= self.config.max_connections_per_user {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(mut entry) = self.connections.get_mut(id) {
                entry.connection.auth = AuthState::Failed;
            }
            return Err(AuthError::ConnectionLimit(grant.user_id));
        }

        let session_id = Uuid::new_v4().to_string();
        {
            let Some(mut entry) = self.connections.get_mut(id) else {
                // Closed while we were validating.
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AuthError::InvalidCredential);
            };
            let conn = &mut entry.connection;
            conn.user_id = Some(grant.user_id.clone());
            conn.session_id = Some(session_id.clone());
            conn.auth = AuthState::Authenticated;
            conn.attrs = filter_attrs(&grant.user_id, &grant.role, &grant.attrs);
            conn.touch();
        }

        self.by_user
            .entry(grant.user_id.clone())
            .or_default()
            .insert(id.clone());

        info!(connection = %id, user = %grant.user_id, "Connection authenticated");
        self.events.emit(Event::UserAuthenticated {
            connection_id: id.clone(),
            user_id: grant.user_id.clone(),
            session_id: session_id.clone(),
        });

        Ok(AuthSession {
            user_id: grant.user_id,
            session_id,
        })
    }

    /// Count an authentication window expiry as a failed attempt.
    pub fn record_auth_timeout(&self, id: &ConnectionId) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.connection.auth = AuthState::Failed;
        }
        debug!(connection = %id, "Authentication window expired");
    }

    /// Send an envelope to a connection.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` unless the connection exists, is `Connected`, and
    /// its transport is writable.
    pub async fn send(
        &self,
        id: &ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), ConnectionError> {
        let sink = self
            .sink(id)
            .ok_or_else(|| ConnectionError::NotOpen(id.to_string()))?;
        let frame =
            codec::encode(envelope).map_err(|e| ConnectionError::Internal(e.to_string()))?;
        sink.send(&frame).await.map_err(|e| match e {
            SinkError::Closed => ConnectionError::NotOpen(id.to_string()),
            other => ConnectionError::Internal(other.to_string()),
        })
    }

    /// Writable sink for a connection, if it is live.
    #[must_use]
    pub fn sink(&self, id: &ConnectionId) -> Option<Arc<dyn MessageSink>> {
        let entry = self.connections.get(id)?;
        if entry.connection.status == ConnectionStatus::Connected && entry.sink.is_open() {
            Some(Arc::clone(&entry.sink))
        } else {
            None
        }
    }

    /// Close a connection: transition, close the transport, then remove.
    pub async fn close(&self, id: &ConnectionId, code: u16, reason: &str) {
        let sink = {
            let Some(mut entry) = self.connections.get_mut(id) else {
                return;
            };
            entry.connection.transition(ConnectionStatus::Disconnecting);
            Arc::clone(&entry.sink)
        };
        sink.close(code, reason).await;
        self.mark_closed(id, code, reason);
    }

    /// Remove a connection after its transport has closed. Idempotent.
    pub fn mark_closed(&self, id: &ConnectionId, code: u16, reason: &str) {
        let Some((_, mut entry)) = self.connections.remove(id) else {
            return;
        };
        entry.connection.transition(ConnectionStatus::Disconnected);
        self.unindex(id, &entry.connection);

        info!(connection = %id, code, reason, "Connection closed");
        self.events.emit(Event::ConnectionClosed {
            connection_id: id.clone(),
            user_id: entry.connection.user_id.clone(),
            code,
            reason: reason.to_string(),
        });
    }

    /// Remove a connection after a transport fault. Idempotent.
    pub fn mark_faulted(&self, id: &ConnectionId, detail: &str) {
        let Some((_, mut entry)) = self.connections.remove(id) else {
            return;
        };
        entry.connection.transition(ConnectionStatus::Error);
        self.unindex(id, &entry.connection);

        warn!(connection = %id, detail, "Connection faulted");
        self.events.emit(Event::ConnectionClosed {
            connection_id: id.clone(),
            user_id: entry.connection.user_id.clone(),
            code: 1006,
            reason: detail.to_string(),
        });
    }

    /// Stamp an outstanding ping on a connection.
    pub fn begin_ping(&self, id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.connection.heartbeat.begin_ping(Instant::now());
        }
    }

    /// Clear the outstanding ping on a connection.
    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.connection.heartbeat.record_pong(Instant::now());
        }
    }

    /// Connections whose outstanding ping is older than `timeout`.
    #[must_use]
    pub fn overdue_pings(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.connections
            .iter()
            .filter(|entry| entry.connection.heartbeat.is_overdue(timeout, now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Authenticated, connected connection ids.
    #[must_use]
    pub fn authenticated_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| {
                entry.connection.status == ConnectionStatus::Connected
                    && entry.connection.is_authenticated()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Refresh a connection's activity timestamp.
    ///
    /// Returns the bound user id so callers can emit an activity event.
    pub fn touch(&self, id: &ConnectionId) -> Option<UserId> {
        let mut entry = self.connections.get_mut(id)?;
        entry.connection.touch();
        entry.connection.user_id.clone()
    }

    /// Record that a connection joined a room.
    pub fn note_room_joined(&self, id: &ConnectionId, room: &str) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.connection.rooms.insert(room.to_string());
        }
    }

    /// Record that a connection left a room.
    pub fn note_room_left(&self, id: &ConnectionId, room: &str) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.connection.rooms.remove(room);
        }
    }

    /// Point-in-time copy of a connection's state.
    #[must_use]
    pub fn snapshot(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.connection.clone())
    }

    /// All connection ids bound to a user.
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.by_user
            .get(user_id)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Any live, authenticated connection for a user.
    #[must_use]
    pub fn resolve_user(&self, user_id: &str) -> Option<ConnectionId> {
        let set = self.by_user.get(user_id)?;
        for id in set.iter() {
            if let Some(entry) = self.connections.get(&id) {
                if entry.connection.status == ConnectionStatus::Connected
                    && entry.connection.is_authenticated()
                    && entry.sink.is_open()
                {
                    return Some(id.clone());
                }
            }
        }
        None
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let authenticated = self
            .connections
            .iter()
            .filter(|entry| entry.connection.is_authenticated())
            .count();
        RegistryStats {
            connections: self.connections.len(),
            authenticated,
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }

    fn unindex(&self, id: &ConnectionId, connection: &Connection) {
        if let Some(user_id) = &connection.user_id {
            if let Some(set) = self.by_user.get(user_id) {
                set.remove(id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.by_user
                        .remove_if(user_id, |_, set| set.is_empty());
                }
            }
        }
        if let Some(ip) = connection.client.ip() {
            if let Some(set) = self.by_ip.get(&ip) {
                set.remove(id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.by_ip.remove_if(&ip, |_, set| set.is_empty());
                }
            }
        }
    }
}

/// Attribute object evaluated by broadcast filters.
fn filter_attrs(user_id: &str, role: &str, extra: &serde_json::Value) -> serde_json::Value {
    let mut attrs = serde_json::json!({
        "userId": user_id,
        "role": role,
    });
    if let (Some(target), Some(source)) = (attrs.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacAuthenticator;
    use crate::test_support::RecordingSink;

    const SECRET: &[u8] = b"registry-test-secret";

    fn registry(config: RegistryConfig) -> (Arc<ConnectionRegistry>, EventBus) {
        let events = EventBus::new(64);
        let registry = Arc::new(ConnectionRegistry::new(
            config,
            Arc::new(HmacAuthenticator::new(SECRET.to_vec())),
            events.clone(),
        ));
        (registry, events)
    }

    fn client_from(addr: &str) -> ClientInfo {
        ClientInfo {
            remote_addr: Some(addr.to_string()),
            ..Default::default()
        }
    }

    fn credentials_for(user: &str) -> Credentials {
        let token = HmacAuthenticator::new(SECRET.to_vec()).token_for(user);
        Credentials::new(user, token)
    }

    #[tokio::test]
    async fn test_accept_starts_connecting() {
        let (registry, _) = registry(RegistryConfig::default());
        let sink = Arc::new(RecordingSink::new());

        let id = registry.accept(sink, ClientInfo::default()).unwrap();
        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, ConnectionStatus::Connecting);
        assert_eq!(snapshot.auth, AuthState::Pending);

        registry.mark_established(&id).unwrap();
        assert_eq!(
            registry.snapshot(&id).unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let (registry, _) = registry(RegistryConfig::default());
        let sink = Arc::new(RecordingSink::new());
        let id = registry.accept(Arc::clone(&sink) as _, ClientInfo::default()).unwrap();

        // Still connecting: not writable.
        let err = registry.send(&id, &Envelope::ping()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotOpen(_)));

        registry.mark_established(&id).unwrap();
        registry.send(&id, &Envelope::ping()).await.unwrap();
        assert_eq!(sink.sent().len(), 1);

        registry.mark_closed(&id, 1000, "bye");
        let err = registry.send(&id, &Envelope::ping()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotOpen(_)));
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let (registry, events) = registry(RegistryConfig::default());
        let mut rx = events.subscribe();
        let id = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&id).unwrap();

        let session = registry
            .authenticate(&id, credentials_for("alice"))
            .await
            .unwrap();
        assert_eq!(session.user_id, "alice");
        assert!(!session.session_id.is_empty());

        let snapshot = registry.snapshot(&id).unwrap();
        assert!(snapshot.is_authenticated());
        assert_eq!(snapshot.user_id.as_deref(), Some("alice"));
        assert_eq!(snapshot.attrs["role"], "user");

        assert_eq!(registry.connections_for_user("alice"), vec![id.clone()]);
        assert_eq!(registry.resolve_user("alice"), Some(id));

        // Established + authenticated events, in order.
        assert!(matches!(
            rx.recv().await,
            Ok(Event::ConnectionEstablished { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Ok(Event::UserAuthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_authenticate_bad_token_counted() {
        let (registry, _) = registry(RegistryConfig::default());
        let id = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&id).unwrap();

        let result = registry
            .authenticate(&id, Credentials::new("alice", "deadbeef"))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredential)));
        assert_eq!(registry.stats().auth_failures, 1);
        assert_eq!(registry.snapshot(&id).unwrap().auth, AuthState::Failed);
    }

    #[tokio::test]
    async fn test_per_user_connection_cap() {
        let config = RegistryConfig {
            max_connections_per_user: 1,
            ..Default::default()
        };
        let (registry, _) = registry(config);

        let first = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&first).unwrap();
        registry
            .authenticate(&first, credentials_for("alice"))
            .await
            .unwrap();

        let second = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&second).unwrap();
        let result = registry.authenticate(&second, credentials_for("alice")).await;
        assert!(matches!(result, Err(AuthError::ConnectionLimit(_))));
    }

    #[tokio::test]
    async fn test_per_ip_cap() {
        let config = RegistryConfig {
            max_connections_per_ip: 2,
            ..Default::default()
        };
        let (registry, _) = registry(config);

        for _ in 0..2 {
            registry
                .accept(Arc::new(RecordingSink::new()), client_from("10.0.0.9:1000"))
                .unwrap();
        }
        let result = registry.accept(
            Arc::new(RecordingSink::new()),
            client_from("10.0.0.9:1002"),
        );
        assert!(matches!(result, Err(ConnectionError::LimitExceeded(_))));

        // A different IP is unaffected.
        assert!(registry
            .accept(Arc::new(RecordingSink::new()), client_from("10.0.0.7:1000"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_geo_and_protocol_policy() {
        let config = RegistryConfig {
            blocked_countries: vec!["KP".to_string()],
            allowed_protocols: vec!["courier.v1".to_string()],
            ..Default::default()
        };
        let (registry, _) = registry(config);

        let blocked = ClientInfo {
            country: Some("kp".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            registry.accept(Arc::new(RecordingSink::new()), blocked),
            Err(ConnectionError::GeoBlocked(_))
        ));

        let wrong_protocol = ClientInfo {
            protocol: Some("mqtt".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            registry.accept(Arc::new(RecordingSink::new()), wrong_protocol),
            Err(ConnectionError::ProtocolNotAllowed(_))
        ));

        let right_protocol = ClientInfo {
            protocol: Some("courier.v1".to_string()),
            ..Default::default()
        };
        assert!(registry
            .accept(Arc::new(RecordingSink::new()), right_protocol)
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_removes_and_emits_once() {
        let (registry, events) = registry(RegistryConfig::default());
        let mut rx = events.subscribe();
        let sink = Arc::new(RecordingSink::new());
        let id = registry.accept(Arc::clone(&sink) as _, ClientInfo::default()).unwrap();
        registry.mark_established(&id).unwrap();

        registry.close(&id, 1000, "done").await;
        assert!(registry.snapshot(&id).is_none());
        assert_eq!(sink.closed(), Some((1000, "done".to_string())));

        // Second close is a no-op.
        registry.mark_closed(&id, 1000, "done");

        let mut closed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::ConnectionClosed { .. }) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }

    #[tokio::test]
    async fn test_resolve_user_skips_dead_connections() {
        let (registry, _) = registry(RegistryConfig::default());

        let dead_sink = Arc::new(RecordingSink::new());
        let dead = registry
            .accept(Arc::clone(&dead_sink) as _, ClientInfo::default())
            .unwrap();
        registry.mark_established(&dead).unwrap();
        registry.authenticate(&dead, credentials_for("alice")).await.unwrap();
        dead_sink.set_open(false);

        assert_eq!(registry.resolve_user("alice"), None);

        let live = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&live).unwrap();
        registry.authenticate(&live, credentials_for("alice")).await.unwrap();

        assert_eq!(registry.resolve_user("alice"), Some(live));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_pings() {
        let (registry, _) = registry(RegistryConfig::default());
        let id = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&id).unwrap();

        registry.begin_ping(&id);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.overdue_pings(Duration::from_secs(10)).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.overdue_pings(Duration::from_secs(10)), vec![id.clone()]);

        registry.record_pong(&id);
        assert!(registry.overdue_pings(Duration::from_secs(10)).is_empty());
    }

    #[tokio::test]
    async fn test_auth_timeout_counted() {
        let (registry, _) = registry(RegistryConfig::default());
        let id = registry
            .accept(Arc::new(RecordingSink::new()), ClientInfo::default())
            .unwrap();
        registry.mark_established(&id).unwrap();

        registry.record_auth_timeout(&id);
        assert_eq!(registry.stats().auth_failures, 1);
        assert_eq!(registry.snapshot(&id).unwrap().auth, AuthState::Failed);
    }
}
