//! Envelope types for the Courier wire protocol.
//!
//! Every frame exchanged with a client is a JSON envelope carrying a type
//! tag, a free-form `data` object, and routing metadata. Typed payload
//! structs are provided for the payloads the server itself produces or
//! consumes; collaborator payloads pass through as raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Connect,
    Disconnect,
    Message,
    PresenceUpdate,
    RoomJoin,
    RoomLeave,
    RoomMessage,
    Heartbeat,
    Ping,
    Pong,
    Error,
    Authenticate,
    AuthSuccess,
    AuthFailure,
}

impl EnvelopeKind {
    /// Wire name of this kind (the `type` field value).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Connect => "connect",
            EnvelopeKind::Disconnect => "disconnect",
            EnvelopeKind::Message => "message",
            EnvelopeKind::PresenceUpdate => "presence_update",
            EnvelopeKind::RoomJoin => "room_join",
            EnvelopeKind::RoomLeave => "room_leave",
            EnvelopeKind::RoomMessage => "room_message",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Authenticate => "authenticate",
            EnvelopeKind::AuthSuccess => "auth_success",
            EnvelopeKind::AuthFailure => "auth_failure",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
///
/// `data` is a JSON object whose shape depends on `kind`; the typed payload
/// structs below document the shapes the server understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique frame identifier.
    pub id: String,
    /// Frame type tag.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Creation time, RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// Originating or target user, where relevant.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    /// Room the frame concerns, where relevant.
    #[serde(rename = "roomId", skip_serializing_if = "Option::is_none", default)]
    pub room_id: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(kind: EnvelopeKind, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            data,
            timestamp: Utc::now(),
            user_id: None,
            room_id: None,
        }
    }

    /// Attach a user id.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a room id.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Override the frame id (used when the id must track an internal
    /// message id rather than a fresh uuid).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Deserialize the `data` object into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error if the payload does not match `T`.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Server greeting sent right after the transport is established.
    #[must_use]
    pub fn connect(connection_id: impl Into<String>, heartbeat_ms: u64) -> Self {
        Self::new(
            EnvelopeKind::Connect,
            json!({
                "connectionId": connection_id.into(),
                "heartbeatMs": heartbeat_ms,
            }),
        )
    }

    /// Client authentication request.
    #[must_use]
    pub fn authenticate(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self::new(
            EnvelopeKind::Authenticate,
            json!({ "token": token.into(), "userId": user_id.clone() }),
        )
        .with_user(user_id)
    }

    /// Successful authentication response.
    #[must_use]
    pub fn auth_success(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self::new(
            EnvelopeKind::AuthSuccess,
            json!({ "userId": user_id.clone(), "sessionId": session_id.into() }),
        )
        .with_user(user_id)
    }

    /// Failed authentication response.
    #[must_use]
    pub fn auth_failure(error: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::AuthFailure, json!({ "error": error.into() }))
    }

    /// Error report. Never closes the connection by itself.
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::Error,
            json!({ "error": error.into(), "timestamp": Utc::now() }),
        )
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping, json!({}))
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new(EnvelopeKind::Pong, json!({}))
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(EnvelopeKind::Heartbeat, json!({}))
    }

    /// Client request to join a room.
    #[must_use]
    pub fn room_join(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self::new(EnvelopeKind::RoomJoin, json!({ "roomId": room_id.clone() })).with_room(room_id)
    }

    /// Client request to leave a room.
    #[must_use]
    pub fn room_leave(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self::new(EnvelopeKind::RoomLeave, json!({ "roomId": room_id.clone() })).with_room(room_id)
    }

    /// Room message, used both for client submissions and server fan-out.
    #[must_use]
    pub fn room_message(room_id: impl Into<String>, content: Value) -> Self {
        let room_id = room_id.into();
        Self::new(
            EnvelopeKind::RoomMessage,
            json!({ "roomId": room_id.clone(), "content": content }),
        )
        .with_room(room_id)
    }

    /// Direct message delivered to a connection.
    #[must_use]
    pub fn message(data: Value) -> Self {
        Self::new(EnvelopeKind::Message, data)
    }

    /// Client presence update.
    #[must_use]
    pub fn presence_update(status: impl Into<String>, metadata: Option<Value>) -> Self {
        let mut data = json!({ "status": status.into() });
        if let Some(meta) = metadata {
            data["metadata"] = meta;
        }
        Self::new(EnvelopeKind::PresenceUpdate, data)
    }
}

/// `connect` payload: the server greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectGreeting {
    pub connection_id: String,
    pub heartbeat_ms: u64,
}

/// `authenticate` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
    pub user_id: String,
}

/// `auth_success` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: String,
    pub session_id: String,
}

/// `auth_failure` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailure {
    pub error: String,
}

/// `room_join` / `room_leave` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: String,
}

/// `room_message` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessageBody {
    pub room_id: String,
    pub content: Value,
}

/// `message` payload submitted by a client for another user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub to: String,
    pub content: Value,
    /// Queue kind name; defaults to the fifo queue.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub priority: Option<u8>,
}

/// `presence_update` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdateBody {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,
}

/// `error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(EnvelopeKind::PresenceUpdate.as_str(), "presence_update");
        assert_eq!(EnvelopeKind::AuthSuccess.as_str(), "auth_success");
        assert_eq!(
            serde_json::to_value(EnvelopeKind::RoomMessage).unwrap(),
            json!("room_message")
        );
    }

    #[test]
    fn test_envelope_builders() {
        let env = Envelope::room_message("lobby", json!({"text": "hi"}));
        assert_eq!(env.kind, EnvelopeKind::RoomMessage);
        assert_eq!(env.room_id.as_deref(), Some("lobby"));
        assert_eq!(env.data["roomId"], json!("lobby"));

        let env = Envelope::auth_success("u-1", "s-1");
        assert_eq!(env.user_id.as_deref(), Some("u-1"));
        let body: AuthSuccess = env.parse_data().unwrap();
        assert_eq!(body.session_id, "s-1");
    }

    #[test]
    fn test_envelope_ids_unique() {
        let a = Envelope::ping();
        let b = Envelope::ping();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_typed_payload_roundtrip() {
        let env = Envelope::authenticate("tok", "alice");
        let req: AuthRequest = env.parse_data().unwrap();
        assert_eq!(req.token, "tok");
        assert_eq!(req.user_id, "alice");
    }

    #[test]
    fn test_optional_routing_fields_omitted() {
        let text = serde_json::to_string(&Envelope::ping()).unwrap();
        assert!(!text.contains("userId"));
        assert!(!text.contains("roomId"));
    }

    #[test]
    fn test_parse_client_frame() {
        let raw = json!({
            "id": "f-1",
            "type": "room_join",
            "data": { "roomId": "trading" },
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.kind, EnvelopeKind::RoomJoin);
        let req: RoomRequest = env.parse_data().unwrap();
        assert_eq!(req.room_id, "trading");
    }
}
