//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime messaging substrate.
//!
//! This crate defines the JSON envelope exchanged between clients and the
//! server over WebSocket, the typed payload structs for the payloads the
//! server produces or consumes, and the codec with its size limits.
//!
//! ## Frame Types
//!
//! - `authenticate` / `auth_success` / `auth_failure` - Authentication handshake
//! - `room_join` / `room_leave` / `room_message` - Room operations
//! - `message` - Direct delivery to a user
//! - `ping` / `pong` / `heartbeat` - Liveness and keepalive
//! - `presence_update`, `error`, `connect`, `disconnect`
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Envelope};
//!
//! let frame = Envelope::authenticate("token", "alice");
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_ENVELOPE_SIZE};
pub use envelope::{
    AuthFailure, AuthRequest, AuthSuccess, ConnectGreeting, DirectMessage, Envelope, EnvelopeKind,
    ErrorBody, PresenceUpdateBody, RoomMessageBody, RoomRequest,
};
