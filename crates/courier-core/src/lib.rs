//! # courier-core
//!
//! Core components of the Courier realtime messaging substrate.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Connection lifecycle, authentication, heartbeats
//! - **Router** - Room membership, permissions, and fan-out
//! - **Delivery** - Queued at-least-once messaging with retries
//! - **Presence** - Online/away/busy/offline tracking
//! - **Events** - Typed broadcast bus wiring the components together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│   Router    │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   ▲
//!        └───────┬───────────┘
//!                │
//!         ┌─────────────┐     ┌─────────────┐
//!         │  Delivery   │────▶│  Presence   │
//!         └─────────────┘ bus └─────────────┘
//! ```
//!
//! The transport layer hands the registry a [`MessageSink`] per connection;
//! everything above it is transport-agnostic.

pub mod auth;
pub mod connection;
pub mod delivery;
pub mod events;
pub mod filter;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod room;
pub mod router;
pub mod sink;

#[cfg(test)]
mod test_support;

pub use auth::{AuthError, AuthGrant, Authenticator, Credentials, HmacAuthenticator};
pub use connection::{AuthState, ClientInfo, Connection, ConnectionId, ConnectionStatus, UserId};
pub use delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, DeliveryStats, TickSummary};
pub use events::{Event, EventBus};
pub use filter::{matches_all, FilterExpr, FilterOp};
pub use presence::{PresenceConfig, PresenceRecord, PresenceStats, PresenceStatus, PresenceTracker};
pub use queue::{
    DeadLetterMessage, EnqueueRequest, MessageId, MessageStatus, QueueError, QueueKind,
    QueueStore, QueuedMessage, StoreError, Target,
};
pub use registry::{AuthSession, ConnectionError, ConnectionRegistry, RegistryConfig, RegistryStats};
pub use room::{validate_room_id, Room, RoomId, RoomKind, RoomSettings};
pub use router::{DeliveryOutcome, RoomError, RoomRouter, RouterStats};
pub use sink::{MessageSink, SinkError};
