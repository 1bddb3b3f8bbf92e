//! Outbound delivery seam between the registry and transport implementations.
//!
//! The registry owns one [`MessageSink`] per connection. Transports implement
//! the trait; everything above it (registry, router, delivery engine) stays
//! transport-agnostic, so retry and backoff logic can be exercised against an
//! in-memory sink.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a message sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The underlying transport is closed.
    #[error("Connection closed")]
    Closed,

    /// The outbound buffer is full and the frame was not accepted.
    #[error("Outbound buffer full")]
    Backpressure,

    /// The transport failed to write.
    #[error("Send failed: {0}")]
    Failed(String),
}

impl SinkError {
    /// Whether a delivery attempt hitting this error is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Write side of a single client connection.
///
/// `send` accepts a pre-encoded text frame so fan-out paths encode once and
/// write to many sinks. Implementations must suspend the caller on a full
/// outbound buffer rather than blocking other connections.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Queue a text frame for delivery.
    async fn send(&self, frame: &str) -> Result<(), SinkError>;

    /// Close the connection with a close code and reason.
    ///
    /// Closing an already-closed sink is a no-op.
    async fn close(&self, code: u16, reason: &str);

    /// Whether the transport is still writable.
    fn is_open(&self) -> bool;
}
