//! # courier-transport
//!
//! Transport adapters for Courier.
//!
//! The core crate talks to connections through the
//! [`MessageSink`](courier_core::MessageSink) trait; this crate provides the
//! implementations: a WebSocket sink driven by a dedicated per-connection
//! writer task, and an in-memory sink for tests and benchmarks.

pub mod memory;
pub mod websocket;

pub use memory::InMemorySink;
pub use websocket::{WebSocketSink, WebSocketSinkConfig};
