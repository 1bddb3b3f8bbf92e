//! Shared harness for Courier benchmarks.
//!
//! Builds pre-wired component stacks so each benchmark measures the
//! operation under test rather than setup, and provides a sink that
//! discards frames instead of accumulating them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    ClientInfo, ConnectionId, ConnectionRegistry, Credentials, DeliveryConfig, DeliveryEngine,
    EventBus, HmacAuthenticator, MessageSink, RegistryConfig, RoomRouter, RoomSettings, SinkError,
};

/// Token secret shared by the harness helpers.
pub const SECRET: &str = "bench-secret";

/// A sink that accepts and discards every frame.
pub struct NullSink;

#[async_trait]
impl MessageSink for NullSink {
    async fn send(&self, _frame: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self, _code: u16, _reason: &str) {}

    fn is_open(&self) -> bool {
        true
    }
}

/// Registry, router, and delivery engine wired on one event bus.
pub struct Stack {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<RoomRouter>,
    pub engine: Arc<DeliveryEngine>,
}

/// Build a full stack with admission and queue limits lifted out of the
/// way, so the measured operation is never throttled.
#[must_use]
pub fn stack() -> Stack {
    let events = EventBus::new(1024);
    let registry_config = RegistryConfig {
        max_connections_per_ip: usize::MAX,
        max_connections_per_user: usize::MAX,
        ..RegistryConfig::default()
    };
    let registry = Arc::new(ConnectionRegistry::new(
        registry_config,
        Arc::new(HmacAuthenticator::new(SECRET)),
        events.clone(),
    ));
    let router = Arc::new(RoomRouter::new(Arc::clone(&registry), events.clone()));
    let delivery_config = DeliveryConfig {
        max_queue_size: usize::MAX,
        deduplication_window: Duration::ZERO,
        ..DeliveryConfig::default()
    };
    let engine = Arc::new(DeliveryEngine::new(
        Arc::clone(&registry),
        Arc::clone(&router),
        delivery_config,
        events,
    ));
    Stack {
        registry,
        router,
        engine,
    }
}

/// Room limits that never reject a benchmark workload.
#[must_use]
pub fn open_settings() -> RoomSettings {
    RoomSettings {
        max_members: usize::MAX,
        messages_per_user: u32::MAX,
        messages_per_room: u32::MAX,
        ..RoomSettings::default()
    }
}

/// Connect and authenticate `user` on a discarding sink.
pub async fn connect_user(registry: &ConnectionRegistry, user: &str) -> ConnectionId {
    let id = registry
        .accept(Arc::new(NullSink), ClientInfo::default())
        .expect("accept");
    registry.mark_established(&id).expect("establish");
    let token = HmacAuthenticator::new(SECRET).token_for(user);
    registry
        .authenticate(&id, Credentials::new(user, token))
        .await
        .expect("authenticate");
    id
}
