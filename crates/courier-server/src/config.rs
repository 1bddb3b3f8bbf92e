//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file
//! - Command line arguments (future)

use anyhow::{Context, Result};
use courier_core::{DeliveryConfig, PresenceConfig, RegistryConfig, RoomSettings};
use courier_transport::WebSocketSinkConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Admission and resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Presence tracking configuration.
    #[serde(default)]
    pub presence: PresenceSection,

    /// Delivery queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Defaults applied to rooms created on first join.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// How long a send may wait on a full outbound buffer before the frame
    /// is reported as backpressured, in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for HMAC token validation.
    #[serde(default = "default_auth_secret")]
    pub secret: String,

    /// How long a connection may stay unauthenticated before it is closed,
    /// in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// How long to wait for a pong before disconnecting, in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,
}

/// Admission and resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneous connections per client IP.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Maximum simultaneous connections per authenticated user.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Country codes refused at accept time. Empty allows all.
    #[serde(default)]
    pub blocked_countries: Vec<String>,

    /// Subprotocol names accepted when the client requests one. Empty
    /// allows any.
    #[serde(default)]
    pub allowed_protocols: Vec<String>,

    /// Outbound frames buffered per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Presence tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Online becomes Away after this much inactivity, in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// A user with no connections becomes Offline after this much
    /// inactivity, in milliseconds.
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_ms: u64,

    /// How often the demotion sweep runs, in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Delivery queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum messages held per queue kind.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Default retry budget per message.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds (scaled linearly by attempt).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Window within which identical submissions are deduplicated, in
    /// milliseconds.
    #[serde(default = "default_deduplication_window")]
    pub deduplication_window_ms: u64,

    /// Maximum dead-letter entries kept (oldest evicted first).
    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,

    /// How often the queue processor ticks, in milliseconds.
    #[serde(default = "default_process_interval")]
    pub process_interval_ms: u64,

    /// Messages processed per queue per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Defaults for rooms auto-created on first join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Maximum member count.
    #[serde(default = "default_room_max_members")]
    pub max_members: usize,

    /// Maximum message payload size in bytes.
    #[serde(default = "default_room_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Messages one member may send per rate window.
    #[serde(default = "default_messages_per_user")]
    pub messages_per_user: u32,

    /// Messages the whole room may carry per rate window.
    #[serde(default = "default_messages_per_room")]
    pub messages_per_room: u32,

    /// Width of the sliding rate window, in milliseconds.
    #[serde(default = "default_rate_window")]
    pub rate_window_ms: u64,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_events_capacity")]
    pub capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_auth_secret() -> String {
    std::env::var("COURIER_AUTH_SECRET").unwrap_or_else(|_| "courier-dev-secret".to_string())
}

fn default_auth_timeout() -> u64 {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_pong_timeout() -> u64 {
    10_000
}

fn default_max_connections_per_ip() -> usize {
    10
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_offline_timeout() -> u64 {
    600_000 // 10 minutes
}

fn default_sweep_interval() -> u64 {
    30_000
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_deduplication_window() -> u64 {
    5_000
}

fn default_dead_letter_max_size() -> usize {
    1_000
}

fn default_process_interval() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_room_max_members() -> usize {
    100
}

fn default_room_max_message_bytes() -> usize {
    64 * 1024
}

fn default_messages_per_user() -> u32 {
    10
}

fn default_messages_per_room() -> u32 {
    100
}

fn default_rate_window() -> u64 {
    10_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: LimitsConfig::default(),
            presence: PresenceSection::default(),
            queue: QueueConfig::default(),
            rooms: RoomsConfig::default(),
            events: EventsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_auth_secret(),
            timeout_ms: default_auth_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            pong_timeout_ms: default_pong_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections_per_ip(),
            max_connections_per_user: default_max_connections_per_user(),
            max_message_size: default_max_message_size(),
            blocked_countries: Vec::new(),
            allowed_protocols: Vec::new(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            offline_timeout_ms: default_offline_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            deduplication_window_ms: default_deduplication_window(),
            dead_letter_max_size: default_dead_letter_max_size(),
            process_interval_ms: default_process_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_members: default_room_max_members(),
            max_message_bytes: default_room_max_message_bytes(),
            messages_per_user: default_messages_per_user(),
            messages_per_room: default_messages_per_room(),
            rate_window_ms: default_rate_window(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_events_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Admission policy for the connection registry.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_connections_per_ip: self.limits.max_connections_per_ip,
            max_connections_per_user: self.limits.max_connections_per_user,
            blocked_countries: self.limits.blocked_countries.clone(),
            allowed_protocols: self.limits.allowed_protocols.clone(),
        }
    }

    /// Presence tracker timeouts.
    #[must_use]
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            idle_timeout: Duration::from_millis(self.presence.idle_timeout_ms),
            offline_timeout: Duration::from_millis(self.presence.offline_timeout_ms),
        }
    }

    /// Delivery engine tuning.
    #[must_use]
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_queue_size: self.queue.max_queue_size,
            max_retries: self.queue.max_retries,
            retry_delay: Duration::from_millis(self.queue.retry_delay_ms),
            deduplication_window: Duration::from_millis(self.queue.deduplication_window_ms),
            dead_letter_max_size: self.queue.dead_letter_max_size,
            batch_size: self.queue.batch_size,
        }
    }

    /// Per-connection outbound sink tuning.
    #[must_use]
    pub fn sink_config(&self) -> WebSocketSinkConfig {
        WebSocketSinkConfig {
            outbound_buffer: self.limits.outbound_buffer,
            send_timeout: Duration::from_millis(self.transport.send_timeout_ms),
        }
    }

    /// Settings applied to rooms created on first join.
    #[must_use]
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_members: self.rooms.max_members,
            max_message_bytes: self.rooms.max_message_bytes,
            messages_per_user: self.rooms.messages_per_user,
            messages_per_room: self.rooms.messages_per_room,
            rate_window: Duration::from_millis(self.rooms.rate_window_ms),
            ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.limits.max_connections_per_user, 5);
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 4100;
        let addr = config.bind_addr();
        assert_eq!(addr.port(), 4100);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            timeout_ms = 2500

            [queue]
            max_queue_size = 500

            [limits]
            blocked_countries = ["XX"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth.timeout_ms, 2500);
        assert_eq!(config.queue.max_queue_size, 500);
        assert_eq!(config.limits.blocked_countries, vec!["XX".to_string()]);
        // Unspecified sections keep their defaults.
        assert_eq!(config.queue.batch_size, 100);
        assert_eq!(config.presence.sweep_interval_ms, 30_000);
    }

    #[test]
    fn test_component_config_conversions() {
        let mut config = Config::default();
        config.queue.retry_delay_ms = 250;
        config.presence.idle_timeout_ms = 60_000;
        config.rooms.max_members = 2;

        assert_eq!(
            config.delivery_config().retry_delay,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.presence_config().idle_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(config.room_settings().max_members, 2);
        assert!(config.room_settings().ttl.is_none());
    }
}
