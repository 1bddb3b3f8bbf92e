//! End-to-end WebSocket session tests.
//!
//! Each test binds a real server to an ephemeral port and drives it with
//! tokio-tungstenite clients through the full exchange: greeting,
//! authentication, room traffic, and queued delivery.

use std::net::SocketAddr;
use std::sync::Arc;

use courier_core::{EnqueueRequest, HmacAuthenticator, QueueKind, Target};
use courier_protocol::{codec, ConnectGreeting, Envelope, EnvelopeKind};
use courier_server::config::Config;
use courier_server::handlers::{self, AppState};
use courier_server::tasks;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "ws-session-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.secret = SECRET.to_string();
    config.auth.timeout_ms = 5_000;
    config.queue.process_interval_ms = 25;
    // Keep background pings out of the frame stream under inspection.
    config.heartbeat.interval_ms = 60_000;
    config.metrics.enabled = false;
    config
}

/// Start a server on a free port, returning its address and shared state.
async fn start_server(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(config));
    tasks::spawn(&state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, Arc::clone(&state)));
    (addr, state)
}

async fn send(client: &mut Client, envelope: &Envelope) {
    let text = codec::encode(envelope).unwrap();
    client.send(Message::Text(text)).await.unwrap();
}

/// Next text frame decoded as an envelope. Panics on timeout or close.
async fn recv(client: &mut Client) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return codec::decode(&text).expect("undecodable frame"),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Connect and consume the greeting.
async fn connect(addr: SocketAddr) -> (Client, ConnectGreeting) {
    let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let envelope = recv(&mut client).await;
    assert_eq!(envelope.kind, EnvelopeKind::Connect);
    let greeting: ConnectGreeting = envelope.parse_data().unwrap();
    (client, greeting)
}

/// Connect and authenticate as `user`.
async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let (mut client, _) = connect(addr).await;
    let token = HmacAuthenticator::new(SECRET).token_for(user);
    send(&mut client, &Envelope::authenticate(token, user)).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.kind, EnvelopeKind::AuthSuccess);
    client
}

#[tokio::test]
async fn test_session_handshake_and_room_fanout() {
    let (addr, _state) = start_server(test_config()).await;

    let (mut alice, greeting) = connect(addr).await;
    assert!(!greeting.connection_id.is_empty());
    assert_eq!(greeting.heartbeat_ms, 60_000);

    let token = HmacAuthenticator::new(SECRET).token_for("alice");
    send(&mut alice, &Envelope::authenticate(token, "alice")).await;
    assert_eq!(recv(&mut alice).await.kind, EnvelopeKind::AuthSuccess);

    let mut bob = connect_as(addr, "bob").await;

    // Both join the same room; the server echoes each join back.
    send(&mut alice, &Envelope::room_join("lobby")).await;
    assert_eq!(recv(&mut alice).await.kind, EnvelopeKind::RoomJoin);
    send(&mut bob, &Envelope::room_join("lobby")).await;
    assert_eq!(recv(&mut bob).await.kind, EnvelopeKind::RoomJoin);

    // Alice publishes; bob receives the fan-out attributed to her.
    send(&mut alice, &Envelope::room_message("lobby", json!({"text": "hi"}))).await;
    let delivered = recv(&mut bob).await;
    assert_eq!(delivered.kind, EnvelopeKind::RoomMessage);
    assert_eq!(delivered.user_id.as_deref(), Some("alice"));
    assert_eq!(delivered.data["content"]["text"], "hi");

    // The sender is excluded: after the fan-out settles, the first frame
    // alice sees is the reply to her own ping.
    sleep(Duration::from_millis(100)).await;
    send(&mut alice, &Envelope::ping()).await;
    assert_eq!(recv(&mut alice).await.kind, EnvelopeKind::Pong);
}

#[tokio::test]
async fn test_queued_message_delivered_after_connect() {
    let (addr, state) = start_server(test_config()).await;

    // Queue a direct message for a user who has not connected yet.
    let envelope = Envelope::message(json!({"text": "welcome back"})).with_user("system");
    let payload = serde_json::to_value(&envelope).unwrap();
    state
        .engine
        .enqueue(EnqueueRequest::new(
            Target::User("carol".to_string()),
            payload,
            QueueKind::Fifo,
        ))
        .await;

    // Ticks pass with carol offline; the message stays queued.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.engine.depth(QueueKind::Fifo), 1);

    let mut carol = connect_as(addr, "carol").await;
    let delivered = recv(&mut carol).await;
    assert_eq!(delivered.kind, EnvelopeKind::Message);
    assert_eq!(delivered.data["text"], "welcome back");
}

#[tokio::test]
async fn test_auth_timeout_closes_connection() {
    let mut config = test_config();
    config.auth.timeout_ms = 200;
    let (addr, state) = start_server(config).await;

    let (mut client, _) = connect(addr).await;

    // No credentials are sent. The failure notice arrives, then the close.
    let failure = recv(&mut client).await;
    assert_eq!(failure.kind, EnvelopeKind::AuthFailure);
    assert_eq!(failure.data["error"], "Authentication timeout");

    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("websocket error");
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 1000);
            assert_eq!(close.reason, "Authentication timeout");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(state.registry.stats().auth_failures, 1);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_invalid_token_rejected_without_close() {
    let (addr, _state) = start_server(test_config()).await;

    let (mut client, _) = connect(addr).await;
    send(&mut client, &Envelope::authenticate("deadbeef", "mallory")).await;
    assert_eq!(recv(&mut client).await.kind, EnvelopeKind::AuthFailure);

    // The connection survives for another attempt.
    let token = HmacAuthenticator::new(SECRET).token_for("mallory");
    send(&mut client, &Envelope::authenticate(token, "mallory")).await;
    assert_eq!(recv(&mut client).await.kind, EnvelopeKind::AuthSuccess);
}

#[tokio::test]
async fn test_unauthenticated_room_join_rejected() {
    let (addr, _state) = start_server(test_config()).await;

    let (mut client, _) = connect(addr).await;
    send(&mut client, &Envelope::room_join("lobby")).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    assert_eq!(reply.data["error"], "Not authenticated");
}

#[tokio::test]
async fn test_room_capacity_rejects_join() {
    let mut config = test_config();
    config.rooms.max_members = 1;
    let (addr, _state) = start_server(config).await;

    let mut alice = connect_as(addr, "alice").await;
    send(&mut alice, &Envelope::room_join("tiny")).await;
    assert_eq!(recv(&mut alice).await.kind, EnvelopeKind::RoomJoin);

    let mut bob = connect_as(addr, "bob").await;
    send(&mut bob, &Envelope::room_join("tiny")).await;
    assert_eq!(recv(&mut bob).await.kind, EnvelopeKind::Error);
}
