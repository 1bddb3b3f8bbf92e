//! Connection handlers for the Courier server.
//!
//! This module handles the WebSocket lifecycle: admission, the greeting and
//! authentication handshake, frame dispatch, and teardown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use courier_core::{
    ClientInfo, ConnectionId, ConnectionRegistry, Credentials, DeliveryEngine, EnqueueRequest,
    Event, EventBus, HmacAuthenticator, MessageSink, PresenceStatus, PresenceTracker, QueueKind,
    RoomError, RoomKind, RoomRouter, Target, UserId,
};
use courier_protocol::{
    codec, AuthRequest, DirectMessage, Envelope, EnvelopeKind, PresenceUpdateBody,
    RoomMessageBody, RoomRequest,
};
use courier_transport::WebSocketSink;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections and their sinks.
    pub registry: Arc<ConnectionRegistry>,
    /// Rooms, memberships, and fan-out.
    pub router: Arc<RoomRouter>,
    /// Per-user presence records.
    pub presence: Arc<PresenceTracker>,
    /// Delivery queues and dead letters.
    pub engine: Arc<DeliveryEngine>,
    /// Bus wiring the components together.
    pub events: EventBus,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with all core components wired to one bus.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let events = EventBus::new(config.events.capacity);
        let authenticator = Arc::new(HmacAuthenticator::new(config.auth.secret.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            config.registry_config(),
            authenticator,
            events.clone(),
        ));
        let router = Arc::new(RoomRouter::new(Arc::clone(&registry), events.clone()));
        let presence = Arc::new(PresenceTracker::new(config.presence_config(), events.clone()));
        let engine = Arc::new(DeliveryEngine::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            config.delivery_config(),
            events.clone(),
        ));

        Self {
            registry,
            router,
            presence,
            engine,
            events,
            config,
        }
    }
}

/// Per-connection session state owned by the read loop.
#[derive(Default)]
struct Session {
    user_id: Option<UserId>,
}

/// Build the axum application over shared state.
#[must_use]
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    crate::tasks::spawn(&state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve an already-bound listener. Tests use this to run on an ephemeral
/// port.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = app(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let client = client_info(&headers, addr);
    let ws = ws.max_message_size(state.config.limits.max_message_size);
    let ws = if state.config.limits.allowed_protocols.is_empty() {
        ws
    } else {
        ws.protocols(state.config.limits.allowed_protocols.clone())
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, client))
}

/// Client details taken from the upgrade request.
fn client_info(headers: &HeaderMap, addr: SocketAddr) -> ClientInfo {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    ClientInfo {
        remote_addr: Some(addr.to_string()),
        user_agent: header_str("user-agent"),
        country: header_str("cf-ipcountry").map(|code| code.to_ascii_uppercase()),
        protocol: header_str("sec-websocket-protocol")
            .and_then(|offered| offered.split(',').next().map(|p| p.trim().to_string()))
            .filter(|p| !p.is_empty()),
    }
}

/// Handle a WebSocket connection from upgrade to teardown.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, client: ClientInfo) {
    let (writer, mut reader) = socket.split();
    let sink: Arc<dyn MessageSink> =
        Arc::new(WebSocketSink::spawn(writer, &state.config.sink_config()));

    let connection_id = match state.registry.accept(Arc::clone(&sink), client) {
        Ok(id) => id,
        Err(error) => {
            warn!(%error, "Connection refused");
            metrics::record_error("admission");
            sink.close(1008, &error.to_string()).await;
            return;
        }
    };

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    if let Err(error) = state.registry.mark_established(&connection_id) {
        error!(connection = %connection_id, %error, "Failed to establish connection");
        state.registry.mark_faulted(&connection_id, &error.to_string());
        return;
    }

    // Greet with the connection id and the ping cadence the client should
    // expect.
    let greeting = Envelope::connect(
        connection_id.to_string(),
        state.config.heartbeat.interval_ms,
    );
    if state.registry.send(&connection_id, &greeting).await.is_err() {
        error!(connection = %connection_id, "Failed to send greeting");
        state.registry.mark_closed(&connection_id, 1006, "Greeting failed");
        return;
    }

    debug!(connection = %connection_id, "WebSocket connected");

    let mut session = Session::default();
    let auth_deadline = tokio::time::sleep(Duration::from_millis(state.config.auth.timeout_ms));
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            () = &mut auth_deadline, if session.user_id.is_none() => {
                state.registry.record_auth_timeout(&connection_id);
                let _ = state
                    .registry
                    .send(&connection_id, &Envelope::auth_failure("Authentication timeout"))
                    .await;
                state
                    .registry
                    .close(&connection_id, 1000, "Authentication timeout")
                    .await;
                return;
            }

            incoming = reader.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let started = std::time::Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode(&text) {
                            Ok(envelope) => {
                                let keep_open = handle_envelope(
                                    &envelope,
                                    &connection_id,
                                    &mut session,
                                    &state,
                                )
                                .await;
                                if !keep_open {
                                    return;
                                }
                            }
                            Err(error) => {
                                debug!(connection = %connection_id, %error, "Undecodable frame");
                                metrics::record_error("decode");
                                send_error(&state, &connection_id, error.to_string()).await;
                            }
                        }

                        metrics::record_latency(started.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send_error(&state, &connection_id, "Binary frames are not supported")
                            .await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Protocol-level pings are answered by the library;
                        // liveness tracking uses envelope ping/pong.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(error)) => {
                        warn!(connection = %connection_id, %error, "WebSocket error");
                        metrics::record_error("websocket");
                        state.registry.mark_faulted(&connection_id, &error.to_string());
                        return;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state
        .registry
        .mark_closed(&connection_id, 1000, "Connection closed");
}

/// Dispatch one decoded envelope.
///
/// Returns `false` when the session should end. Handler errors are reported
/// to the client as `error` frames and never close the connection.
async fn handle_envelope(
    envelope: &Envelope,
    connection_id: &ConnectionId,
    session: &mut Session,
    state: &Arc<AppState>,
) -> bool {
    match envelope.kind {
        EnvelopeKind::Authenticate => {
            if session.user_id.is_some() {
                send_error(state, connection_id, "Already authenticated").await;
                return true;
            }
            let request: AuthRequest = match envelope.parse_data() {
                Ok(request) => request,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid authenticate payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            let credentials = Credentials::new(request.user_id, request.token);
            match state.registry.authenticate(connection_id, credentials).await {
                Ok(granted) => {
                    session.user_id = Some(granted.user_id.clone());
                    let reply = Envelope::auth_success(granted.user_id, granted.session_id);
                    let _ = state.registry.send(connection_id, &reply).await;
                }
                Err(error) => {
                    metrics::record_error("auth");
                    let _ = state
                        .registry
                        .send(connection_id, &Envelope::auth_failure(error.to_string()))
                        .await;
                }
            }
        }

        EnvelopeKind::Ping => {
            let _ = state.registry.send(connection_id, &Envelope::pong()).await;
        }

        EnvelopeKind::Pong => {
            state.registry.record_pong(connection_id);
        }

        EnvelopeKind::Heartbeat => {
            if let Some(user_id) = state.registry.touch(connection_id) {
                state.events.emit(Event::Activity { user_id });
            }
        }

        EnvelopeKind::RoomJoin => {
            let Some(user_id) = session.user_id.clone() else {
                send_error(state, connection_id, "Not authenticated").await;
                return true;
            };
            let request: RoomRequest = match envelope.parse_data() {
                Ok(request) => request,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid room_join payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            match join_room(state, &request.room_id, &user_id) {
                Ok(()) => {
                    state.registry.note_room_joined(connection_id, &request.room_id);
                    state
                        .presence
                        .set_current_room(&user_id, Some(request.room_id.clone()));
                    let _ = state
                        .registry
                        .send(connection_id, &Envelope::room_join(request.room_id))
                        .await;
                }
                Err(error) => {
                    debug!(connection = %connection_id, room = %request.room_id, %error, "Join refused");
                    send_error(state, connection_id, error.to_string()).await;
                }
            }
        }

        EnvelopeKind::RoomLeave => {
            let Some(user_id) = session.user_id.clone() else {
                send_error(state, connection_id, "Not authenticated").await;
                return true;
            };
            let request: RoomRequest = match envelope.parse_data() {
                Ok(request) => request,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid room_leave payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            if state.router.leave(&request.room_id, &user_id) {
                state.registry.note_room_left(connection_id, &request.room_id);
                let current = state
                    .presence
                    .get(&user_id)
                    .and_then(|record| record.current_room);
                if current.as_deref() == Some(request.room_id.as_str()) {
                    state.presence.set_current_room(&user_id, None);
                }
                let _ = state
                    .registry
                    .send(connection_id, &Envelope::room_leave(request.room_id))
                    .await;
            } else {
                send_error(
                    state,
                    connection_id,
                    format!("Not a member of room {}", request.room_id),
                )
                .await;
            }
        }

        EnvelopeKind::RoomMessage => {
            let Some(user_id) = session.user_id.clone() else {
                send_error(state, connection_id, "Not authenticated").await;
                return true;
            };
            let body: RoomMessageBody = match envelope.parse_data() {
                Ok(body) => body,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid room_message payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            let payload_len = body.content.to_string().len();
            if let Err(error) = state.router.check_publish(&body.room_id, &user_id, payload_len) {
                metrics::record_error("publish");
                send_error(state, connection_id, error.to_string()).await;
                return true;
            }

            let outbound = Envelope::room_message(body.room_id.clone(), body.content)
                .with_user(user_id.clone());
            match serde_json::to_value(&outbound) {
                Ok(payload) => {
                    let request =
                        EnqueueRequest::new(Target::Room(body.room_id), payload, QueueKind::Broadcast)
                            .with_exclude(vec![user_id]);
                    let queued = state.engine.enqueue(request).await;
                    debug!(connection = %connection_id, message = queued.id, "Room message queued");
                }
                Err(error) => {
                    send_error(state, connection_id, format!("Unserializable message: {error}"))
                        .await;
                }
            }
        }

        EnvelopeKind::Message => {
            let Some(user_id) = session.user_id.clone() else {
                send_error(state, connection_id, "Not authenticated").await;
                return true;
            };
            let message: DirectMessage = match envelope.parse_data() {
                Ok(message) => message,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid message payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            let kind = match message.kind.as_deref() {
                None => QueueKind::Fifo,
                Some(raw) => match queue_kind(raw) {
                    Some(kind) => kind,
                    None => {
                        send_error(state, connection_id, format!("Unknown queue kind: {raw}"))
                            .await;
                        return true;
                    }
                },
            };

            let outbound = Envelope::message(message.content).with_user(user_id);
            match serde_json::to_value(&outbound) {
                Ok(payload) => {
                    let mut request =
                        EnqueueRequest::new(Target::User(message.to), payload, kind);
                    if let Some(priority) = message.priority {
                        request = request.with_priority(priority);
                    }
                    let queued = state.engine.enqueue(request).await;
                    debug!(connection = %connection_id, message = queued.id, "Direct message queued");

                    // Sending counts as activity for the sender.
                    if let Some(sender) = state.registry.touch(connection_id) {
                        state.events.emit(Event::Activity { user_id: sender });
                    }
                }
                Err(error) => {
                    send_error(state, connection_id, format!("Unserializable message: {error}"))
                        .await;
                }
            }
        }

        EnvelopeKind::PresenceUpdate => {
            let Some(user_id) = session.user_id.clone() else {
                send_error(state, connection_id, "Not authenticated").await;
                return true;
            };
            let update: PresenceUpdateBody = match envelope.parse_data() {
                Ok(update) => update,
                Err(error) => {
                    send_error(
                        state,
                        connection_id,
                        format!("Invalid presence_update payload: {error}"),
                    )
                    .await;
                    return true;
                }
            };

            let Some(status) = presence_status(&update.status) else {
                send_error(
                    state,
                    connection_id,
                    format!("Unknown presence status: {}", update.status),
                )
                .await;
                return true;
            };
            state.presence.set_status(&user_id, status, update.metadata);
        }

        EnvelopeKind::Disconnect => {
            debug!(connection = %connection_id, "Client disconnect");
            state
                .registry
                .close(connection_id, 1000, "Client disconnect")
                .await;
            return false;
        }

        EnvelopeKind::Connect
        | EnvelopeKind::AuthSuccess
        | EnvelopeKind::AuthFailure
        | EnvelopeKind::Error => {
            debug!(
                connection = %connection_id,
                kind = envelope.kind.as_str(),
                "Ignoring server-origin frame"
            );
        }
    }

    true
}

/// Join a room, creating it with the configured defaults on first use.
fn join_room(state: &AppState, room_id: &str, user_id: &str) -> Result<(), RoomError> {
    match state.router.join(room_id, user_id) {
        Err(RoomError::NotFound(_)) => {
            let created =
                state
                    .router
                    .create_room(room_id, RoomKind::Public, state.config.room_settings());
            match created {
                // A concurrent join may have created it first.
                Ok(()) | Err(RoomError::AlreadyExists(_)) => state.router.join(room_id, user_id),
                Err(error) => Err(error),
            }
        }
        outcome => outcome,
    }
}

/// Send an `error` frame. Errors never close the connection.
async fn send_error(state: &AppState, connection_id: &ConnectionId, error: impl Into<String>) {
    let _ = state
        .registry
        .send(connection_id, &Envelope::error(error.into()))
        .await;
}

fn queue_kind(raw: &str) -> Option<QueueKind> {
    match raw {
        "fifo" => Some(QueueKind::Fifo),
        "priority" => Some(QueueKind::Priority),
        "delayed" => Some(QueueKind::Delayed),
        "broadcast" => Some(QueueKind::Broadcast),
        "persistent" => Some(QueueKind::Persistent),
        _ => None,
    }
}

fn presence_status(raw: &str) -> Option<PresenceStatus> {
    match raw {
        "online" => Some(PresenceStatus::Online),
        "away" => Some(PresenceStatus::Away),
        "busy" => Some(PresenceStatus::Busy),
        "offline" => Some(PresenceStatus::Offline),
        _ => None,
    }
}
