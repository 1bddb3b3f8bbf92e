//! End-to-end throughput benchmark for Courier.
//!
//! Measures real WebSocket room fan-out against a running server. The
//! default room limits will throttle this load; raise them and tighten the
//! queue tick in `courier.toml` before running:
//!
//! ```toml
//! [rooms]
//! messages_per_user = 1000000
//! messages_per_room = 1000000
//!
//! [queue]
//! process_interval_ms = 10
//! batch_size = 1000
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::HmacAuthenticator;
use courier_protocol::{codec, Envelope, EnvelopeKind};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Barrier};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn auth_secret() -> String {
    std::env::var("COURIER_AUTH_SECRET").unwrap_or_else(|_| "courier-dev-secret".to_string())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Courier End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("║  Raise the [rooms] rate limits in courier.toml for this load ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_room_benchmark(num_clients).await;
}

async fn run_room_benchmark(num_clients: usize) {
    println!("📊 Room fan-out benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let throttled = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let throttled = Arc::clone(&throttled);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, received, throttled, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to finish the handshake
    barrier.wait().await;
    println!("✓ All {} clients authenticated and joined '{}'", num_clients, ROOM);

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counters and start measurement
    received.store(0, Ordering::SeqCst);
    throttled.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = received.load(Ordering::SeqCst);
    let total_throttled = throttled.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Messages received:    {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!(
        "║  Rate-limit errors:    {:>10}                           ║",
        total_throttled
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    if total_throttled > 0 {
        println!();
        println!("⚠ The server throttled publishes; raise the [rooms] limits.");
    }

    // Signal clients to stop
    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    received: Arc<AtomicU64>,
    throttled: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> BoxResult<()> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Greeting first, then authenticate and join the benchmark room.
    expect_kind(&mut receiver, EnvelopeKind::Connect).await?;

    let user = format!("bench-{client_id}");
    let token = HmacAuthenticator::new(auth_secret()).token_for(&user);
    send_envelope(&mut sender, &Envelope::authenticate(token, &user)).await?;
    expect_kind(&mut receiver, EnvelopeKind::AuthSuccess).await?;

    send_envelope(&mut sender, &Envelope::room_join(ROOM)).await?;
    expect_kind(&mut receiver, EnvelopeKind::RoomJoin).await?;

    // Wait for all clients to be ready
    barrier.wait().await;

    // The receiver counts fan-out and reports server pings through the
    // channel so the sender can answer them between publishes.
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<()>();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(envelope) = codec::decode(&text) else { continue };
            match envelope.kind {
                EnvelopeKind::RoomMessage => {
                    received.fetch_add(1, Ordering::Relaxed);
                }
                EnvelopeKind::Error => {
                    throttled.fetch_add(1, Ordering::Relaxed);
                }
                EnvelopeKind::Ping => {
                    let _ = ping_tx.send(());
                }
                _ => {}
            }
        }
    });

    // Send loop. Payloads carry a sequence number so deduplication never
    // collapses them.
    let mut seq = 0u64;
    loop {
        while ping_rx.try_recv().is_ok() {
            send_envelope(&mut sender, &Envelope::pong()).await?;
        }

        let envelope = Envelope::room_message(ROOM, json!({ "from": client_id, "seq": seq }));
        seq += 1;
        if send_envelope(&mut sender, &envelope).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

async fn send_envelope<S>(sender: &mut S, envelope: &Envelope) -> BoxResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = codec::encode(envelope)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

/// Read frames until one of `kind` arrives. Fails fast on a refusal.
async fn expect_kind<S>(receiver: &mut S, kind: EnvelopeKind) -> BoxResult<()>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = receiver.next().await {
        if let Message::Text(text) = frame? {
            let envelope = codec::decode(&text)?;
            if envelope.kind == kind {
                return Ok(());
            }
            if matches!(envelope.kind, EnvelopeKind::AuthFailure | EnvelopeKind::Error) {
                return Err(format!("handshake refused: {text}").into());
            }
        }
    }
    Err("connection closed during handshake".into())
}
