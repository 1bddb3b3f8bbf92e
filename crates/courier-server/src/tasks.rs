//! Background tasks: heartbeats, queue processing, maintenance, and the
//! event forwarder gluing the bus to presence and the delivery engine.

use crate::handlers::AppState;
use crate::metrics;
use courier_core::Event;
use courier_protocol::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often sampled gauges are refreshed.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Spawn every background task for the server.
pub fn spawn(state: &Arc<AppState>) {
    tokio::spawn(forward_events(Arc::clone(state)));
    tokio::spawn(heartbeat_loop(Arc::clone(state)));
    tokio::spawn(queue_loop(Arc::clone(state)));
    tokio::spawn(maintenance_loop(Arc::clone(state)));
    if state.config.metrics.enabled {
        tokio::spawn(sampler_loop(Arc::clone(state)));
    }
}

/// Ping every authenticated connection, then reap the ones that fail to
/// answer within the pong timeout.
async fn heartbeat_loop(state: Arc<AppState>) {
    let pong_timeout = Duration::from_millis(state.config.heartbeat.pong_timeout_ms);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let ping = Envelope::ping();
        for id in state.registry.authenticated_ids() {
            state.registry.begin_ping(&id);
            if state.registry.send(&id, &ping).await.is_err() {
                debug!(connection = %id, "Ping send failed");
            }
        }

        tokio::time::sleep(pong_timeout).await;

        for id in state.registry.overdue_pings(pong_timeout) {
            info!(connection = %id, "Ping timeout");
            state.registry.close(&id, 1001, "Ping timeout").await;
        }
    }
}

/// Drive the delivery engine.
async fn queue_loop(state: Arc<AppState>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(state.config.queue.process_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let summary = state.engine.process_tick().await;
        if summary.attempted > 0 || summary.expired > 0 {
            debug!(
                attempted = summary.attempted,
                delivered = summary.delivered,
                retried = summary.retried,
                dead_lettered = summary.dead_lettered,
                expired = summary.expired,
                deferred = summary.deferred,
                "Queue tick"
            );
        }
    }
}

/// Presence sweep, room reaping, and dedup pruning.
async fn maintenance_loop(state: Arc<AppState>) {
    let offline_timeout = Duration::from_millis(state.config.presence.offline_timeout_ms);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(state.config.presence.sweep_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let demoted = state.presence.sweep();
        let reaped = state.router.reap_expired();
        let pruned = state.engine.prune_dedup();
        let dropped = state.presence.prune_offline(offline_timeout);

        if !demoted.is_empty() || !reaped.is_empty() || pruned > 0 || dropped > 0 {
            debug!(
                demoted = demoted.len(),
                rooms_reaped = reaped.len(),
                fingerprints_pruned = pruned,
                records_dropped = dropped,
                "Maintenance pass"
            );
        }
    }
}

/// Forward bus events into presence and the delivery engine, and count them.
async fn forward_events(state: Arc<AppState>) {
    let mut events = state.events.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                metrics::record_event(event.name());
                state.presence.apply(&event);
                if let Event::ConnectionClosed { connection_id, .. } = &event {
                    let dead = state.engine.handle_connection_closed(connection_id).await;
                    if dead > 0 {
                        debug!(connection = %connection_id, dead, "Dead-lettered in-flight messages");
                    }
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Event forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Refresh sampled gauges from component statistics.
async fn sampler_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let queues = state.engine.stats().await;
        metrics::sample(
            &state.registry.stats(),
            &state.router.stats(),
            &state.presence.stats(),
            &queues,
        );
    }
}
