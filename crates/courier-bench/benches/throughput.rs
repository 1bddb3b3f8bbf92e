//! Throughput benchmarks for Courier.
//!
//! These benchmarks measure raw message throughput through the hot paths:
//! codec, admission, room membership, fan-out, and queue draining.

use std::sync::Arc;
use std::time::Instant;

use courier_bench::{connect_user, open_settings, stack, NullSink};
use courier_core::{ClientInfo, EnqueueRequest, QueueKind, RoomKind, Target};
use courier_protocol::{codec, Envelope};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

/// Benchmark envelope encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (label, size) in [("64B", 64_usize), ("1KB", 1024), ("64KB", 65536)] {
        let envelope = Envelope::room_message("bench", json!({ "data": "x".repeat(size) }));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(label, |b| b.iter(|| codec::encode(black_box(&envelope))));
    }

    group.finish();
}

/// Benchmark envelope decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (label, size) in [("64B", 64_usize), ("1KB", 1024), ("64KB", 65536)] {
        let envelope = Envelope::room_message("bench", json!({ "data": "x".repeat(size) }));
        let encoded = codec::encode(&envelope).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(label, |b| b.iter(|| codec::decode(black_box(&encoded))));
    }

    group.finish();
}

/// Benchmark connection admission churn and user lookup.
fn bench_registry(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry");

    group.bench_function("accept_close", |b| {
        let s = stack();
        b.iter(|| {
            let id = s
                .registry
                .accept(Arc::new(NullSink), ClientInfo::default())
                .unwrap();
            s.registry.mark_closed(&id, 1000, "done");
        });
    });

    group.bench_function("resolve_user", |b| {
        let s = stack();
        rt.block_on(async {
            for i in 0..1_000 {
                connect_user(&s.registry, &format!("user:{i}")).await;
            }
        });
        let mut i = 0u64;
        b.iter(|| {
            let user = format!("user:{}", i % 1_000);
            i += 1;
            s.registry.resolve_user(black_box(&user))
        });
    });

    group.finish();
}

/// Benchmark room membership operations.
fn bench_rooms(c: &mut Criterion) {
    let mut group = c.benchmark_group("rooms");

    group.bench_function("create", |b| {
        let s = stack();
        let mut i = 0u64;
        b.iter(|| {
            let room = format!("room:{i}");
            i += 1;
            s.router.create_room(&room, RoomKind::Public, open_settings())
        });
    });

    group.bench_function("join_leave", |b| {
        let s = stack();
        s.router
            .create_room("bench", RoomKind::Public, open_settings())
            .unwrap();
        b.iter(|| {
            s.router.join("bench", "churn").unwrap();
            s.router.leave("bench", "churn")
        });
    });

    group.finish();
}

/// Benchmark direct room fan-out across member counts.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10_usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let s = stack();
            s.router
                .create_room("broadcast", RoomKind::Public, open_settings())
                .unwrap();
            rt.block_on(async {
                for i in 0..size {
                    let user = format!("user:{i}");
                    connect_user(&s.registry, &user).await;
                    s.router.join("broadcast", &user).unwrap();
                }
            });
            let envelope = Envelope::room_message("broadcast", json!({ "data": "x".repeat(64) }));

            b.iter(|| {
                rt.block_on(s.router.broadcast("broadcast", black_box(&envelope), None, &[]))
            });
        });
    }

    group.finish();
}

/// Benchmark queue intake plus a delivery tick.
fn bench_queue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue");

    group.throughput(Throughput::Elements(100));
    group.bench_function("direct_tick_100", |b| {
        let s = stack();
        rt.block_on(connect_user(&s.registry, "drain"));
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for round in 0..iters {
                    for seq in 0..100u64 {
                        let envelope = Envelope::message(json!({ "round": round, "seq": seq }));
                        s.engine
                            .enqueue(EnqueueRequest::new(
                                Target::User("drain".to_string()),
                                serde_json::to_value(&envelope).unwrap(),
                                QueueKind::Fifo,
                            ))
                            .await;
                    }
                    s.engine.process_tick().await;
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("room_tick_100_members", |b| {
        let s = stack();
        s.router
            .create_room("fan", RoomKind::Public, open_settings())
            .unwrap();
        rt.block_on(async {
            for i in 0..100 {
                let user = format!("user:{i}");
                connect_user(&s.registry, &user).await;
                s.router.join("fan", &user).unwrap();
            }
        });
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for round in 0..iters {
                    let envelope = Envelope::room_message("fan", json!({ "round": round }));
                    s.engine
                        .enqueue(EnqueueRequest::new(
                            Target::Room("fan".to_string()),
                            serde_json::to_value(&envelope).unwrap(),
                            QueueKind::Broadcast,
                        ))
                        .await;
                    s.engine.process_tick().await;
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_registry,
    bench_rooms,
    bench_fanout,
    bench_queue,
);
criterion_main!(benches);
