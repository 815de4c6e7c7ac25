//! Throughput benchmarks for Conduit.
//!
//! These benchmarks measure envelope coding and group fan-out.

use conduit_protocol::{Envelope, EnvelopeCodec, RequestPayload, WireFormat};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tenvis_conduit_bench::widget_data;
use tenvis_conduit_core::{ChangeEvent, ChangeKind, ConnectionId, GroupKey, GroupRegistry, ReplyChannel};

fn create_envelope(size: usize) -> Envelope {
    Envelope::request(
        "widget",
        RequestPayload::new("create")
            .with_request_id(1)
            .with_data(widget_data(size)),
    )
}

/// Benchmark envelope encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for format in [WireFormat::Json, WireFormat::MessagePack] {
        let codec = EnvelopeCodec::new(format);
        for size in [16, 64] {
            let envelope = create_envelope(size);
            let encoded = codec.encode(&envelope).unwrap();
            group.throughput(Throughput::Bytes(encoded.len() as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{format:?}"), size),
                &envelope,
                |b, envelope| b.iter(|| codec.encode(black_box(envelope))),
            );
        }
    }

    group.finish();
}

/// Benchmark envelope decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for format in [WireFormat::Json, WireFormat::MessagePack] {
        let codec = EnvelopeCodec::new(format);
        for size in [16, 64] {
            let encoded = codec.encode(&create_envelope(size)).unwrap();
            group.throughput(Throughput::Bytes(encoded.len() as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{format:?}"), size),
                &encoded,
                |b, encoded| b.iter(|| codec.decode(black_box(encoded))),
            );
        }
    }

    group.finish();
}

/// Benchmark registry membership operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("join", |b| {
        let registry = GroupRegistry::new();
        let mut receivers = Vec::new();
        let mut i = 0u64;
        b.iter(|| {
            let (reply, rx) = ReplyChannel::bounded(ConnectionId::new(format!("conn-{i}")), 1);
            receivers.push(rx);
            i += 1;
            let _ = registry.join(&reply, GroupKey::new("widget", "create"));
        });
    });

    group.bench_function("join_leave", |b| {
        let registry = GroupRegistry::new();
        let (reply, _rx) = ReplyChannel::bounded(ConnectionId::new("conn-1"), 1);
        let key = GroupKey::new("widget", "update");
        b.iter(|| {
            let _ = registry.join(&reply, key.clone());
            registry.leave(reply.connection_id(), black_box(&key))
        });
    });

    group.finish();
}

/// Benchmark change notification fan-out.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    let event = ChangeEvent {
        kind: ChangeKind::Update,
        model: "inventory.widget".into(),
        pk: json!(1),
        data: json!({"id": 1, "name": "A"}),
    };
    let envelope = event.to_envelope("widget");
    let groups = event.groups("widget");

    for size in [10, 100, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let registry = GroupRegistry::new();
            let mut receivers: Vec<_> = (0..size)
                .map(|i| {
                    let (reply, rx) =
                        ReplyChannel::bounded(ConnectionId::new(format!("conn-{i}")), 4);
                    // Every third connection is in both groups.
                    registry.join(&reply, groups[i % 2].clone()).unwrap();
                    if i % 3 == 0 {
                        registry.join(&reply, groups[(i + 1) % 2].clone()).unwrap();
                    }
                    rx
                })
                .collect();

            b.iter(|| {
                let report = registry.broadcast(black_box(&groups), &envelope);
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                report
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_registry, bench_fanout);
criterion_main!(benches);
