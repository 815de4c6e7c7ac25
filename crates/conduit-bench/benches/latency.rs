//! Latency benchmarks for Conduit.
//!
//! These benchmarks time single requests through the dispatcher and the
//! per-connection multiplexer.

use conduit_protocol::{RequestPayload, WireFormat, WireFrame};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tenvis_conduit_bench::{dispatcher, widget_binding, widget_data};
use tenvis_conduit_core::{
    BindingRegistry, ConnectionId, DispatchContext, GroupKey, Identity, Multiplexer, ReplyChannel,
};
use tokio::runtime::Runtime;

/// Benchmark built-in actions through the dispatcher.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let rt = Runtime::new().unwrap();

    let binding = widget_binding();
    let (dispatcher, _groups) = dispatcher();
    let identity = Identity::Anonymous;
    let (reply, _rx) = ReplyChannel::bounded(ConnectionId::new("bench"), 1);

    // Seed enough records for retrieve and list to hit real data.
    rt.block_on(async {
        for i in 0..100 {
            let ctx = DispatchContext {
                identity: &identity,
                reply: &reply,
            };
            let request = RequestPayload::new("create").with_data(widget_data(i));
            dispatcher.dispatch(&binding, ctx, request).await;
        }
    });

    let (binding, dispatcher, identity, reply) = (&binding, &dispatcher, &identity, &reply);

    group.bench_function("create", |b| {
        b.to_async(&rt).iter(move || async move {
            let ctx = DispatchContext { identity, reply };
            let request = RequestPayload::new("create")
                .with_request_id(1)
                .with_data(widget_data(16));
            dispatcher.dispatch(binding, ctx, black_box(request)).await
        });
    });

    group.bench_function("retrieve", |b| {
        b.to_async(&rt).iter(move || async move {
            let ctx = DispatchContext { identity, reply };
            let request = RequestPayload::new("retrieve").with_pk(50);
            dispatcher.dispatch(binding, ctx, black_box(request)).await
        });
    });

    group.bench_function("list_page", |b| {
        b.to_async(&rt).iter(move || async move {
            let ctx = DispatchContext { identity, reply };
            let request = RequestPayload::new("list").with_data(json!({"page": 2}));
            dispatcher.dispatch(binding, ctx, black_box(request)).await
        });
    });

    group.finish();
}

/// Benchmark a request frame through decode, dispatch and reply queueing.
fn bench_multiplexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplexer");
    let rt = Runtime::new().unwrap();

    let mut bindings = BindingRegistry::new();
    bindings.register(widget_binding()).unwrap();
    let bindings = Arc::new(bindings);
    let (dispatcher, _groups) = dispatcher();

    let (reply, mut rx) = ReplyChannel::bounded(ConnectionId::new("bench"), 16);
    let mut mux = Multiplexer::new(bindings, dispatcher, reply, WireFormat::Json);
    let frame = WireFrame::Text(
        json!({
            "stream": "widget",
            "payload": {"action": "create", "request_id": 1, "data": {"name": "A"}}
        })
        .to_string(),
    );

    group.bench_function("receive_create", |b| {
        b.iter(|| {
            rt.block_on(async {
                let outcome = mux.receive(black_box(&frame)).await.unwrap();
                rx.recv().await;
                outcome
            })
        });
    });

    group.finish();
}

/// Benchmark membership lookups on a populated registry.
fn bench_subscription_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription_lookup");

    // Setup: 1000 instance groups with 10 subscribers each
    let (_dispatcher, registry) = dispatcher();
    let mut receivers = Vec::new();
    for i in 0..1000 {
        let key = GroupKey::for_instance("widget", "update", &json!(i));
        for j in 0..10 {
            let (reply, rx) = ReplyChannel::bounded(ConnectionId::new(format!("conn-{i}-{j}")), 1);
            let _ = registry.join(&reply, key.clone());
            receivers.push(rx);
        }
    }

    group.bench_function("group_exists", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = GroupKey::for_instance("widget", "update", &json!(i % 1000));
            i += 1;
            registry.group_exists(black_box(&key))
        });
    });

    group.bench_function("subscriber_count", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = GroupKey::for_instance("widget", "update", &json!(i % 1000));
            i += 1;
            registry.subscriber_count(black_box(&key))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch,
    bench_multiplexer,
    bench_subscription_lookup,
);
criterion_main!(benches);
