//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of a node:
//! - Envelope encoding/decoding
//! - Dispatch through the component table
//! - Priority queue throughput

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use uuid::Uuid;
use wolpertinger::components::core;
use wolpertinger::registry::CallContext;
use wolpertinger::{ComponentRegistry, Priority, PriorityQueue, SessionState};
use wolpertinger_protocol::{Call, Envelope, ErrorCode, ErrorMessage, Response, Value};

/// Benchmark envelope serialization performance.
fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    // Small call (heartbeat)
    let heartbeat = Envelope::Call(Call::new("Core", "Heartbeat", vec![]));
    let heartbeat_text = heartbeat.to_text().unwrap();
    group.throughput(Throughput::Bytes(heartbeat_text.len() as u64));
    group.bench_function("encode_heartbeat", |b| {
        b.iter(|| black_box(&heartbeat).to_text().unwrap());
    });
    group.bench_function("decode_heartbeat", |b| {
        b.iter(|| Envelope::from_text(black_box(&heartbeat_text)).unwrap());
    });

    // Call carrying a 4 KiB payload
    let bulk = Envelope::Call(Call::new(
        "FileShare",
        "Store",
        vec![Value::Text("notes.txt".into()), Value::Bytes(vec![0u8; 4096])],
    ));
    let bulk_text = bulk.to_text().unwrap();
    group.throughput(Throughput::Bytes(bulk_text.len() as u64));
    group.bench_function("encode_bytes_4KB", |b| {
        b.iter(|| black_box(&bulk).to_text().unwrap());
    });
    group.bench_function("decode_bytes_4KB", |b| {
        b.iter(|| Envelope::from_text(black_box(&bulk_text)).unwrap());
    });

    // Replies
    let call = Call::new("Core", "GetVersion", vec![]);
    let response = Envelope::Response(Response::for_call(&call, Some(Value::Text("0.1.0".into()))));
    let error = Envelope::Error(ErrorMessage::for_call(&call, ErrorCode::NotAuthorized));
    group.bench_function("encode_response", |b| {
        b.iter(|| black_box(&response).to_text().unwrap());
    });
    group.bench_function("encode_error", |b| {
        b.iter(|| black_box(&error).to_text().unwrap());
    });

    group.finish();
}

/// Benchmark dispatch of inbound calls.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

    let mut registry = ComponentRegistry::new();
    core::register(&mut registry).unwrap();
    let dispatcher = registry.into_dispatcher();
    let session = Arc::new(SessionState::new());

    group.bench_function("heartbeat", |b| {
        b.iter(|| {
            let call = Call::new(core::COMPONENT, core::HEARTBEAT, vec![]);
            let ctx = CallContext::new("bench", call.call_id, Arc::clone(&session));
            runtime.block_on(dispatcher.dispatch(ctx, black_box(call)))
        });
    });

    group.bench_function("method_not_found", |b| {
        b.iter(|| {
            let call = Call::new(core::COMPONENT, "Missing", vec![]);
            let ctx = CallContext::new("bench", Uuid::new_v4(), Arc::clone(&session));
            runtime.block_on(dispatcher.dispatch(ctx, black_box(call)))
        });
    });

    group.bench_function("trust_level", |b| {
        b.iter(|| {
            let call = Call::new(core::COMPONENT, core::GET_TRUST_LEVEL, vec![]);
            let ctx = CallContext::new("bench", call.call_id, Arc::clone(&session));
            runtime.block_on(dispatcher.dispatch(ctx, black_box(call)))
        });
    });

    group.finish();
}

/// Benchmark priority queue add/take.
fn bench_priority_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue");
    let queue = PriorityQueue::new();

    group.bench_function("add_take_mixed", |b| {
        b.iter(|| {
            queue.add(1u32, Priority::Low);
            queue.add(2u32, Priority::High);
            queue.add(3u32, Priority::Normal);
            black_box((queue.take(), queue.take(), queue.take()))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_dispatch,
    bench_priority_queue,
);

criterion_main!(benches);
