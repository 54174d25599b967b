//! Performance benchmarks for the output paths.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Output routing through the resize gate
//! - Event encoding for the command surface
//! - Event fan-out to subscribers

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::SessionEvent;
use termdeck::ipc::IpcResponse;
use termdeck::resize::{ContainerSize, ResizeGate};
use termdeck::session::EventBus;

/// Benchmark chunk routing with the gate open and during a resize.
fn bench_gate_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate_routing");
    let chunk = Bytes::from(vec![b'x'; 4096]);
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("deliver_4KB", |b| {
        let mut gate = ResizeGate::new(100);
        gate.mark_ready(Some((80, 24)));
        b.iter(|| black_box(gate.on_data(chunk.clone())));
    });

    group.bench_function("queue_and_flush_100x4KB", |b| {
        let mut gate = ResizeGate::new(100);
        gate.mark_ready(Some((80, 24)));
        let mut width = 800.0;
        b.iter(|| {
            width += 1.0;
            gate.on_container(ContainerSize::new(width, 480.0));
            for _ in 0..100 {
                black_box(gate.on_data(chunk.clone()));
            }
            gate.on_dimensions(100, 30);
            black_box(gate.finish())
        });
    });

    group.finish();
}

/// Benchmark encoding a data event as a command-surface line.
fn bench_event_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_encoding");

    for size in [64usize, 4096, 65536] {
        let event = IpcResponse::Event(SessionEvent::Data {
            terminal_id: "3f2c9a1e-terminal".to_string(),
            data: vec![b'a'; size],
        });
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("data_{}B", size), |b| {
            b.iter(|| {
                let mut line = serde_json::to_string(black_box(&event)).unwrap();
                line.push('\n');
                line
            });
        });
    }

    group.finish();
}

/// Benchmark publishing to several subscribers.
fn bench_event_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_fanout");

    for subscribers in [1usize, 4, 16] {
        let bus = EventBus::new();
        let mut receivers: Vec<_> = (0..subscribers).map(|_| bus.subscribe().1).collect();
        let event = SessionEvent::Data {
            terminal_id: "t1".to_string(),
            data: vec![0u8; 1024],
        };

        group.bench_function(format!("publish_to_{}", subscribers), |b| {
            b.iter(|| {
                bus.publish(black_box(event.clone()));
                for rx in receivers.iter_mut() {
                    black_box(rx.try_recv().ok());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_gate_routing,
    bench_event_encoding,
    bench_event_fanout,
);

criterion_main!(benches);
