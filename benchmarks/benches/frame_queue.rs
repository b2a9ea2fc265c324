//! Channel queue latency
//!
//! Push/pop cost of the shared-memory frame queues behind participant
//! channels, raw and with JSON-encoded RPC messages.
//!
//! Run with: cargo bench --bench frame_queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use stimrt::communication::{FrameQueue, Message, RpcCall};
use stimrt_benchmarks::create_payload;

const PAYLOAD_SIZES: &[usize] = &[16, 256, 4096];

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_queue_push_pop");
    group.measurement_time(Duration::from_secs(3));
    let dir = tempfile::tempdir().unwrap();
    let queue = FrameQueue::create(dir.path(), "bench", 1 << 20).unwrap();

    for &size in PAYLOAD_SIZES {
        let payload = create_payload(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                queue.push(black_box(payload)).unwrap();
                black_box(queue.pop())
            });
        });
    }

    group.finish();
}

fn bench_rpc_message(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let queue = FrameQueue::create(dir.path(), "rpc", 1 << 20).unwrap();
    let message = Message::Rpc(
        RpcCall::new("display", "SineWave.set_frequency")
            .arg(2.0)
            .unwrap()
            .from_sender("gui"),
    );

    c.bench_function("rpc_encode_push_pop_decode", |b| {
        b.iter(|| {
            queue.push(&message.encode().unwrap()).unwrap();
            let frame = queue.pop().unwrap();
            black_box(Message::decode(&frame).unwrap())
        });
    });
}

criterion_group!(benches, bench_push_pop, bench_rpc_message);
criterion_main!(benches);
