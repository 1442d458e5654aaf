//! Audio queue and packet framing throughput
//!
//! One 10 ms stereo chunk at 44.1 kHz is the unit of work on the hot path:
//! the producer pushes it into every endpoint queue and each sender frames
//! it into datagrams.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use lan_media_relay::audio::{AudioChunk, AudioQueue};
use lan_media_relay::constants::MAX_DATAGRAM_PAYLOAD;
use lan_media_relay::network::PacketFramer;

fn chunk() -> AudioChunk {
    AudioChunk::new(0, 2, 44_100, vec![1_000i16; 441 * 2]).unwrap()
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("audio_queue");

    group.bench_function("push_pop_10ms", |b| {
        let queue = AudioQueue::new(Duration::from_secs(1));
        let chunk = chunk();
        b.iter(|| {
            queue.push(black_box(chunk.clone()));
            black_box(queue.try_pop());
        });
    });

    group.bench_function("fill_and_drain_1s", |b| {
        let queue = AudioQueue::new(Duration::from_secs(1));
        let chunk = chunk();
        b.iter(|| {
            while queue.push(chunk.clone()) {}
            while let Some(c) = queue.try_pop() {
                black_box(c);
            }
        });
    });

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    group.bench_function("udp_10ms", |b| {
        let mut framer = PacketFramer::new(Some(MAX_DATAGRAM_PAYLOAD));
        let chunk = chunk();
        b.iter(|| black_box(framer.frame(black_box(&chunk))));
    });

    group.finish();
}

criterion_group!(benches, bench_queue, bench_framing);
criterion_main!(benches);
