//! Criterion benchmarks for the packet framer.
//!
//! Measures how quickly a stream of Write packets is reassembled when it
//! arrives whole, and when it trickles in a few bytes at a time.
//!
//! Run with:
//! ```bash
//! cargo bench --package brlapi-core --bench framer_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use brlapi_core::protocol::codec::encode_packet;
use brlapi_core::protocol::framer::{ChunkSource, FrameStatus, PacketFramer};
use brlapi_core::protocol::messages::PacketType;

fn make_stream(packets: usize, payload_len: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..packets {
        stream.extend(encode_packet(
            PacketType::Write.code(),
            &vec![i as u8; payload_len],
        ));
    }
    stream
}

fn drain(stream: &[u8], chunk: usize) -> usize {
    let mut framer = PacketFramer::new();
    let mut complete = 0;
    for piece in stream.chunks(chunk) {
        let mut src = ChunkSource::new(piece);
        loop {
            match framer.read_from(&mut src) {
                Ok(FrameStatus::Pending) => break,
                Ok(_) => complete += 1,
                Err(_) => return complete,
            }
        }
    }
    complete
}

fn bench_framer(c: &mut Criterion) {
    let stream = make_stream(64, 96);
    let mut group = c.benchmark_group("framer");
    for chunk in [7usize, 64, 4096] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| drain(black_box(&stream), chunk))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_framer);
criterion_main!(benches);
