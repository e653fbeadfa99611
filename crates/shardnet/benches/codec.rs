//! Framer throughput: decode a stream of packets delivered in read-sized
//! chunks, the way a framing worker sees it.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use shardnet::{Codec, LengthDelimited, LineDelimited};

const CHUNK: usize = 4096;

fn decode_all<C: Codec>(codec: &C, wire: &[u8]) -> usize {
    let mut packets = 0;
    let mut leftover = Vec::new();
    for chunk in wire.chunks(CHUNK) {
        let mut input = chunk;
        loop {
            let frame = codec.decode(input, std::mem::take(&mut leftover));
            input = &[];
            leftover = frame.leftover;
            if frame.ready {
                packets += frame.packet.is_some() as usize;
            }
            if frame.finished || !frame.ready {
                break;
            }
        }
    }
    packets
}

fn bench_codecs(c: &mut Criterion) {
    let payload = vec![b'x'; 100];

    let length = LengthDelimited::default();
    let mut length_wire = Vec::new();
    for _ in 0..10_000 {
        length.encode(&payload, &mut length_wire);
    }

    let line = LineDelimited::default();
    let mut line_wire = Vec::new();
    for _ in 0..10_000 {
        line.encode(&payload, &mut line_wire);
    }

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(length_wire.len() as u64));
    group.bench_function("length_delimited", |b| {
        b.iter_batched(
            || length_wire.clone(),
            |wire| black_box(decode_all(&length, &wire)),
            BatchSize::LargeInput,
        )
    });
    group.throughput(Throughput::Bytes(line_wire.len() as u64));
    group.bench_function("line_delimited", |b| {
        b.iter(|| black_box(decode_all(&line, &line_wire)))
    });
    group.finish();
}

criterion_group!(benches, bench_codecs);
criterion_main!(benches);
