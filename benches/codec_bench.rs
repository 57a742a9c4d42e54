//! Benchmarks for the wire codec

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nimbuskv::protocol::{codes, encode_message, FrameDecoder, Message};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [16usize, 256, 4096, 65536] {
        let message = Message::new(codes::PUT_REQ, vec![0xAB; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| encode_message(black_box(message)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [16usize, 256, 4096, 65536] {
        let frame = encode_message(&Message::new(codes::GET_RESP, vec![0xCD; size]));
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.push(black_box(frame));
                decoder.next_message().unwrap().unwrap()
            })
        });
    }
    group.finish();
}

fn bench_chunked_reassembly(c: &mut Criterion) {
    // A burst of frames delivered in read-sized chunks, the shape the
    // connection reader sees on the wire.
    let mut buf = Vec::new();
    for i in 0..64u8 {
        buf.extend_from_slice(&encode_message(&Message::new(codes::PUT_REQ, vec![i; 100])));
    }
    let stream = Bytes::from(buf);

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for chunk in [7usize, 64, 1024] {
        let stream = stream.clone();
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut frames = 0usize;
                for piece in stream.chunks(chunk) {
                    decoder.push(piece);
                    while let Some(message) = decoder.next_message().unwrap() {
                        black_box(&message);
                        frames += 1;
                    }
                }
                frames
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_chunked_reassembly);
criterion_main!(benches);
