//! Protocol encoding/decoding benchmarks.

use baas_protocol::{Decoder, Encoder, Frame, Request, Response};
use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const HASH: &str = "$2b$10$fpXVmA0Jm1vQyVbKDM6mZuLnW2wI8SS9z1VpDXxvMKJ8P2HRuZt7G";

fn create_test_request(password_len: usize) -> Request {
    Request::compare("bench-1", "x".repeat(password_len), HASH)
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [64, 1000, 10000] {
        let frame = Frame::new(Bytes::from("x".repeat(size)));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [64, 1000, 10000] {
        let encoded = Frame::new(Bytes::from("x".repeat(size))).encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_request_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("request");

    for len in [8, 72] {
        let request = create_test_request(len);
        let encoded = Encoder::encode_request(&request).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("encode", len), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", len), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_request().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let response = Response::hashed("bench-1", HASH);
    let encoded = Encoder::encode_response(&response).unwrap();

    c.bench_function("response_decode", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.extend(&encoded);
            black_box(decoder.decode_response().unwrap())
        });
    });
}

/// Many small frames arriving in one read, as on a busy pipelined connection.
fn bench_pipelined_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipelined_decode");

    for count in [10, 100] {
        let mut stream = BytesMut::new();
        for i in 0..count {
            let response = Response::hashed(i.to_string(), HASH);
            stream.extend_from_slice(&Encoder::encode_response(&response).unwrap());
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(stream);
                let mut decoded = 0;
                while let Some(response) = decoder.decode_response().unwrap() {
                    black_box(response);
                    decoded += 1;
                }
                decoded
            });
        });
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [64, 1000, 10000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_request_roundtrip,
    bench_response_decode,
    bench_pipelined_decode,
    bench_crc32c,
);

criterion_main!(benches);
