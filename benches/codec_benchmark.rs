//! Codec benchmarks
//!
//! - SHA-1 and Base64 (handshake accept key)
//! - WebSocket frame encode/decode
//! - HTTP request parsing and chunked decoding

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gamewire::crypto::{base64, Sha1};
use gamewire::protocol::compute_accept_key;
use gamewire::protocol::http::{decode_chunked, parse_request};
use gamewire::protocol::websocket::{decode_frame, encode_frame, Opcode, Role};

const UPGRADE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: localhost:8080\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";

fn bench_crypto(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto");

    group.bench_function("accept_key", |b| {
        b.iter(|| compute_accept_key(black_box("dGhlIHNhbXBsZSBub25jZQ==")))
    });

    for size in [64usize, 4096] {
        let data = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("sha1", size), &data, |b, data| {
            b.iter(|| Sha1::digest(black_box(data)))
        });
        group.bench_with_input(BenchmarkId::new("base64_encode", size), &data, |b, data| {
            b.iter(|| base64::encode(black_box(data)))
        });
    }

    group.finish();
}

fn bench_websocket_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("websocket");

    for size in [16usize, 1024, 65_536] {
        let payload = vec![b'x'; size];
        let masked = encode_frame(true, Opcode::Binary, &payload, Some([1, 2, 3, 4]));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_masked", size), &payload, |b, payload| {
            b.iter(|| encode_frame(true, Opcode::Binary, black_box(payload), Some([1, 2, 3, 4])))
        });
        group.bench_with_input(BenchmarkId::new("decode_masked", size), &masked, |b, frame| {
            b.iter(|| decode_frame(black_box(frame), Role::Server, usize::MAX))
        });
    }

    group.finish();
}

fn bench_http(c: &mut Criterion) {
    let mut group = c.benchmark_group("http");

    group.throughput(Throughput::Bytes(UPGRADE_REQUEST.len() as u64));
    group.bench_function("parse_upgrade_request", |b| {
        b.iter(|| parse_request(black_box(UPGRADE_REQUEST), 1024 * 1024))
    });

    let mut chunked = Vec::new();
    for _ in 0..64 {
        chunked.extend_from_slice(b"10\r\n0123456789abcdef\r\n");
    }
    chunked.extend_from_slice(b"0\r\n\r\n");
    group.throughput(Throughput::Bytes(chunked.len() as u64));
    group.bench_function("decode_chunked", |b| {
        b.iter(|| decode_chunked(black_box(&chunked)))
    });

    group.finish();
}

criterion_group!(benches, bench_crypto, bench_websocket_frames, bench_http);
criterion_main!(benches);
