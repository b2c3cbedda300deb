//! Benchmarks for the object header and preamble codec.

use atbu_backup_core::codec::{ObjectHeader, Preamble, PreambleCompression};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_header_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("header");

    let plain = ObjectHeader::plain();
    let encrypted = ObjectHeader::with_iv([7u8; 16]);

    group.bench_function("encode_plain", |b| {
        b.iter(|| black_box(plain.encode()));
    });

    group.bench_function("encode_with_iv", |b| {
        b.iter(|| black_box(encrypted.encode()));
    });

    let encoded = encrypted.encode();
    group.bench_function("parse_with_iv", |b| {
        b.iter(|| black_box(ObjectHeader::parse(&encoded).unwrap()));
    });

    group.finish();
}

fn preamble_for(path_len: usize) -> Preamble {
    Preamble {
        compression: PreambleCompression::Gzip,
        digest_algorithm: "sha256".to_string(),
        digest_hex: "a".repeat(64),
        size: 123_456,
        modified: 1_700_000_000.5,
        accessed: 1_700_000_001.25,
        path_without_root: "x".repeat(path_len),
    }
}

fn bench_preamble_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("preamble");

    for path_len in [16usize, 256, 4096].iter() {
        let preamble = preamble_for(*path_len);

        group.bench_with_input(
            BenchmarkId::new("encode", path_len),
            &preamble,
            |b, preamble| {
                b.iter(|| black_box(preamble.encode().unwrap()));
            },
        );

        let encoded = preamble.encode().unwrap();
        group.bench_with_input(
            BenchmarkId::new("parse", path_len),
            &encoded,
            |b, encoded| {
                b.iter(|| black_box(Preamble::parse(encoded).unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_header_roundtrip, bench_preamble_roundtrip);
criterion_main!(benches);
