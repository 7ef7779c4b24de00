//! Identifier codec and checksum benchmarks.
//!
//! The codec runs on every frame crossing the transport; both directions
//! should stay in the low-nanosecond range.

use canmon_can::frame::{apply_checksum, decode_id, encode_id, CanFrame};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn bench_encode_id(c: &mut Criterion) {
    c.bench_function("encode_id", |b| {
        b.iter(|| encode_id(black_box(3), black_box(0x155), black_box(0xBEEF)));
    });
}

fn bench_decode_id(c: &mut Criterion) {
    c.bench_function("decode_id", |b| {
        b.iter(|| decode_id(black_box(0x0401_0101)));
    });
}

fn bench_checksum(c: &mut Criterion) {
    let frame = CanFrame::new(0x0401_0101, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
    c.bench_function("apply_checksum", |b| {
        b.iter(|| {
            let mut f = black_box(frame);
            apply_checksum(&mut f).unwrap();
            f
        });
    });
}

criterion_group!(benches, bench_encode_id, bench_decode_id, bench_checksum);
criterion_main!(benches);
