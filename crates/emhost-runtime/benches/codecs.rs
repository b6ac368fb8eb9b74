use criterion::{criterion_group, criterion_main, Criterion};
use emhost_runtime::strings::{decode, encode, measure, Utf16, Utf8};
use emhost_runtime::{GrowthPolicy, LinearMemory};
use std::hint::black_box;

const TEXT: &str = "The quick brown fox jumps over the lazy dog. Zwölf Boxkämpfer \
                    jagen Viktor quer über den großen Sylter Deich. 🦀";

fn utf8_encode_bench(c: &mut Criterion) {
    let mut mem = LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap();
    c.bench_function("utf8 encode", |b| {
        b.iter(|| encode::<Utf8>(&mut mem.view_mut(), black_box(TEXT), 1024, 4096))
    });
}

fn utf8_decode_bench(c: &mut Criterion) {
    let mut mem = LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap();
    encode::<Utf8>(&mut mem.view_mut(), TEXT, 1024, 4096).unwrap();
    c.bench_function("utf8 decode", |b| {
        b.iter(|| decode::<Utf8>(&mem.view(), black_box(1024), None))
    });
}

fn utf16_roundtrip_bench(c: &mut Criterion) {
    let mut mem = LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap();
    c.bench_function("utf16 encode + decode", |b| {
        b.iter(|| {
            encode::<Utf16>(&mut mem.view_mut(), black_box(TEXT), 2048, 4096).unwrap();
            decode::<Utf16>(&mem.view(), 2048, None)
        })
    });
}

fn measure_bench(c: &mut Criterion) {
    c.bench_function("utf8 measure", |b| b.iter(|| measure::<Utf8>(black_box(TEXT))));
}

// ─── Memory growth ───────────────────────────────────────────────────────────

fn grow_bench(c: &mut Criterion) {
    let policy = GrowthPolicy {
        growable: true,
        ..GrowthPolicy::default()
    };
    c.bench_function("grow 16 pages to 32", |b| {
        b.iter(|| {
            let mut mem = LinearMemory::allocate(16 * 65536, policy).unwrap();
            mem.grow(black_box(32 * 65536))
        })
    });
}

criterion_group!(
    benches,
    utf8_encode_bench,
    utf8_decode_bench,
    utf16_roundtrip_bench,
    measure_bench,
    grow_bench
);
criterion_main!(benches);
