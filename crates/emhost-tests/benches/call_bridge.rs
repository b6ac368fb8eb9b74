use criterion::{criterion_group, criterion_main, Criterion};
use emhost::{ArgKind, HostValue, ReturnKind, Scalar};
use emhost_tests::load_quiet;
use std::hint::black_box;

fn call_numbers_bench(c: &mut Criterion) {
    let (mut rt, _) = load_quiet("basics").unwrap();
    c.bench_function("call add by name", |b| {
        b.iter(|| {
            rt.call(
                "add",
                ReturnKind::Number,
                &[ArgKind::Number; 2],
                &[black_box(2).into(), black_box(3).into()],
            )
        })
    });
}

fn wrapped_numbers_bench(c: &mut Criterion) {
    let (mut rt, _) = load_quiet("basics").unwrap();
    let add = rt.wrap("add", ReturnKind::Number, &[ArgKind::Number; 2]).unwrap();
    c.bench_function("wrapped add", |b| {
        b.iter(|| add.call(&mut rt, &[black_box(2).into(), black_box(3).into()]))
    });
}

fn raw_numbers_bench(c: &mut Criterion) {
    let (mut rt, _) = load_quiet("basics").unwrap();
    c.bench_function("call_raw add", |b| {
        b.iter(|| rt.call_raw("add", &[Scalar::I32(black_box(2)), Scalar::I32(3)]))
    });
}

// ─── Stack-marshalled arguments ──────────────────────────────────────────────

fn string_argument_bench(c: &mut Criterion) {
    let (mut rt, _) = load_quiet("basics").unwrap();
    let strlen = rt.wrap("strlen", ReturnKind::Number, &[ArgKind::String]).unwrap();
    let text = HostValue::from("the quick brown fox jumps over the lazy dog");
    c.bench_function("strlen with string argument", |b| {
        b.iter(|| strlen.call(&mut rt, black_box(std::slice::from_ref(&text))))
    });
}

fn array_argument_bench(c: &mut Criterion) {
    let (mut rt, _) = load_quiet("basics").unwrap();
    let sum = rt
        .wrap("sum", ReturnKind::Number, &[ArgKind::Array, ArgKind::Number])
        .unwrap();
    let args = [HostValue::from(vec![7u8; 1024]), HostValue::from(1024)];
    c.bench_function("sum over 1 KiB array argument", |b| {
        b.iter(|| sum.call(&mut rt, black_box(&args)))
    });
}

criterion_group!(
    benches,
    call_numbers_bench,
    wrapped_numbers_bench,
    raw_numbers_bench,
    string_argument_bench,
    array_argument_bench
);
criterion_main!(benches);
