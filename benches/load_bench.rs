use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{ArrayD, IxDyn};
use std::hint::black_box;

use spikeeg::mat::{text, v5};
use spikeeg::MatVar;

/// A metadata-sized variable set: 1000 samples, 2 slots, patch width 70.
fn bench_vars() -> Vec<(&'static str, MatVar)> {
    let regions = ArrayD::from_shape_fn(IxDyn(&[1000, 2, 70]), |ix| {
        if ix[2] < 5 { (ix[0] * 7 + ix[2]) as f64 % 994.0 } else { -1.0 }
    });
    let idx = ArrayD::from_shape_fn(IxDyn(&[1000, 2]), |ix| (ix[0] * 3 + ix[1]) as f64);
    let scale = ArrayD::from_shape_fn(IxDyn(&[1000, 2]), |ix| 10.0 + ix[1] as f64);
    vec![
        ("selected_region", MatVar::Array(regions)),
        ("nmm_idx", MatVar::Array(idx)),
        ("scale_ratio", MatVar::Array(scale)),
    ]
}

fn bench_v5_decode(c: &mut Criterion) {
    let vars = bench_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.mat");
    v5::write_mat5(&path, &vars).unwrap();
    let bytes = std::fs::read(&path).unwrap();

    c.bench_function("v5 decode [1000×2×70 metadata]", |b| {
        b.iter(|| {
            let vars = v5::decode(black_box(&bytes)).unwrap();
            black_box(vars.len())
        })
    });
}

fn bench_text_decode(c: &mut Criterion) {
    let vars = bench_vars();
    let body = text::encode(&vars);
    let bytes = body.into_bytes();

    c.bench_function("octave text decode [1000×2×70 metadata]", |b| {
        b.iter(|| {
            let vars = text::decode(black_box(&bytes)).unwrap();
            black_box(vars.len())
        })
    });
}

fn bench_v5_encode(c: &mut Criterion) {
    let vars = bench_vars();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench_out.mat");

    c.bench_function("v5 encode [1000×2×70 metadata]", |b| {
        b.iter(|| {
            v5::write_mat5(black_box(&path), black_box(&vars)).unwrap();
        })
    });
}

criterion_group!(benches, bench_v5_decode, bench_text_decode, bench_v5_encode);
criterion_main!(benches);
