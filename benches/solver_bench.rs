// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{ArrayD, IxDyn};

use eikonal_hfm::input::{HfmInput, InputValue};
use eikonal_hfm::run_cpu;

fn make_input(model: &str, dims: &[usize]) -> HfmInput {
    let center: Vec<f64> = dims.iter().map(|&d| (d / 2) as f64).collect();
    let seeds = ArrayD::from_shape_vec(IxDyn(&[1, dims.len()]), center).unwrap();
    let mut input = HfmInput::new();
    input.insert("model".into(), model.into());
    input.insert(
        "dims".into(),
        dims.iter().map(|&d| d as f64).collect::<Vec<_>>().into(),
    );
    input.insert("seeds".into(), InputValue::Array(seeds));
    input.insert("verbosity".into(), 0.0.into());
    input
}

fn pool(threads: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Single-thread baseline: 512^2 isotropic, 1 thread.
fn bench_single_thread_2d(c: &mut Criterion) {
    let input = make_input("Isotropic2", &[512, 512]);
    let pool = pool(1);
    c.bench_function("2d_512x512_1thread", |b| {
        b.iter(|| pool.install(|| black_box(run_cpu(&input).unwrap())));
    });
}

/// Thread scaling: 1024^2 isotropic with varying thread counts.
fn bench_thread_scaling_2d(c: &mut Criterion) {
    let cpus = num_cpus();
    let input = make_input("Isotropic2", &[1024, 1024]);
    let mut group = c.benchmark_group("thread_scaling_1024x1024");
    group.sample_size(10);
    for &threads in &[1, 2, 4, 8] {
        if threads <= cpus {
            let pool = pool(threads);
            group.bench_function(format!("{}threads", threads), |b| {
                b.iter(|| pool.install(|| black_box(run_cpu(&input).unwrap())));
            });
        }
    }
    group.finish();
}

/// Model cost: the same 256^2 problem with growing stencils.
fn bench_models_2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("models_256x256");
    for (model, metric) in [
        ("Isotropic2", None),
        ("Diagonal2", Some(vec![1.0, 2.0])),
        ("Riemann2", Some(vec![2.0, 0.5, 1.0])),
        ("Rander2", Some(vec![1.0, 0.0, 1.0, 0.3, 0.2])),
    ] {
        let mut input = make_input(model, &[256, 256]);
        if let Some(metric) = metric {
            input.insert("metric".into(), metric.into());
        }
        group.bench_function(model, |b| {
            b.iter(|| black_box(run_cpu(&input).unwrap()));
        });
    }
    group.finish();
}

/// Differentiation: solve plus forward and reverse linear solves on 256^2.
fn bench_differentiation(c: &mut Criterion) {
    let mut input = make_input("Riemann2", &[256, 256]);
    input.insert("metric".into(), vec![2.0, 0.5, 1.0].into());
    input.insert(
        "costVariation".into(),
        InputValue::Array(ArrayD::from_elem(IxDyn(&[256, 256, 1]), 1.0)),
    );
    input.insert(
        "sensitivity".into(),
        InputValue::Array(ArrayD::from_elem(IxDyn(&[256, 256]), 1.0)),
    );
    let mut group = c.benchmark_group("differentiation_256x256");
    group.sample_size(10);
    group.bench_function("forward_reverse", |b| {
        b.iter(|| black_box(run_cpu(&input).unwrap()));
    });
    group.finish();
}

/// 3D: 64^3 isotropic at all cores.
fn bench_3d(c: &mut Criterion) {
    let input = make_input("Isotropic3", &[64, 64, 64]);
    let mut group = c.benchmark_group("3d_64x64x64");
    group.sample_size(10);
    group.bench_function("all_threads", |b| {
        b.iter(|| black_box(run_cpu(&input).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_2d,
    bench_thread_scaling_2d,
    bench_models_2d,
    bench_differentiation,
    bench_3d,
);
criterion_main!(benches);
