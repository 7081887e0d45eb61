//! Benchmarks for the grid operators and the seeding locator.
use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use hypovel::{Arrival, Grid3d, Hypocenter, hypoloc};

fn bench_grid(n: usize) -> Grid3d {
    let axis: Vec<f64> = (0..n).map(|i| 10.0 * i as f64).collect();
    Grid3d::new(axis.clone(), axis.clone(), axis, 1).unwrap()
}

fn smoothing_matrices(c: &mut Criterion) {
    let grid = bench_grid(20);
    c.bench_function("smoothing_matrices_20", |b| {
        b.iter(|| black_box(grid.smoothing_matrices().unwrap()));
    });
}

fn interp_matrix(c: &mut Criterion) {
    let grid = bench_grid(20);
    let pts: Vec<[f64; 3]> = (0..512)
        .map(|i| {
            let t = i as f64 / 512.0;
            [5.0 + 180.0 * t, 12.0 + 150.0 * t, 30.0 + 100.0 * t]
        })
        .collect();
    c.bench_function("interp_matrix_512", |b| {
        b.iter(|| black_box(grid.interp_matrix(&pts).unwrap()));
    });
}

fn locate_events(c: &mut Criterion) {
    let receivers: Vec<[f64; 3]> = vec![
        [0.0, 0.0, 0.0],
        [100.0, 0.0, 10.0],
        [0.0, 100.0, 20.0],
        [100.0, 100.0, 5.0],
        [50.0, 0.0, 80.0],
        [0.0, 50.0, 90.0],
    ];
    let truth = [60.0, 40.0, 50.0];
    let v = 3000.0;
    let arrivals: Vec<Arrival> = receivers
        .iter()
        .enumerate()
        .map(|(r, rcv)| {
            let dx = rcv[0] - truth[0];
            let dy = rcv[1] - truth[1];
            let dz = rcv[2] - truth[2];
            Arrival {
                event: 0,
                time: (dx * dx + dy * dy + dz * dz).sqrt() / v,
                receiver: r,
            }
        })
        .collect();
    let hinit = [Hypocenter::new(0, 0.0, 50.0, 50.0, 40.0)];
    c.bench_function("hypoloc_single_event", |b| {
        b.iter(|| black_box(hypoloc(&arrivals, &receivers, v, &hinit, 20, 1e-6).unwrap()));
    });
}

criterion_group!(benches, smoothing_matrices, interp_matrix, locate_events);
criterion_main!(benches);
