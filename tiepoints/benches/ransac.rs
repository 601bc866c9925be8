//! Benchmark for the RANSAC filter.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::DVec2;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use tiepoints::{RansacConfig, RansacFilter, TiePoint};

/// `count` tie-points shifted by (5, 3), a fifth of them replaced by noise.
fn tie_points(count: usize) -> Vec<TiePoint> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let shift = DVec2::new(5.0, 3.0);
    (0..count)
        .map(|i| {
            let pt1 = DVec2::new(rng.random_range(0.0..500.0), rng.random_range(0.0..500.0));
            let pt2 = if i % 5 == 0 {
                DVec2::new(rng.random_range(0.0..500.0), rng.random_range(0.0..500.0))
            } else {
                pt1 + shift
            };
            TiePoint::new(pt1, pt2)
        })
        .collect()
}

fn bench_ransac(c: &mut Criterion) {
    let filter = RansacFilter::default();
    let mut group = c.benchmark_group("ransac");

    for count in [100, 1000] {
        let points = tie_points(count);
        for (name, enable_multi_thread) in [("single", false), ("multi", true)] {
            let config = RansacConfig {
                max_direct_map_error: 1.0,
                max_inverse_map_error: 1.0,
                enable_multi_thread,
                seed: Some(1),
                ..Default::default()
            };
            group.bench_with_input(BenchmarkId::new(name, count), &points, |b, points| {
                b.iter(|| {
                    let outcome = filter.apply("Affine", points, None, &config);
                    black_box(outcome)
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_ransac);
criterion_main!(benches);
