//! Throughput benchmarks for the per-exposure hot path: fiberflat
//! correction and sky estimation at realistic frame sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array, Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};

use specreduce::fiberflat::apply_fiberflat;
use specreduce::fibermap::{Fibermap, OBJTYPE_SKY};
use specreduce::sky::{compute_sky, subtract_sky};
use specreduce::{FiberFlat, Frame};

fn synthetic_frame(nspec: usize, nwave: usize, seed: u64) -> (Frame, Fibermap, FiberFlat) {
    let mut rng = StdRng::seed_from_u64(seed);
    let wave = Array::linspace(5000.0, 7000.0, nwave);
    let flux = Array2::from_shape_fn((nspec, nwave), |(_, j)| {
        60.0 + 0.01 * j as f64 + rng.gen_range(-1.0..1.0)
    });
    let ivar = Array2::from_elem((nspec, nwave), 1.0);
    let frame = Frame::new(wave.clone(), flux, ivar, None, None).unwrap();

    let mut fm = Fibermap::empty(nspec, 0);
    // every tenth fiber observes blank sky
    for i in (0..nspec).step_by(10) {
        fm.objtype[i] = OBJTYPE_SKY.to_string();
    }

    let flat = FiberFlat::new(
        wave,
        Array2::from_shape_fn((nspec, nwave), |_| rng.gen_range(0.8..1.2)),
        Array2::from_elem((nspec, nwave), 1e8),
        Array2::zeros((nspec, nwave)),
        Array1::ones(nwave),
    )
    .unwrap();
    (frame, fm, flat)
}

fn bench_compute_sky(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_sky");
    for &(nspec, nwave) in &[(50_usize, 500_usize), (500, 2000)] {
        let (frame, fm, _) = synthetic_frame(nspec, nwave, 1);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{nspec}x{nwave}")),
            &(&frame, &fm),
            |b, (frame, fm)| b.iter(|| compute_sky(black_box(frame), black_box(fm)).unwrap()),
        );
    }
    group.finish();
}

fn bench_apply_fiberflat(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_fiberflat");
    for &(nspec, nwave) in &[(50_usize, 500_usize), (500, 2000)] {
        let (frame, _, flat) = synthetic_frame(nspec, nwave, 2);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{nspec}x{nwave}")),
            &(&frame, &flat),
            |b, (frame, flat)| {
                b.iter(|| {
                    let mut work = (*frame).clone();
                    apply_fiberflat(black_box(&mut work), black_box(flat)).unwrap();
                    work
                });
            },
        );
    }
    group.finish();
}

fn bench_subtract_sky(c: &mut Criterion) {
    let (frame, fm, _) = synthetic_frame(500, 2000, 3);
    let sky = compute_sky(&frame, &fm).unwrap();
    c.bench_function("subtract_sky/500x2000", |b| {
        b.iter(|| {
            let mut work = frame.clone();
            subtract_sky(black_box(&mut work), black_box(&sky)).unwrap();
            work
        });
    });
}

criterion_group!(
    benches,
    bench_compute_sky,
    bench_apply_fiberflat,
    bench_subtract_sky
);
criterion_main!(benches);
