//! Benchmarks for spatial dissolve and shape union.
//!
//! The lattice inputs mirror the worst case for candidate generation: many
//! envelopes that sit close together but rarely intersect.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;
use smartfire_rs::test_support::{circle, lattice, shuffled};
use smartfire_rs::{dissolve, union_all};

// =============================================================================
// DISSOLVE BENCHMARKS
// =============================================================================

/// Dissolve lattices of growing size, in generation order and shuffled.
fn bench_dissolve_lattice(c: &mut Criterion) {
    let mut group = c.benchmark_group("dissolve_lattice");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));

    for &size in &[100, 300, 600] {
        let lattice = lattice(size, 10, 3.0, 100);
        group.throughput(Throughput::Elements(lattice.shapes.len() as u64));

        group.bench_with_input(BenchmarkId::new("ordered", size), &lattice.shapes, |b, shapes| {
            b.iter(|| black_box(dissolve(shapes.clone()).map(|groups| groups.len())))
        });

        let mixed = shuffled(lattice.shapes.clone(), 42);
        group.bench_with_input(BenchmarkId::new("shuffled", size), &mixed, |b, shapes| {
            b.iter(|| black_box(dissolve(shapes.clone()).map(|groups| groups.len())))
        });
    }

    group.finish();
}

// =============================================================================
// UNION BENCHMARKS
// =============================================================================

/// Union a chain of overlapping circles into one shape.
fn bench_union_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("union_chain");
    group.sample_size(10);

    for &count in &[10usize, 100, 500] {
        let shapes: Vec<_> = (0..count).map(|i| circle(i as f64 * 4.0, 0.0, 3.0)).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &shapes, |b, shapes| {
            b.iter(|| black_box(union_all(shapes.iter()).map(|shape| shape.into_owned())))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dissolve_lattice, bench_union_chain);
criterion_main!(benches);
