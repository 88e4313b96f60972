use criterion::{criterion_group, criterion_main, Criterion, black_box};

use glam::DVec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use copcbuild::builder::{descend, BuildConfig, ClusterBuilder, DescentContext, SwapSchedule};
use copcbuild::octant::OctreeRegistry;
use copcbuild::octree::{OctreeGeometry, RegionFinalizer};
use copcbuild::point::{MemorySink, MemorySource, PointSource, Scaling};

fn synthetic_cloud(n: usize) -> Vec<DVec3> {
    // Gently rolling terrain over 100 x 100 units
    let mut rng = ChaCha8Rng::seed_from_u64(12345);
    (0..n)
        .map(|_| {
            let x = rng.random::<f64>() * 100.0;
            let y = rng.random::<f64>() * 100.0;
            let z = (x * 0.05).sin() * 5.0 + (y * 0.03).cos() * 3.0 + rng.random::<f64>() * 0.2;
            DVec3::new(x, y, z)
        })
        .collect()
}

fn scaling() -> Scaling {
    Scaling::new(DVec3::splat(0.001), DVec3::ZERO)
}

fn bench_build_in_memory(c: &mut Criterion) {
    let positions = synthetic_cloud(100_000);
    let config = BuildConfig {
        max_points_per_octant: 10_000,
        shuffle_buffer_points: 20_000,
        ..Default::default()
    };

    c.bench_function("build_in_memory_100k", |b| {
        b.iter(|| {
            let mut source = MemorySource::from_positions(scaling(), black_box(&positions)).unwrap();
            let mut builder = ClusterBuilder::new(config.clone()).unwrap();
            builder
                .run(&mut source, |h| Ok(MemorySink::new(h.format.record_len())))
                .unwrap()
        });
    });
}

fn bench_descent(c: &mut Criterion) {
    let source = MemorySource::from_positions(scaling(), &synthetic_cloud(20_000)).unwrap();
    let header = source.header().clone();
    let geometry = OctreeGeometry::new(&header.bounds, 256);
    let schedule = SwapSchedule::new(geometry.size(), 256, 2.0, 10, 0.95, 5);
    let records: Vec<Vec<u8>> = source.points().iter().map(|r| r.to_vec()).collect();

    c.bench_function("descent_20k", |b| {
        b.iter(|| {
            let mut registry = OctreeRegistry::in_memory(geometry, header.format.record_len(), 100);
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            let mut ctx = DescentContext {
                registry: &mut registry,
                geometry: &geometry,
                scaling: &header.scaling,
                schedule: &schedule,
                rng: &mut rng,
                max_depth: 3,
                buffer_id: 0,
                swap: true,
            };
            for record in &records {
                let mut point = record.clone();
                descend(black_box(&mut point), &mut ctx).unwrap();
            }
            registry.len()
        });
    });
}

fn bench_finalizer_counting(c: &mut Criterion) {
    let positions = synthetic_cloud(100_000);
    let bounds = MemorySource::from_positions(scaling(), &positions)
        .unwrap()
        .header()
        .bounds;

    c.bench_function("finalizer_add_remove_100k", |b| {
        b.iter(|| {
            let mut finalizer = RegionFinalizer::for_depth(&bounds, 5).unwrap();
            for &p in &positions {
                finalizer.add(black_box(p));
            }
            for &p in &positions {
                finalizer.remove(black_box(p)).unwrap();
            }
            finalizer.remaining()
        });
    });
}

criterion_group!(benches, bench_build_in_memory, bench_descent, bench_finalizer_counting);
criterion_main!(benches);
