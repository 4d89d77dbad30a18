//! Quiescence-tree benchmarks: one full sweep of reports per GP, for a few
//! geometries.

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use frankenrcu_core::rcu::RcuTree;

const GEOMETRIES: &[(usize, usize)] = &[(16, 16), (64, 16), (256, 16), (1024, 64), (4096, 2)];

fn bench_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree");

    for &(cores, fanout) in GEOMETRIES {
        let tree = RcuTree::build(cores, fanout).expect("geometry fits");
        let leaves: Vec<(usize, u64)> = (0..cores).map(|core| tree.leaf_for(core)).collect();
        let label = format!("{cores}c_f{fanout}");

        group.throughput(Throughput::Elements(cores as u64));
        group.bench_function(BenchmarkId::new("full_sweep", &label), |b| {
            b.iter(|| {
                tree.reset_for_new_gp();
                let mut last = false;
                for &(leaf, bit) in &leaves {
                    last = tree.mark_quiescent(leaf, bit);
                }
                black_box(last)
            });
        });

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("build", &label), |b| {
            b.iter(|| black_box(RcuTree::build(cores, fanout)));
        });
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(50);
    targets = bench_tree
);
criterion_main!(benches);
