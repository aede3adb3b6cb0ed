//! Criterion micro-benchmarks for the region tree.
//!
//! These benchmarks measure:
//! - Query translation through the region id mapper
//! - Split point selection from samples
//! - Building a static grid against the in-memory store
//!
//! Run with: `cargo bench --bench region_tree_bench`

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use regiontree::distribution::{
    ClusterMembership, CoordinationStore, DistributionGroupConfig, InMemoryCoordinationStore,
    NodeId, NodeState, PartitionerSettings, RegionId, RegionIdMapper, SamplingBasedSplitStrategy,
    SpacePartitionerCache, SplitPointStrategy, StorePaths, TableName,
};
use regiontree::hyperrectangle::Hyperrectangle;

/// Mapper with `regions` unit cells laid out on a square grid.
fn grid_mapper(regions: usize) -> RegionIdMapper {
    let mapper = RegionIdMapper::new("bench");
    let side = (regions as f64).sqrt().ceil() as usize;
    for i in 0..regions {
        let (x, y) = ((i % side) as f64, (i / side) as f64);
        let bbox = Hyperrectangle::from_pairs(&[(x, x + 1.0), (y, y + 1.0)]).unwrap();
        mapper.add_mapping(RegionId(i as u64), bbox);
    }
    mapper
}

fn bench_mapper_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapper_lookup");
    let table = TableName::new("bench", "points").unwrap();
    let query = Hyperrectangle::from_pairs(&[(2.5, 4.5), (2.5, 4.5)]).unwrap();

    for regions in [16, 256, 4_096].iter() {
        let mapper = grid_mapper(*regions);
        group.throughput(Throughput::Elements(*regions as u64));
        group.bench_with_input(BenchmarkId::new("local_tables_for", regions), regions, |b, _| {
            b.iter(|| mapper.local_tables_for(black_box(&query), &table));
        });
    }

    group.finish();
}

fn bench_split_point(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_point");
    let covering = Hyperrectangle::full_space(2);

    for samples in [100, 10_000].iter() {
        let boxes: Vec<Hyperrectangle> = (0..*samples)
            .map(|i| {
                let v = ((i * 7919) % 1000) as f64;
                Hyperrectangle::from_pairs(&[(v, v), (0.0, 0.0)]).unwrap()
            })
            .collect();
        let strategy = SamplingBasedSplitStrategy::new(boxes);
        group.bench_with_input(BenchmarkId::new("median", samples), samples, |b, _| {
            b.iter(|| strategy.split_point(0, black_box(&covering)).unwrap());
        });
    }

    group.finish();
}

fn bench_box_parse(c: &mut Criterion) {
    c.bench_function("hyperrectangle_parse", |b| {
        b.iter(|| {
            black_box("[[0.0,5.0]:[-inf,inf]:[1.5,2.5]]")
                .parse::<Hyperrectangle>()
                .unwrap()
        });
    });
}

fn bench_static_grid_build(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = DistributionGroupConfig::builder(2)
        .replication_factor(1)
        .space_partitioner("static-grid", "[[0.0,5.0]:[0.0,5.0]];0.5;0.5")
        .build();

    c.bench_function("static_grid_100_cells", |b| {
        b.to_async(&runtime).iter(|| async {
            let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
            let membership = ClusterMembership::new(
                Arc::clone(&store),
                StorePaths::new("bench").unwrap(),
            );
            for i in 0..4 {
                membership
                    .register_node(&NodeId::new(format!("node-{i}")), NodeState::Ready)
                    .await
                    .unwrap();
            }
            let settings = PartitionerSettings::default().with_cluster_name("bench");
            let cache = SpacePartitionerCache::new(store, settings).unwrap();
            let partitioner = cache.create_group("grid", &config).await.unwrap();
            partitioner.shutdown();
        });
    });
}

criterion_group!(
    benches,
    bench_mapper_lookup,
    bench_split_point,
    bench_box_parse,
    bench_static_grid_build
);
criterion_main!(benches);
