//! Benchmarks for dependency analysis and the read cache.

use conductor::graph::{DependencyGraph, ScoreWeights, WorkItem};
use conductor::store::LruTtlCache;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// A layered graph: `width` items per layer, each depending on two items of the previous layer.
fn layered_items(layers: usize, width: usize) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let mut item = WorkItem::new(format!("item-{layer}-{slot}"));
            if layer > 0 {
                item = item
                    .depends_on(format!("item-{}-{slot}", layer - 1))
                    .depends_on(format!("item-{}-{}", layer - 1, (slot + 1) % width));
            }
            items.push(item);
        }
    }
    items
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_analyze");
    for layers in [5, 20, 50] {
        let items = layered_items(layers, 10);
        group.bench_with_input(BenchmarkId::from_parameter(layers * 10), &items, |b, items| {
            b.iter(|| {
                let graph = DependencyGraph::from_items(items.clone()).unwrap();
                black_box(graph.analyze(&ScoreWeights::default()))
            });
        });
    }
    group.finish();
}

fn cache_benchmark(c: &mut Criterion) {
    let cache: LruTtlCache<u64> = LruTtlCache::new(1024, None);
    let keys: Vec<String> = (0..4096).map(|i| format!("sessions/{i}.json")).collect();

    c.bench_function("cache_set_get", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            cache.set(key.as_str(), i as u64);
            black_box(cache.get(key));
            i += 1;
        });
    });
}

criterion_group!(benches, graph_benchmark, cache_benchmark);
criterion_main!(benches);
