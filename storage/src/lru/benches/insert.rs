use super::utils::{noop, random_keys, CHARGE};
use criterion::{black_box, criterion_group, Criterion};
use pcache_storage::lru::ShardedCache;
use std::{sync::Arc, time::Instant};

fn bench_insert(c: &mut Criterion) {
    for items in [1_000, 10_000, 100_000] {
        let keys = random_keys(items);

        // A capacity of half the working set keeps eviction on the hot path
        for resident in [items, items / 2] {
            let label = format!("{}/items={} resident={}", module_path!(), items, resident);
            c.bench_function(&label, |b| {
                b.iter_custom(|iters| {
                    let deleter = noop();
                    let mut elapsed = std::time::Duration::ZERO;
                    for _ in 0..iters {
                        let cache = ShardedCache::new(resident * CHARGE);
                        let start = Instant::now();
                        for (i, key) in keys.iter().enumerate() {
                            black_box(cache.insert(
                                key,
                                Arc::new(i as u64),
                                CHARGE,
                                deleter.clone(),
                            ));
                        }
                        elapsed += start.elapsed();
                    }
                    elapsed
                });
            });
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_insert
}
