//! Benchmarks for the Tiered Mapping Cache.
//!
//! Measures:
//! - L2 single-symbol hit/miss latency
//! - L3 batch-result hit latency
//! - Cold-store resolution (first-touch, no cache hit)
//! - Concurrent identical batch requests (stampede dedup overhead)

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use symbol_cache_core::{ChangeEvent, Direction, EventBus, MappingRule, ProviderRules, RuleStore, SymbolCacheConfig, TieredMappingCache};
use tokio::runtime::Runtime;

struct BenchRuleStore {
    rules: ProviderRules,
}

impl BenchRuleStore {
    fn new(symbol_count: usize) -> Self {
        let rules = (0..symbol_count)
            .map(|i| MappingRule {
                provider: "tiger".to_string(),
                sdk_symbol: format!("{i}.HK"),
                standard_symbol: format!("{i:05}"),
                is_active: true,
            })
            .collect();
        Self { rules: ProviderRules { provider: "tiger".to_string(), rules } }
    }
}

#[async_trait]
impl RuleStore for BenchRuleStore {
    async fn find_by_data_source(&self, _provider: &str) -> anyhow::Result<Option<ProviderRules>> {
        Ok(Some(self.rules.clone()))
    }

    async fn find_by_id(&self, _id: &str) -> anyhow::Result<Option<MappingRule>> {
        Ok(None)
    }

    async fn watch_changes(&self) -> anyhow::Result<Pin<Box<dyn futures_util::Stream<Item = anyhow::Result<ChangeEvent>> + Send>>> {
        Ok(Box::pin(stream::empty()))
    }
}

fn setup_cache(symbol_count: usize) -> (TieredMappingCache, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("failed to create runtime"));
    let store = Arc::new(BenchRuleStore::new(symbol_count));
    let cache = TieredMappingCache::new(store, SymbolCacheConfig::default(), EventBus::default());
    (cache, rt)
}

fn bench_l2_hit(c: &mut Criterion) {
    let (cache, rt) = setup_cache(1000);
    rt.block_on(async {
        for i in 0..100 {
            let _ = cache.map_symbols("tiger", &[format!("{i}.HK")], Direction::ToStandard).await;
        }
    });

    c.bench_function("l2_symbol_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let symbol = format!("{}.HK", rand::random::<u8>() % 100);
                black_box(cache.map_symbols("tiger", &[symbol], Direction::ToStandard).await.unwrap_or_else(|_| panic!("lookup failed")));
            });
        });
    });
}

fn bench_l3_batch_hit(c: &mut Criterion) {
    let (cache, rt) = setup_cache(1000);
    let symbols: Vec<String> = (0..20).map(|i| format!("{i}.HK")).collect();
    rt.block_on(async {
        let _ = cache.map_symbols("tiger", &symbols, Direction::ToStandard).await;
    });

    c.bench_function("l3_batch_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(cache.map_symbols("tiger", &symbols, Direction::ToStandard).await.unwrap_or_else(|_| panic!("lookup failed")));
            });
        });
    });
}

fn bench_cold_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_resolution");
    group.measurement_time(Duration::from_secs(10));

    for batch_size in &[1, 10, 50] {
        let (cache, rt) = setup_cache(10_000);
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &batch_size| {
            b.iter(|| {
                rt.block_on(async {
                    let symbols: Vec<String> = (0..batch_size).map(|_| format!("{}.HK", rand::random::<u32>() % 10_000)).collect();
                    black_box(cache.map_symbols("tiger", &symbols, Direction::ToStandard).await.unwrap_or_else(|_| panic!("lookup failed")));
                });
            });
        });
    }

    group.finish();
}

fn bench_stampede_dedup(c: &mut Criterion) {
    let (cache, rt) = setup_cache(1000);
    let symbols: Vec<String> = (0..10).map(|i| format!("{i}.HK")).collect();

    c.bench_function("concurrent_identical_batch", |b| {
        b.iter(|| {
            rt.block_on(async {
                let futures: Vec<_> = (0..8).map(|_| cache.map_symbols("tiger", &symbols, Direction::ToStandard)).collect();
                black_box(futures_util::future::join_all(futures).await);
                cache.invalidate_provider("tiger");
            });
        });
    });
}

fn bench_tier_sizes(c: &mut Criterion) {
    let (cache, rt) = setup_cache(1000);
    rt.block_on(async {
        for i in 0..500 {
            let _ = cache.map_symbols("tiger", &[format!("{i}.HK")], Direction::ToStandard).await;
        }
    });

    c.bench_function("tier_sizes_snapshot", |b| {
        b.iter(|| {
            black_box(cache.tier_sizes());
        });
    });
    let _: HashMap<String, usize> = cache.tier_sizes();
}

criterion_group!(benches, bench_l2_hit, bench_l3_batch_hit, bench_cold_resolution, bench_stampede_dedup, bench_tier_sizes);
criterion_main!(benches);
