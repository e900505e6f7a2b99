//! Stampede protection: concurrent identical batch requests coalesce onto one store query.

mod common;

use common::FakeRuleStore;
use std::sync::atomic::Ordering;
use symbol_cache_core::{Direction, EventBus, SymbolCacheConfig, TieredMappingCache};

/// S2: 10 concurrent identical batch lookups against an empty cache all see the
/// same resolved mapping, and the rule store is queried exactly once.
#[tokio::test]
async fn concurrent_identical_batch_requests_coalesce_onto_one_store_query() {
    let store = FakeRuleStore::new();
    store.seed("provb", &[("700.HK", "00700"), ("9988.HK", "09988")]).await;
    let cache = TieredMappingCache::new(store.clone(), SymbolCacheConfig::default(), EventBus::default());

    let symbols = vec!["700.HK".to_string(), "9988.HK".to_string()];
    let futures: Vec<_> = (0..10).map(|_| cache.map_symbols("provB", &symbols, Direction::ToStandard)).collect();
    let results = futures_util::future::join_all(futures).await;

    for result in &results {
        let result = result.as_ref().unwrap();
        assert_eq!(result.mapping_details.get("700.HK"), Some(&"00700".to_string()));
        assert_eq!(result.mapping_details.get("9988.HK"), Some(&"09988".to_string()));
    }
    assert_eq!(store.find_calls.load(Ordering::SeqCst), 1, "expected a single coalesced findByDataSource call");
}

/// Invariant 3: the batch key and pending key agree regardless of input symbol order.
#[tokio::test]
async fn batch_key_is_independent_of_symbol_order() {
    use symbol_cache_core::keygen;

    let forward = vec!["700.HK".to_string(), "9988.HK".to_string()];
    let reversed = vec!["9988.HK".to_string(), "700.HK".to_string()];

    assert_eq!(
        keygen::batch_key("provb", Direction::ToStandard, &forward),
        keygen::batch_key("provb", Direction::ToStandard, &reversed)
    );
    let batch = keygen::batch_key("provb", Direction::ToStandard, &forward);
    let pending = keygen::pending_key("provb", Direction::ToStandard, &forward);
    assert_eq!(
        batch.trim_start_matches("batch:"),
        pending.trim_start_matches("pending:"),
        "pending key must hash identically to the batch key for the same inputs"
    );
}

/// S8: a store that exceeds the configured query timeout fails the lookup
/// without leaving a cache entry behind; a retry against a working store succeeds.
#[tokio::test]
async fn store_timeout_leaves_no_cache_entry_and_a_retry_can_succeed() {
    let slow_store = FakeRuleStore::with_delay(std::time::Duration::from_millis(500));
    let mut config = SymbolCacheConfig::default();
    config.query_timeout_ms = 50;
    let cache = TieredMappingCache::new(slow_store, config.clone(), EventBus::default());

    let timed_out = cache.map_symbols("provX", &["A".to_string()], Direction::ToStandard).await;
    assert!(timed_out.is_err());

    let working_store = FakeRuleStore::new();
    working_store.seed("provx", &[("A", "A.STD")]).await;
    let retry_cache = TieredMappingCache::new(working_store, config, EventBus::default());
    let retried = retry_cache.map_symbols("provX", &["A".to_string()], Direction::ToStandard).await.unwrap();
    assert_eq!(retried.mapping_details.get("A"), Some(&"A.STD".to_string()));
}
