//! The Tiered Mapping Cache: L1 provider rules, L2 single-symbol entries, L3
//! batch results, glued together by the pending-query dedup table.
//!
//! Structurally this is the same "Arc-wrapped inner, cheap to clone"
//! arrangement the cache manager this crate grew out of used for its own
//! multi-tier lookup, and the pending-query table is the same
//! `DashMap<String, Arc<Mutex<...>>>` shape it used for stampede protection,
//! generalized here from a bare `()` guard to a guard that also carries the
//! settled result so concurrent waiters can read it without re-querying.

mod rule_gateway;
mod watchdog;

pub mod change_stream;

pub use change_stream::ChangeStreamSupervisor;
pub use rule_gateway::RuleStoreGateway;
pub use watchdog::MemoryWatchdog;

use crate::collaborators::RuleStore;
use crate::config::SymbolCacheConfig;
use crate::error::CacheError;
use crate::events::{now_ms, CacheEvent, CacheLayer, EventBus};
use crate::keygen;
use crate::lru::ConcurrentLruTtl;
use crate::models::{BatchResult, Direction, ProviderRules};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

type PendingSlot = Arc<AsyncMutex<Option<BatchResult>>>;

struct Inner {
    config: SymbolCacheConfig,
    l1: ConcurrentLruTtl<ProviderRules>,
    l2: ConcurrentLruTtl<String>,
    l3: ConcurrentLruTtl<BatchResult>,
    pending: DashMap<String, PendingSlot>,
    rule_gateway: RuleStoreGateway,
    events: EventBus,
}

/// Cheap to clone: every field is `Arc`-shared.
#[derive(Clone)]
pub struct TieredMappingCache {
    inner: Arc<Inner>,
}

impl TieredMappingCache {
    #[must_use]
    pub fn new(rule_store: Arc<dyn RuleStore>, config: SymbolCacheConfig, events: EventBus) -> Self {
        let l1 = ConcurrentLruTtl::new(config.rule_cache_max_size, config.rule_cache_ttl(), false);
        let l2 = ConcurrentLruTtl::new(config.symbol_cache_max_size, config.symbol_cache_ttl(), true);
        let l3 = ConcurrentLruTtl::new(config.batch_result_cache_max_size, config.batch_result_cache_ttl(), true);
        let rule_gateway = RuleStoreGateway::new(rule_store, l1.clone());

        Self {
            inner: Arc::new(Inner { config, l1, l2, l3, pending: DashMap::new(), rule_gateway, events }),
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub(crate) fn l2_tier(&self) -> &ConcurrentLruTtl<String> {
        &self.inner.l2
    }

    #[must_use]
    pub(crate) fn l3_tier(&self) -> &ConcurrentLruTtl<BatchResult> {
        &self.inner.l3
    }

    #[must_use]
    pub fn tier_sizes(&self) -> HashMap<String, usize> {
        let mut sizes = HashMap::new();
        sizes.insert("l1".to_string(), self.inner.l1.len());
        sizes.insert("l2".to_string(), self.inner.l2.len());
        sizes.insert("l3".to_string(), self.inner.l3.len());
        sizes
    }

    pub fn clear_all(&self) {
        self.inner.l1.clear();
        self.inner.l2.clear();
        self.inner.l3.clear();
        self.inner.pending.clear();
    }

    /// Drops every entry scoped to `provider` from all three tiers. Called by
    /// the change stream supervisor (provider-specific invalidation) and
    /// exposed for callers that want to force a refresh of one provider.
    pub fn invalidate_provider(&self, provider: &str) {
        let provider = provider.to_lowercase();
        self.inner.l1.remove(&keygen::rules_key(&provider));
        let l2_removed = self.inner.l2.remove_prefix(&format!("symbol:{provider}:"));
        let l3_removed = self.inner.l3.remove_prefix(&format!("batch:{provider}:"));
        debug!(provider = %provider, l2_removed, l3_removed, "invalidated provider");
    }

    #[instrument(skip(self, symbols), fields(provider = %provider, count = symbols.len()))]
    pub async fn map_symbols(
        &self,
        provider: &str,
        symbols: &[String],
        direction: Direction,
    ) -> Result<BatchResult, CacheError> {
        if provider.trim().is_empty() {
            return Err(CacheError::invalid_input("provider must not be empty"));
        }
        if symbols.is_empty() {
            return Err(CacheError::invalid_input("symbols must not be empty"));
        }

        let start = Instant::now();
        let provider = provider.to_lowercase();
        let is_batch = symbols.len() > 1;

        self.inner.events.publish(CacheEvent::OperationStart {
            provider: provider.clone(),
            symbol_count: symbols.len(),
            direction,
            is_batch,
            timestamp_ms: now_ms(),
        });

        if !self.inner.config.symbol_mapping_cache_enabled {
            self.inner.events.publish(CacheEvent::CacheDisabled {
                reason: "symbol_mapping_cache_enabled=false".to_string(),
                provider: provider.clone(),
                timestamp_ms: now_ms(),
            });
            let resolved = self.resolve_uncached(&provider, symbols, direction).await?;
            return Ok(self.finish(&provider, direction, symbols, resolved, HashMap::new(), start, false));
        }

        if is_batch {
            let batch_key = keygen::batch_key(&provider, direction, symbols);
            if let Some(hit) = self.inner.l3.get(&batch_key) {
                self.emit_hit(CacheLayer::L3, &provider, None);
                return Ok(hit);
            }
            self.emit_miss(CacheLayer::L3, &provider, None);
        }

        let mut hits = HashMap::new();
        let mut uncached = Vec::new();
        for symbol in symbols {
            let key = keygen::symbol_key(&provider, direction, symbol);
            if let Some(output) = self.inner.l2.get(&key) {
                self.emit_hit(CacheLayer::L2, &provider, Some(symbol.clone()));
                hits.insert(symbol.clone(), output);
            } else {
                self.emit_miss(CacheLayer::L2, &provider, Some(symbol.clone()));
                uncached.push(symbol.clone());
            }
        }

        let mut resolved = HashMap::new();
        let wrote_batch_on_miss;
        if uncached.is_empty() {
            wrote_batch_on_miss = false;
        } else {
            resolved = self.resolve_with_dedup(&provider, &uncached, direction).await?;
            self.back_fill(&provider, direction, &resolved);
            wrote_batch_on_miss = true;
        }

        let result = self.finish(&provider, direction, symbols, resolved, hits, start, wrote_batch_on_miss);

        if is_batch && wrote_batch_on_miss {
            let batch_key = keygen::batch_key(&provider, direction, symbols);
            self.inner.l3.insert_default_ttl(batch_key, result.clone());
        }

        Ok(result)
    }

    fn finish(
        &self,
        provider: &str,
        direction: Direction,
        original_inputs: &[String],
        store_resolved: HashMap<String, String>,
        cache_hits: HashMap<String, String>,
        start: Instant,
        _wrote_batch: bool,
    ) -> BatchResult {
        let mut mapping_details = HashMap::new();
        let mut failed_symbols = Vec::new();

        for input in original_inputs {
            if let Some(v) = cache_hits.get(input).or_else(|| store_resolved.get(input)) {
                mapping_details.insert(input.clone(), v.clone());
            } else {
                failed_symbols.push(input.clone());
            }
        }

        let processing_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let success = true;

        self.inner.events.publish(CacheEvent::OperationComplete {
            provider: provider.to_string(),
            symbol_count: original_inputs.len(),
            cache_hits: cache_hits.len(),
            processing_time_ms,
            direction,
            success,
            timestamp_ms: now_ms(),
        });

        BatchResult {
            success,
            provider: provider.to_string(),
            direction,
            total_processed: original_inputs.len(),
            cache_hits: cache_hits.len(),
            mapping_details,
            failed_symbols,
            processing_time_ms,
        }
    }

    /// Resolves a subset of symbols directly against the rule store, bypassing
    /// the pending-dedup table. Used for the globally-disabled path, where no
    /// cache reads/writes should occur at all.
    async fn resolve_uncached(
        &self,
        provider: &str,
        symbols: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, String>, CacheError> {
        self.query_store(provider, symbols, direction).await
    }

    /// Coalesces concurrent identical uncached subsets onto a single store
    /// query via the pending table's "insert-if-absent, then await" dance.
    async fn resolve_with_dedup(
        &self,
        provider: &str,
        symbols: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, String>, CacheError> {
        let pending_key = keygen::pending_key(provider, direction, symbols);

        let slot = self
            .inner
            .pending
            .entry(pending_key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();

        let mut guard = slot.lock().await;
        if let Some(result) = guard.as_ref() {
            return Ok(result.mapping_details.clone());
        }

        let query = self.query_store(provider, symbols, direction);
        let outcome = tokio::time::timeout(self.inner.config.query_timeout(), query).await;

        // Populate the slot before removing it from the map (still holding
        // `guard`) so a request arriving in the gap between settle and
        // removal finds the existing slot rather than starting a second,
        // redundant store query.
        let result = match outcome {
            Ok(Ok(resolved)) => {
                *guard = Some(BatchResult {
                    success: true,
                    provider: provider.to_string(),
                    direction,
                    total_processed: symbols.len(),
                    cache_hits: 0,
                    mapping_details: resolved.clone(),
                    failed_symbols: symbols.iter().filter(|s| !resolved.contains_key(*s)).cloned().collect(),
                    processing_time_ms: 0,
                });
                Ok(resolved)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CacheError::QueryTimeout {
                cache_key: pending_key.clone(),
                deadline_ms: u64::try_from(self.inner.config.query_timeout().as_millis()).unwrap_or(u64::MAX),
            }),
        };

        drop(guard);
        self.inner.pending.remove(&pending_key);
        result
    }

    async fn query_store(
        &self,
        provider: &str,
        symbols: &[String],
        direction: Direction,
    ) -> Result<HashMap<String, String>, CacheError> {
        let rules = self.inner.rule_gateway.get_provider_rules(provider).await;

        let mut resolved = HashMap::new();
        for symbol in symbols {
            match rules.resolve(direction, symbol) {
                Some(output) => {
                    resolved.insert(symbol.clone(), output);
                }
                None if self.inner.config.pass_through_unmapped => {
                    resolved.insert(symbol.clone(), symbol.clone());
                }
                None => {}
            }
        }
        Ok(resolved)
    }

    /// Writes both directions of every resolved pair into L2 so the reverse
    /// lookup is hot immediately, without a second store round-trip.
    fn back_fill(&self, provider: &str, direction: Direction, resolved: &HashMap<String, String>) {
        for (input, output) in resolved {
            if output.is_empty() {
                continue;
            }
            let forward_key = keygen::symbol_key(provider, direction, input);
            self.inner.l2.insert_default_ttl(forward_key, output.clone());

            let reverse_key = keygen::symbol_key(provider, direction.reverse(), output);
            self.inner.l2.insert_default_ttl(reverse_key, input.clone());
        }
    }

    fn emit_hit(&self, layer: CacheLayer, provider: &str, symbol: Option<String>) {
        self.inner.events.publish(CacheEvent::CacheHit {
            layer,
            provider: provider.to_string(),
            symbol,
            timestamp_ms: now_ms(),
        });
    }

    fn emit_miss(&self, layer: CacheLayer, provider: &str, symbol: Option<String>) {
        self.inner.events.publish(CacheEvent::CacheMiss {
            layer,
            provider: provider.to_string(),
            symbol,
            timestamp_ms: now_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ChangeEvent;
    use crate::models::MappingRule;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRuleStore {
        rules: HashMap<String, ProviderRules>,
        queries: AtomicUsize,
    }

    impl FakeRuleStore {
        fn new() -> Self {
            let mut rules = HashMap::new();
            rules.insert(
                "tiger".to_string(),
                ProviderRules {
                    provider: "tiger".to_string(),
                    rules: vec![MappingRule {
                        provider: "tiger".to_string(),
                        sdk_symbol: "700.HK".to_string(),
                        standard_symbol: "00700".to_string(),
                        is_active: true,
                    }],
                },
            );
            Self { rules, queries: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl RuleStore for FakeRuleStore {
        async fn find_by_data_source(&self, provider: &str) -> anyhow::Result<Option<ProviderRules>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.rules.get(provider).cloned())
        }

        async fn find_by_id(&self, _id: &str) -> anyhow::Result<Option<MappingRule>> {
            Ok(None)
        }

        async fn watch_changes(
            &self,
        ) -> anyhow::Result<Pin<Box<dyn futures_util::Stream<Item = anyhow::Result<ChangeEvent>> + Send>>> {
            Ok(Box::pin(stream::empty()))
        }
    }

    fn cache_with_fake_store() -> (TieredMappingCache, Arc<FakeRuleStore>) {
        let store = Arc::new(FakeRuleStore::new());
        let cache = TieredMappingCache::new(store.clone(), SymbolCacheConfig::default(), EventBus::default());
        (cache, store)
    }

    #[tokio::test]
    async fn single_symbol_resolves_and_backfills_reverse() {
        let (cache, _store) = cache_with_fake_store();
        let symbols = vec!["700.HK".to_string()];
        let result = cache.map_symbols("tiger", &symbols, Direction::ToStandard).await.unwrap();
        assert_eq!(result.mapping_details.get("700.HK"), Some(&"00700".to_string()));
        assert!(result.failed_symbols.is_empty());

        let reverse = cache
            .map_symbols("tiger", &vec!["00700".to_string()], Direction::FromStandard)
            .await
            .unwrap();
        assert_eq!(reverse.mapping_details.get("00700"), Some(&"700.HK".to_string()));
    }

    #[tokio::test]
    async fn unmapped_symbol_is_reported_as_failed_when_pass_through_disabled() {
        let store = Arc::new(FakeRuleStore::new());
        let mut config = SymbolCacheConfig::default();
        config.pass_through_unmapped = false;
        let cache = TieredMappingCache::new(store, config, EventBus::default());

        let result = cache
            .map_symbols("tiger", &vec!["UNKNOWN".to_string()], Direction::ToStandard)
            .await
            .unwrap();
        assert!(result.mapping_details.is_empty());
        assert_eq!(result.failed_symbols, vec!["UNKNOWN".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_identical_batch_requests_coalesce_onto_one_store_query() {
        let (cache, store) = cache_with_fake_store();
        let symbols = vec!["700.HK".to_string(), "AAPL".to_string()];

        let (a, b) = tokio::join!(
            cache.map_symbols("tiger", &symbols, Direction::ToStandard),
            cache.map_symbols("tiger", &symbols, Direction::ToStandard),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_invalidation_clears_all_scoped_tiers() {
        let (cache, _store) = cache_with_fake_store();
        let symbols = vec!["700.HK".to_string()];
        cache.map_symbols("tiger", &symbols, Direction::ToStandard).await.unwrap();
        assert!(cache.l2_tier().len() > 0);

        cache.invalidate_provider("tiger");
        assert_eq!(cache.l2_tier().len(), 0);
    }

    #[tokio::test]
    async fn disabled_cache_bypasses_all_tiers() {
        let store = Arc::new(FakeRuleStore::new());
        let mut config = SymbolCacheConfig::default();
        config.symbol_mapping_cache_enabled = false;
        let cache = TieredMappingCache::new(store, config, EventBus::default());

        let result = cache
            .map_symbols("tiger", &vec!["700.HK".to_string()], Direction::ToStandard)
            .await
            .unwrap();
        assert_eq!(result.mapping_details.get("700.HK"), Some(&"00700".to_string()));
        assert_eq!(cache.l2_tier().len(), 0);
    }
}
