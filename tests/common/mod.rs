//! Shared fakes for integration tests.
//!
//! The crate's collaborators are traits (`RuleStore`, `DistributedCache`,
//! `MarketStatusProvider`, `DataChangeDetector`), so hermetic in-memory
//! implementations stand in for a live rule store / Redis the way the
//! teacher's `tests/common/mod.rs` stood up a real Redis connection —
//! without the live dependency.

use async_trait::async_trait;
use dashmap::DashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use symbol_cache_core::collaborators::{
    CacheMetadata, ChangeDetection, ChangeEvent, DataChangeDetector, DistributedCache, FallbackOptions, FetchFn, HeapSampler, HeapStats,
    MarketStatus, MarketStatusProvider,
};
use symbol_cache_core::{MappingRule, Market, ProviderRules, RuleStore};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// An in-memory rule store seeded with a fixed rule set, counting lookups so
/// tests can assert on store-query coalescing, plus a controllable change feed.
pub struct FakeRuleStore {
    rules: AsyncMutex<std::collections::HashMap<String, ProviderRules>>,
    pub find_calls: AtomicUsize,
    query_delay: Option<Duration>,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl FakeRuleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: AsyncMutex::new(std::collections::HashMap::new()),
            find_calls: AtomicUsize::new(0),
            query_delay: None,
            change_tx: broadcast::channel(16).0,
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rules: AsyncMutex::new(std::collections::HashMap::new()),
            find_calls: AtomicUsize::new(0),
            query_delay: Some(delay),
            change_tx: broadcast::channel(16).0,
        })
    }

    pub async fn seed(&self, provider: &str, pairs: &[(&str, &str)]) {
        let rules = pairs
            .iter()
            .map(|(sdk, standard)| MappingRule {
                provider: provider.to_string(),
                sdk_symbol: (*sdk).to_string(),
                standard_symbol: (*standard).to_string(),
                is_active: true,
            })
            .collect();
        self.rules.lock().await.insert(provider.to_string(), ProviderRules { provider: provider.to_string(), rules });
    }

    /// Simulates a change-stream event for tests that invoke the supervisor's dispatch logic directly.
    pub fn emit_change(&self, event: ChangeEvent) {
        let _ = self.change_tx.send(event);
    }
}

#[async_trait]
impl RuleStore for FakeRuleStore {
    async fn find_by_data_source(&self, provider: &str) -> anyhow::Result<Option<ProviderRules>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rules.lock().await.get(provider).cloned())
    }

    async fn find_by_id(&self, _id: &str) -> anyhow::Result<Option<MappingRule>> {
        Ok(None)
    }

    async fn watch_changes(&self) -> anyhow::Result<Pin<Box<dyn futures_util::Stream<Item = anyhow::Result<ChangeEvent>> + Send>>> {
        let rx = self.change_tx.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(_) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

/// An in-memory distributed cache, standing in for Redis in orchestrator tests.
pub struct FakeDistributedCache {
    entries: DashMap<String, StoredValue>,
    pub set_calls: AtomicUsize,
}

impl FakeDistributedCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new(), set_calls: AtomicUsize::new(0) })
    }

    pub fn seed_with_ttl_remaining(&self, key: &str, data: Vec<u8>, ttl_remaining: Duration) {
        self.entries.insert(key.to_string(), StoredValue { data, expires_at: Instant::now() + ttl_remaining });
    }
}

#[async_trait]
impl DistributedCache for FakeDistributedCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, CacheMetadata)>> {
        Ok(self.entries.get(key).map(|entry| {
            let remaining = entry.expires_at.saturating_duration_since(Instant::now());
            (entry.data.clone(), CacheMetadata { ttl_remaining: Some(remaining) })
        }))
    }

    async fn mget(&self, keys: &[String]) -> anyhow::Result<Vec<Option<(Vec<u8>, CacheMetadata)>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(key.to_string(), StoredValue { data: value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn get_with_fallback(&self, key: &str, fetch_fn: FetchFn, opts: FallbackOptions) -> anyhow::Result<(Vec<u8>, CacheMetadata, bool)> {
        if let Some((data, metadata)) = self.get(key).await? {
            return Ok((data, metadata, true));
        }
        let data = fetch_fn().await?;
        if opts.cache_fallback_result {
            self.set(key, data.clone(), opts.fallback_ttl).await?;
        }
        Ok((data, CacheMetadata { ttl_remaining: Some(opts.fallback_ttl) }, false))
    }
}

pub struct FakeMarketStatusProvider {
    pub is_open: bool,
}

#[async_trait]
impl MarketStatusProvider for FakeMarketStatusProvider {
    async fn get_market_status(&self, _market: Market) -> MarketStatus {
        MarketStatus { is_open: self.is_open, confidence: 1.0 }
    }
}

pub struct FakeDataChangeDetector {
    pub significant: bool,
    pub calls: AtomicUsize,
}

impl FakeDataChangeDetector {
    pub fn new(significant: bool) -> Arc<Self> {
        Arc::new(Self { significant, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl DataChangeDetector for FakeDataChangeDetector {
    async fn detect_significant_change(
        &self,
        _symbol: &str,
        _new_data: &[u8],
        _market: Market,
        _market_status: MarketStatus,
    ) -> anyhow::Result<ChangeDetection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChangeDetection { significant: self.significant, confidence: 1.0 })
    }
}

/// A heap sampler returning a fixed usage ratio, for memory-watchdog tests.
pub struct FakeHeapSampler {
    pub used_mb: f64,
    pub total_mb: f64,
}

impl HeapSampler for FakeHeapSampler {
    fn sample(&self) -> HeapStats {
        HeapStats { used_mb: self.used_mb, total_mb: self.total_mb }
    }
}

/// Polls `condition` until it's true or `timeout_ms` elapses.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
