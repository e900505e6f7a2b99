//! Capability traits for the external systems this crate depends on but does
//! not implement: the persistent rule store, the distributed K/V cache, the
//! market-status feed, and the data-change detector. No concrete backend
//! ships here — modeled as small `async_trait` interfaces, the same shape as
//! the `CacheBackend`/`L2CacheBackend` split this crate's ancestor used to
//! keep Redis and Moka swappable behind trait objects.

use crate::models::{MappingRule, Market, ProviderRules};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A change observed on the rule store's change feed.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert { provider: Option<String> },
    Update { provider: Option<String> },
    Replace { provider: Option<String> },
    Delete { document_id: String, provider: Option<String> },
}

/// Read-through access to the persistent mapping-rule collection.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn find_by_data_source(&self, provider: &str) -> anyhow::Result<Option<ProviderRules>>;

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<MappingRule>>;

    /// Starts (or returns a handle to an already-running) subscription to the
    /// store's change feed. Implementations are expected to be idempotent:
    /// a second call while a subscription is active is a cheap no-op.
    async fn watch_changes(&self) -> anyhow::Result<Pin<Box<dyn futures_util::Stream<Item = anyhow::Result<ChangeEvent>> + Send>>>;
}

/// Metadata returned alongside a distributed-cache hit.
#[derive(Debug, Clone, Default)]
pub struct CacheMetadata {
    pub ttl_remaining: Option<Duration>,
}

/// Options controlling `get_with_fallback`'s caching of the fallback result.
#[derive(Debug, Clone, Copy)]
pub struct FallbackOptions {
    pub cache_fallback_result: bool,
    pub fallback_ttl: Duration,
}

pub type FetchFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send>>;
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// The generic distributed key/value store the Smart Cache Orchestrator sits on top of.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, CacheMetadata)>>;

    async fn mget(&self, keys: &[String]) -> anyhow::Result<Vec<Option<(Vec<u8>, CacheMetadata)>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;

    /// Returns the cached value if present, otherwise runs `fetch_fn`,
    /// optionally caching its result per `opts`.
    async fn get_with_fallback(
        &self,
        key: &str,
        fetch_fn: FetchFn,
        opts: FallbackOptions,
    ) -> anyhow::Result<(Vec<u8>, CacheMetadata, bool)>;
}

/// A point-in-time read of whether a market is open, with a confidence score
/// used when the provider had to degrade gracefully (e.g. assume closed).
#[derive(Debug, Clone, Copy)]
pub struct MarketStatus {
    pub is_open: bool,
    pub confidence: f64,
}

impl MarketStatus {
    #[must_use]
    pub fn degraded_closed() -> Self {
        Self { is_open: false, confidence: 0.5 }
    }
}

#[async_trait]
pub trait MarketStatusProvider: Send + Sync {
    async fn get_market_status(&self, market: Market) -> MarketStatus;
}

/// Outcome of comparing freshly fetched data against what was cached.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetection {
    pub significant: bool,
    pub confidence: f64,
}

#[async_trait]
pub trait DataChangeDetector: Send + Sync {
    async fn detect_significant_change(
        &self,
        symbol: &str,
        new_data: &[u8],
        market: Market,
        market_status: MarketStatus,
    ) -> anyhow::Result<ChangeDetection>;
}

/// Samples process heap usage for the memory watchdog. Kept as a trait so the
/// effectful OS probe is swappable (a real `/proc/self/status` reader in
/// production, an in-memory fake in tests), the same externalize-the-effect
/// approach this crate's ancestor used for its `REDIS_URL`-backed constructor
/// vs. trait-based backend injection.
pub trait HeapSampler: Send + Sync {
    fn sample(&self) -> HeapStats;
}

#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub used_mb: f64,
    pub total_mb: f64,
}

/// Reads `/proc/self/status` on Linux; falls back to a fixed 0/1024 reading
/// (never triggers cleanup) on platforms without it.
pub struct ProcStatusHeapSampler;

impl HeapSampler for ProcStatusHeapSampler {
    fn sample(&self) -> HeapStats {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                let vm_rss_kb = status
                    .lines()
                    .find(|l| l.starts_with("VmRSS:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<f64>().ok());
                if let Some(kb) = vm_rss_kb {
                    return HeapStats { used_mb: kb / 1024.0, total_mb: 1024.0 };
                }
            }
        }
        HeapStats { used_mb: 0.0, total_mb: 1024.0 }
    }
}

impl Default for ProcStatusHeapSampler {
    fn default() -> Self {
        Self
    }
}
