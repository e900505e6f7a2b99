//! Smart Cache Orchestrator: the single entry point for non-symbol cached
//! reads. Sits on top of a generic distributed K/V cache and decides, per
//! request, how fresh the data must be and whether to schedule a background
//! refresh.

pub mod scheduler;

pub use scheduler::BackgroundRefreshScheduler;

use crate::collaborators::{DataChangeDetector, DistributedCache, FallbackOptions, FetchFn, MarketStatusProvider};
use crate::config::OrchestratorConfig;
use crate::events::{now_ms, EventBus};
use crate::market;
use crate::models::Market;
use crate::ttl_policy::{self, CacheStrategy, TtlContext};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// A request to resolve through the smart cache.
#[derive(Clone)]
pub struct CacheRequest {
    pub cache_key: String,
    pub strategy: CacheStrategy,
    pub symbols: Vec<String>,
    pub fetch_fn: FetchFn,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub market: Option<Market>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmartCacheResult {
    pub cache_key: String,
    pub data: Vec<u8>,
    pub hit: bool,
    pub ttl_remaining: Duration,
    pub dynamic_ttl: Duration,
    pub strategy: CacheStrategy,
    pub timestamp_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WarmupReport {
    pub cache_key: String,
    pub success: bool,
    pub duration_ms: u64,
    pub ttl_secs: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub total: usize,
    pub cached: usize,
    pub expired: usize,
    pub avg_ttl_secs: f64,
    pub hit_rate: f64,
    pub recommendations: Vec<String>,
    pub hotspots: Vec<String>,
}

static HOT_KEY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["stock:.*:quote", "market:.*:status", "symbol:.*:mapping"]
        .iter()
        .map(|p| Regex::new(p).expect("valid hot-key pattern"))
        .collect()
});

fn is_hot_key(key: &str) -> bool {
    HOT_KEY_PATTERNS.iter().any(|re| re.is_match(key))
}

struct Inner {
    distributed_cache: Arc<dyn DistributedCache>,
    market_provider: Option<Arc<dyn MarketStatusProvider>>,
    events: EventBus,
    config: OrchestratorConfig,
    scheduler: BackgroundRefreshScheduler,
}

#[derive(Clone)]
pub struct SmartCacheOrchestrator {
    inner: Arc<Inner>,
}

impl SmartCacheOrchestrator {
    #[must_use]
    pub fn new(
        distributed_cache: Arc<dyn DistributedCache>,
        market_provider: Option<Arc<dyn MarketStatusProvider>>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_change_detector(distributed_cache, market_provider, None, events, config)
    }

    #[must_use]
    pub fn with_change_detector(
        distributed_cache: Arc<dyn DistributedCache>,
        market_provider: Option<Arc<dyn MarketStatusProvider>>,
        change_detector: Option<Arc<dyn DataChangeDetector>>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = BackgroundRefreshScheduler::new(
            distributed_cache.clone(),
            events.clone(),
            config.strategy.clone(),
            config.default_min_update_interval(),
            config.max_concurrent_updates,
            change_detector,
            config.enable_data_change_detection,
        );
        scheduler.start();
        Self { inner: Arc::new(Inner { distributed_cache, market_provider, events, config, scheduler }) }
    }

    #[must_use]
    pub fn scheduler(&self) -> &BackgroundRefreshScheduler {
        &self.inner.scheduler
    }

    pub async fn get_data_with_smart_cache(&self, request: CacheRequest) -> anyhow::Result<SmartCacheResult> {
        if request.strategy == CacheStrategy::NoCache {
            let data = (request.fetch_fn)().await?;
            return Ok(SmartCacheResult {
                cache_key: request.cache_key,
                data,
                hit: false,
                ttl_remaining: Duration::ZERO,
                dynamic_ttl: Duration::ZERO,
                strategy: request.strategy,
                timestamp_ms: now_ms(),
                error: None,
            });
        }

        let market_status = self.market_status_for(&request).await;
        let ttl_ctx = TtlContext { data_size_bytes: 0, last_updated: None, market_status };
        let ttl = ttl_policy::effective_ttl(request.strategy, &self.inner.config.strategy, ttl_ctx);

        let opts = FallbackOptions { cache_fallback_result: true, fallback_ttl: ttl.duration() };
        let outcome = self
            .inner
            .distributed_cache
            .get_with_fallback(&request.cache_key, request.fetch_fn.clone(), opts)
            .await;

        let (data, hit, ttl_remaining) = match outcome {
            Ok((data, metadata, hit)) => (data, hit, metadata.ttl_remaining.unwrap_or(ttl.duration())),
            Err(err) => {
                warn!(cache_key = %request.cache_key, error = %err, "smart cache lookup failed, falling back to direct fetch");
                match (request.fetch_fn)().await {
                    Ok(data) => {
                        return Ok(SmartCacheResult {
                            cache_key: request.cache_key,
                            data,
                            hit: false,
                            ttl_remaining: Duration::ZERO,
                            dynamic_ttl: ttl.duration(),
                            strategy: request.strategy,
                            timestamp_ms: now_ms(),
                            error: Some(err.to_string()),
                        });
                    }
                    Err(fallback_err) => return Err(fallback_err),
                }
            }
        };

        let result = SmartCacheResult {
            cache_key: request.cache_key.clone(),
            data,
            hit,
            ttl_remaining,
            dynamic_ttl: ttl.duration(),
            strategy: request.strategy,
            timestamp_ms: now_ms(),
            error: None,
        };

        if should_schedule_background_update(request.strategy, &result, self.inner.config.strategy.update_threshold_ratio) {
            self.inner.scheduler.schedule_background_update(
                &request.cache_key,
                request.symbols,
                request.fetch_fn,
                request.strategy,
            );
        }

        Ok(result)
    }

    /// Resolves every request with bounded concurrency, preserving order. When
    /// `retry_failures` is set, a second sequential pass retries whatever
    /// failed on the first pass, caching a success with a shorter TTL.
    pub async fn batch_get_data_with_smart_cache(&self, requests: Vec<CacheRequest>, retry_failures: bool) -> Vec<anyhow::Result<SmartCacheResult>> {
        const MISS_CONCURRENCY: usize = 5;
        const RETRY_TTL: Duration = Duration::from_secs(300);

        let mut results: Vec<anyhow::Result<SmartCacheResult>> = futures_util::stream::iter(requests.iter().cloned())
            .map(|req| self.get_data_with_smart_cache(req))
            .buffered(MISS_CONCURRENCY)
            .collect()
            .await;

        if retry_failures {
            for (request, result) in requests.iter().zip(results.iter_mut()) {
                if result.is_err() {
                    match (request.fetch_fn)().await {
                        Ok(data) => {
                            if let Err(err) = self.inner.distributed_cache.set(&request.cache_key, data.clone(), RETRY_TTL).await {
                                warn!(cache_key = %request.cache_key, error = %err, "batch retry write failed");
                            }
                            *result = Ok(SmartCacheResult {
                                cache_key: request.cache_key.clone(),
                                data,
                                hit: false,
                                ttl_remaining: RETRY_TTL,
                                dynamic_ttl: RETRY_TTL,
                                strategy: request.strategy,
                                timestamp_ms: now_ms(),
                                error: None,
                            });
                        }
                        Err(err) => warn!(cache_key = %request.cache_key, error = %err, "batch retry fetch failed"),
                    }
                }
            }
        }

        results
    }

    pub async fn warmup_hot_queries(&self, mut queries: Vec<(CacheRequest, u8)>) -> Vec<WarmupReport> {
        queries.sort_by(|a, b| b.1.cmp(&a.1));
        let mut reports = Vec::with_capacity(queries.len());

        for chunk in queries.chunks(3) {
            let futures = chunk.iter().cloned().map(|(request, _priority)| async move {
                let start = Instant::now();
                if let Ok(Some((_, metadata, _))) = self
                    .inner
                    .distributed_cache
                    .get(&request.cache_key)
                    .await
                    .map(|opt| opt.map(|(v, m)| (v, m, true)))
                {
                    if metadata.ttl_remaining.map(|d| d > Duration::from_secs(60)).unwrap_or(false) {
                        return WarmupReport {
                            cache_key: request.cache_key,
                            success: true,
                            duration_ms: 0,
                            ttl_secs: metadata.ttl_remaining.map(|d| d.as_secs()),
                            error: None,
                        };
                    }
                }

                match self.get_data_with_smart_cache(request.clone()).await {
                    Ok(result) => WarmupReport {
                        cache_key: request.cache_key,
                        success: true,
                        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        ttl_secs: Some(result.dynamic_ttl.as_secs()),
                        error: None,
                    },
                    Err(err) => WarmupReport {
                        cache_key: request.cache_key,
                        success: false,
                        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        ttl_secs: None,
                        error: Some(err.to_string()),
                    },
                }
            });
            reports.extend(futures_util::future::join_all(futures).await);
        }

        reports
    }

    pub async fn analyze_cache_performance(&self, keys: &[String]) -> AnalysisReport {
        let entries = self.inner.distributed_cache.mget(keys).await.unwrap_or_default();

        let total = keys.len();
        let mut cached = 0;
        let mut expired = 0;
        let mut ttl_sum = 0.0;
        let mut ttl_count = 0;
        let mut hotspots = Vec::new();

        for (key, entry) in keys.iter().zip(entries.iter()) {
            match entry {
                Some((_, metadata)) => {
                    cached += 1;
                    if let Some(ttl) = metadata.ttl_remaining {
                        ttl_sum += ttl.as_secs_f64();
                        ttl_count += 1;
                        if ttl < Duration::from_secs(300) {
                            hotspots.push(format!("{key}: will expire soon, consider refresh"));
                        }
                    }
                }
                None => {
                    expired += 1;
                    if is_hot_key(key) {
                        hotspots.push(format!("{key}: expired hot key, warm immediately"));
                    }
                }
            }
        }

        let avg_ttl_secs = if ttl_count > 0 { ttl_sum / f64::from(ttl_count) } else { 0.0 };
        let hit_rate = if total > 0 { cached as f64 / total as f64 } else { 0.0 };

        let mut recommendations = Vec::new();
        if hit_rate < 0.7 {
            recommendations.push("hit rate below 70%: raise TTL or warm more aggressively".to_string());
        }
        if ttl_count > 0 && avg_ttl_secs < 60.0 {
            recommendations.push("average TTL under 60s: TTL is likely too short".to_string());
        }
        if avg_ttl_secs > 3600.0 {
            recommendations.push("average TTL over 1h: watch for staleness".to_string());
        }

        AnalysisReport { total, cached, expired, avg_ttl_secs, hit_rate, recommendations, hotspots }
    }

    pub async fn set_data_with_adaptive_ttl(
        &self,
        key: &str,
        data: Vec<u8>,
        strategy: CacheStrategy,
        ctx: TtlContext,
    ) -> anyhow::Result<(Duration, CacheStrategy)> {
        let ttl = ttl_policy::effective_ttl(strategy, &self.inner.config.strategy, ctx);
        self.inner.distributed_cache.set(key, data, ttl.duration()).await?;
        Ok((ttl.duration(), strategy))
    }

    async fn market_status_for(&self, request: &CacheRequest) -> Option<crate::collaborators::MarketStatus> {
        if request.strategy != CacheStrategy::MarketAware {
            return None;
        }
        let provider = self.inner.market_provider.as_ref()?;
        let market = request
            .metadata
            .market
            .unwrap_or_else(|| market::infer_primary_market(&request.symbols));
        Some(provider.get_market_status(market).await)
    }

    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown(self.inner.config.graceful_shutdown_timeout()).await;
    }
}

fn should_schedule_background_update(strategy: CacheStrategy, result: &SmartCacheResult, threshold_ratio: f64) -> bool {
    if strategy == CacheStrategy::NoCache || !strategy.enable_background_update_by_default() {
        return false;
    }
    if result.dynamic_ttl.is_zero() {
        return false;
    }
    let remaining_ratio = result.ttl_remaining.as_secs_f64() / result.dynamic_ttl.as_secs_f64();
    result.hit && remaining_ratio <= threshold_ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(hit: bool, ttl_remaining_secs: u64, dynamic_ttl_secs: u64) -> SmartCacheResult {
        SmartCacheResult {
            cache_key: "k".to_string(),
            data: vec![],
            hit,
            ttl_remaining: Duration::from_secs(ttl_remaining_secs),
            dynamic_ttl: Duration::from_secs(dynamic_ttl_secs),
            strategy: CacheStrategy::Adaptive,
            timestamp_ms: 0,
            error: None,
        }
    }

    #[test]
    fn schedules_refresh_when_ttl_mostly_elapsed() {
        let result = sample_result(true, 50, 300);
        assert!(should_schedule_background_update(CacheStrategy::Adaptive, &result, 0.5));
    }

    #[test]
    fn does_not_schedule_refresh_for_fresh_hit() {
        let result = sample_result(true, 290, 300);
        assert!(!should_schedule_background_update(CacheStrategy::Adaptive, &result, 0.5));
    }

    #[test]
    fn never_schedules_for_no_cache() {
        let result = sample_result(true, 0, 300);
        assert!(!should_schedule_background_update(CacheStrategy::NoCache, &result, 0.5));
    }

    #[test]
    fn hot_key_patterns_match_expected_prefixes() {
        assert!(is_hot_key("stock:AAPL:quote"));
        assert!(is_hot_key("market:US:status"));
        assert!(!is_hot_key("unrelated:key"));
    }
}
