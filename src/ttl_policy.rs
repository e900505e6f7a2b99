//! TTL Policy Engine: maps a request's caching strategy plus context
//! (data size, access pattern, market state, staleness) to an effective TTL.

use crate::collaborators::MarketStatus;
use crate::config::StrategyConfig;
use crate::models::{AccessPattern, TtlDecision};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    StrongTimeliness,
    WeakTimeliness,
    Adaptive,
    MarketAware,
    NoCache,
}

impl CacheStrategy {
    #[must_use]
    pub fn access_pattern(self) -> AccessPattern {
        match self {
            Self::StrongTimeliness => AccessPattern::Hot,
            Self::WeakTimeliness | Self::Adaptive | Self::MarketAware => AccessPattern::Warm,
            Self::NoCache => AccessPattern::Cold,
        }
    }

    #[must_use]
    pub fn enable_background_update_by_default(self) -> bool {
        !matches!(self, Self::NoCache | Self::StrongTimeliness)
    }
}

/// Extra context the engine uses to adjust a strategy's base TTL.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlContext {
    pub data_size_bytes: usize,
    pub last_updated: Option<SystemTime>,
    pub market_status: Option<MarketStatus>,
}

const ADAPTIVE_SIZE_THRESHOLD_BYTES: usize = 10 * 1024;
const ADAPTIVE_SIZE_FLOOR_SECS: u64 = 300;
const ADAPTIVE_STALENESS_THRESHOLD: Duration = Duration::from_secs(30 * 60);
const ADAPTIVE_STALENESS_FLOOR_SECS: u64 = 180;

/// Computes the effective TTL for a write under the given strategy.
/// `NoCache` has no meaningful TTL and is not expected to reach this
/// function — callers branch on it before ever computing a TTL.
#[must_use]
pub fn effective_ttl(strategy: CacheStrategy, config: &StrategyConfig, ctx: TtlContext) -> TtlDecision {
    match strategy {
        CacheStrategy::StrongTimeliness => TtlDecision::new(Duration::from_secs(config.strong_ttl_secs)),
        CacheStrategy::WeakTimeliness => {
            TtlDecision::bounded(Duration::from_secs(config.weak_ttl_secs), config.min_ttl(), config.max_ttl())
        }
        CacheStrategy::Adaptive => adaptive_ttl(config, ctx),
        CacheStrategy::MarketAware => market_aware_ttl(config, ctx),
        CacheStrategy::NoCache => TtlDecision::new(Duration::ZERO),
    }
}

fn adaptive_ttl(config: &StrategyConfig, ctx: TtlContext) -> TtlDecision {
    let mut ttl_secs = config.adaptive_base_ttl_secs as f64;

    if ctx.data_size_bytes > ADAPTIVE_SIZE_THRESHOLD_BYTES {
        ttl_secs = (ttl_secs * 0.8).max(ADAPTIVE_SIZE_FLOOR_SECS as f64);
    }

    if let Some(last_updated) = ctx.last_updated {
        let age = SystemTime::now().duration_since(last_updated).unwrap_or(Duration::ZERO);
        if age > ADAPTIVE_STALENESS_THRESHOLD {
            ttl_secs = (ttl_secs * 0.7).max(ADAPTIVE_STALENESS_FLOOR_SECS as f64);
        }
    }

    TtlDecision::bounded(Duration::from_secs_f64(ttl_secs), config.min_ttl(), config.max_ttl())
}

fn market_aware_ttl(config: &StrategyConfig, ctx: TtlContext) -> TtlDecision {
    let is_open = ctx.market_status.map(|s| s.is_open).unwrap_or(false);
    let secs = if is_open { config.open_market_ttl_secs } else { config.closed_market_ttl_secs };
    TtlDecision::new(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_timeliness_ignores_context() {
        let config = StrategyConfig::default();
        let ctx = TtlContext { data_size_bytes: 50_000, ..Default::default() };
        let ttl = effective_ttl(CacheStrategy::StrongTimeliness, &config, ctx);
        assert_eq!(ttl.duration(), Duration::from_secs(config.strong_ttl_secs));
    }

    #[test]
    fn adaptive_shrinks_ttl_for_large_payloads() {
        let config = StrategyConfig::default();
        let small = effective_ttl(CacheStrategy::Adaptive, &config, TtlContext::default());
        let large = effective_ttl(
            CacheStrategy::Adaptive,
            &config,
            TtlContext { data_size_bytes: 20_000, ..Default::default() },
        );
        assert!(large.duration() < small.duration());
    }

    #[test]
    fn adaptive_shrinks_further_for_stale_data() {
        let config = StrategyConfig::default();
        let stale_ctx = TtlContext {
            last_updated: Some(SystemTime::now() - Duration::from_secs(3600)),
            ..Default::default()
        };
        let stale = effective_ttl(CacheStrategy::Adaptive, &config, stale_ctx);
        let fresh = effective_ttl(CacheStrategy::Adaptive, &config, TtlContext::default());
        assert!(stale.duration() < fresh.duration());
    }

    #[test]
    fn market_aware_uses_open_ttl_when_open() {
        let config = StrategyConfig::default();
        let ctx = TtlContext {
            market_status: Some(MarketStatus { is_open: true, confidence: 1.0 }),
            ..Default::default()
        };
        let ttl = effective_ttl(CacheStrategy::MarketAware, &config, ctx);
        assert_eq!(ttl.duration(), Duration::from_secs(config.open_market_ttl_secs));
    }

    #[test]
    fn market_aware_defaults_closed_without_status() {
        let config = StrategyConfig::default();
        let ttl = effective_ttl(CacheStrategy::MarketAware, &config, TtlContext::default());
        assert_eq!(ttl.duration(), Duration::from_secs(config.closed_market_ttl_secs));
    }
}
