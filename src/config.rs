//! Configuration surface. Every knob is a plain, serde-deserializable value;
//! loading it from environment, file, or remote config service is an
//! external collaborator's job, not this crate's. Validation clamps
//! out-of-bounds values to safe defaults and returns warnings to log rather
//! than panicking — a misconfigured cache should degrade, not crash startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolCacheConfig {
    pub rule_cache_max_size: usize,
    pub rule_cache_ttl_secs: u64,
    pub symbol_cache_max_size: usize,
    pub symbol_cache_ttl_secs: u64,
    pub batch_result_cache_max_size: usize,
    pub batch_result_cache_ttl_secs: u64,
    pub query_timeout_ms: u64,
    pub memory_check_interval_secs: u64,
    pub symbol_mapping_cache_enabled: bool,
    pub pass_through_unmapped: bool,
    pub cleanup_threshold: f64,
    pub retention_ratio: f64,
    pub lru_sort_batch_size: usize,
}

impl Default for SymbolCacheConfig {
    fn default() -> Self {
        Self {
            rule_cache_max_size: 500,
            rule_cache_ttl_secs: 3600,
            symbol_cache_max_size: 50_000,
            symbol_cache_ttl_secs: 1800,
            batch_result_cache_max_size: 5_000,
            batch_result_cache_ttl_secs: 300,
            query_timeout_ms: 5_000,
            memory_check_interval_secs: 60,
            symbol_mapping_cache_enabled: true,
            pass_through_unmapped: true,
            cleanup_threshold: 0.85,
            retention_ratio: 0.25,
            lru_sort_batch_size: 1_000,
        }
    }
}

impl SymbolCacheConfig {
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        millis(self.query_timeout_ms)
    }

    #[must_use]
    pub fn rule_cache_ttl(&self) -> Duration {
        secs(self.rule_cache_ttl_secs)
    }

    #[must_use]
    pub fn symbol_cache_ttl(&self) -> Duration {
        secs(self.symbol_cache_ttl_secs)
    }

    #[must_use]
    pub fn batch_result_cache_ttl(&self) -> Duration {
        secs(self.batch_result_cache_ttl_secs)
    }

    #[must_use]
    pub fn memory_check_interval(&self) -> Duration {
        secs(self.memory_check_interval_secs)
    }

    /// Clamps obviously-unsafe values to defaults, returning what it changed.
    #[must_use]
    pub fn validated(mut self) -> (Self, Vec<String>) {
        let defaults = Self::default();
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.cleanup_threshold) {
            warnings.push(format!(
                "cleanup_threshold {} out of [0,1], using default {}",
                self.cleanup_threshold, defaults.cleanup_threshold
            ));
            self.cleanup_threshold = defaults.cleanup_threshold;
        }
        if !(0.0..=1.0).contains(&self.retention_ratio) {
            warnings.push(format!(
                "retention_ratio {} out of [0,1], using default {}",
                self.retention_ratio, defaults.retention_ratio
            ));
            self.retention_ratio = defaults.retention_ratio;
        }
        if self.query_timeout_ms == 0 {
            warnings.push("query_timeout_ms was 0, using default".to_string());
            self.query_timeout_ms = defaults.query_timeout_ms;
        }
        if self.lru_sort_batch_size == 0 {
            warnings.push("lru_sort_batch_size was 0, using default".to_string());
            self.lru_sort_batch_size = defaults.lru_sort_batch_size;
        }

        (self, warnings)
    }
}

/// Per-strategy TTL policy knobs. Mirrors the strategy table in the TTL
/// policy engine one-to-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub strong_ttl_secs: u64,
    pub weak_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub adaptive_base_ttl_secs: u64,
    pub open_market_ttl_secs: u64,
    pub closed_market_ttl_secs: u64,
    pub market_status_check_interval_secs: u64,
    pub update_threshold_ratio: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strong_ttl_secs: 5,
            weak_ttl_secs: 300,
            min_ttl_secs: 30,
            max_ttl_secs: 3600,
            adaptive_base_ttl_secs: 600,
            open_market_ttl_secs: 15,
            closed_market_ttl_secs: 900,
            market_status_check_interval_secs: 60,
            update_threshold_ratio: 0.5,
        }
    }
}

impl StrategyConfig {
    #[must_use]
    pub fn min_ttl(&self) -> Duration {
        secs(self.min_ttl_secs)
    }

    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        secs(self.max_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_min_update_interval_ms: u64,
    pub max_concurrent_updates: usize,
    pub enable_background_update: bool,
    pub enable_data_change_detection: bool,
    pub enable_metrics: bool,
    pub graceful_shutdown_timeout_ms: u64,
    pub strategy: StrategyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_min_update_interval_ms: 30_000,
            max_concurrent_updates: 5,
            enable_background_update: true,
            enable_data_change_detection: false,
            enable_metrics: true,
            graceful_shutdown_timeout_ms: 30_000,
            strategy: StrategyConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn default_min_update_interval(&self) -> Duration {
        millis(self.default_min_update_interval_ms)
    }

    #[must_use]
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        millis(self.graceful_shutdown_timeout_ms)
    }

    #[must_use]
    pub fn validated(mut self) -> (Self, Vec<String>) {
        let defaults = Self::default();
        let mut warnings = Vec::new();

        let clamped = self.default_min_update_interval_ms.clamp(5_000, 300_000);
        if clamped != self.default_min_update_interval_ms {
            warnings.push(format!(
                "default_min_update_interval_ms {} clamped to {clamped}",
                self.default_min_update_interval_ms
            ));
            self.default_min_update_interval_ms = clamped;
        }
        if self.max_concurrent_updates == 0 {
            warnings.push("max_concurrent_updates was 0, using default".to_string());
            self.max_concurrent_updates = defaults.max_concurrent_updates;
        }
        let clamped_shutdown = self.graceful_shutdown_timeout_ms.clamp(10_000, 120_000);
        if clamped_shutdown != self.graceful_shutdown_timeout_ms {
            warnings.push(format!(
                "graceful_shutdown_timeout_ms {} clamped to {clamped_shutdown}",
                self.graceful_shutdown_timeout_ms
            ));
            self.graceful_shutdown_timeout_ms = clamped_shutdown;
        }

        (self, warnings)
    }
}
