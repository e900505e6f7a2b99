//! Symbol Mapping Cache Core & Smart Cache Orchestrator
//!
//! A tiered, in-process cache for translating vendor-specific financial
//! instrument identifiers, paired with a strategy-driven orchestrator for
//! generic cached reads backed by a distributed key/value store. Features:
//!
//! - **Tiered Mapping Cache**: L1 provider rules, L2 single-symbol entries,
//!   L3 batch results, all on one concurrent LRU-with-TTL primitive.
//! - **Stampede protection**: per-key in-flight deduplication so identical
//!   concurrent batch lookups issue a single store query.
//! - **Change stream invalidation**: reconnects with bounded exponential
//!   backoff and invalidates by provider scope.
//! - **Memory watchdog**: priority-weighted LRU eviction under pressure.
//! - **Smart Cache Orchestrator**: per-request TTL policy, stale-while-refresh,
//!   and a bounded-concurrency background refresh scheduler.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use symbol_cache_core::{SymbolCacheSystemBuilder, Direction};
//! use std::sync::Arc;
//!
//! # async fn example(rule_store: Arc<dyn symbol_cache_core::RuleStore>) -> anyhow::Result<()> {
//! let system = SymbolCacheSystemBuilder::new(rule_store).build();
//!
//! let result = system
//!     .tiered_cache()
//!     .map_symbols("tiger", &["700.HK".to_string()], Direction::ToStandard)
//!     .await?;
//!
//! println!("{:?}", result.mapping_details);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod keygen;
pub mod lru;
pub mod market;
pub mod models;
pub mod orchestrator;
pub mod ttl_policy;

pub mod tiered_cache;

mod builder;

pub use builder::SymbolCacheSystemBuilder;
pub use collaborators::{
    ChangeDetection, ChangeEvent, DataChangeDetector, DistributedCache, FallbackOptions, HeapSampler, HeapStats,
    MarketStatus, MarketStatusProvider, RuleStore,
};
pub use config::{OrchestratorConfig, StrategyConfig, SymbolCacheConfig};
pub use error::CacheError;
pub use events::{CacheEvent, CacheLayer, EventBus};
pub use models::{BatchResult, Direction, Market, MappingRule, ProviderRules, TaskStatus};
pub use orchestrator::{CacheRequest, RequestMetadata, SmartCacheOrchestrator, SmartCacheResult, WarmupReport};
pub use tiered_cache::{ChangeStreamSupervisor, MemoryWatchdog, RuleStoreGateway, TieredMappingCache};
pub use ttl_policy::CacheStrategy;

pub use async_trait::async_trait;

use std::sync::Arc;

/// Owns both subsystems plus their background tasks (change stream
/// supervisor, memory watchdog, refresh scheduler) and stops them together.
#[derive(Clone)]
pub struct SymbolCacheSystem {
    tiered_cache: TieredMappingCache,
    orchestrator: Option<SmartCacheOrchestrator>,
    change_stream: Arc<ChangeStreamSupervisor>,
    watchdog: Arc<MemoryWatchdog>,
}

impl SymbolCacheSystem {
    #[must_use]
    pub fn tiered_cache(&self) -> &TieredMappingCache {
        &self.tiered_cache
    }

    #[must_use]
    pub fn orchestrator(&self) -> Option<&SmartCacheOrchestrator> {
        self.orchestrator.as_ref()
    }

    pub async fn shutdown(&self) {
        self.change_stream.shutdown();
        self.watchdog.shutdown();
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.shutdown().await;
        }
    }
}
