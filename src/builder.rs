//! System builder.
//!
//! Mirrors the fluent `with_*` builder this crate's ancestor used to wire
//! optional backends together before constructing its top-level system
//! struct, generalized here to the tiered cache's collaborators plus the
//! optional orchestrator.

use crate::collaborators::{DataChangeDetector, DistributedCache, HeapSampler, MarketStatusProvider, ProcStatusHeapSampler, RuleStore};
use crate::config::{OrchestratorConfig, SymbolCacheConfig};
use crate::events::EventBus;
use crate::orchestrator::SmartCacheOrchestrator;
use crate::tiered_cache::{ChangeStreamSupervisor, MemoryWatchdog, TieredMappingCache};
use crate::SymbolCacheSystem;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SymbolCacheSystemBuilder {
    rule_store: Arc<dyn RuleStore>,
    config: SymbolCacheConfig,
    events: EventBus,
    heap_sampler: Arc<dyn HeapSampler>,
    start_change_stream: bool,
    start_watchdog: bool,
    orchestrator: Option<OrchestratorBuild>,
}

struct OrchestratorBuild {
    distributed_cache: Arc<dyn DistributedCache>,
    market_provider: Option<Arc<dyn MarketStatusProvider>>,
    change_detector: Option<Arc<dyn DataChangeDetector>>,
    config: OrchestratorConfig,
}

impl SymbolCacheSystemBuilder {
    #[must_use]
    pub fn new(rule_store: Arc<dyn RuleStore>) -> Self {
        Self {
            rule_store,
            config: SymbolCacheConfig::default(),
            events: EventBus::default(),
            heap_sampler: Arc::new(ProcStatusHeapSampler),
            start_change_stream: true,
            start_watchdog: true,
            orchestrator: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SymbolCacheConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_heap_sampler(mut self, sampler: Arc<dyn HeapSampler>) -> Self {
        self.heap_sampler = sampler;
        self
    }

    /// Disables the change-stream reconnect loop. Tests that never need live
    /// invalidation use this to avoid spawning a supervisor task.
    #[must_use]
    pub fn without_change_stream(mut self) -> Self {
        self.start_change_stream = false;
        self
    }

    #[must_use]
    pub fn without_memory_watchdog(mut self) -> Self {
        self.start_watchdog = false;
        self
    }

    /// Adds the Smart Cache Orchestrator, backed by the given distributed
    /// cache. Optional: a system with no orchestrator only serves symbol
    /// mapping lookups.
    #[must_use]
    pub fn with_orchestrator(
        mut self,
        distributed_cache: Arc<dyn DistributedCache>,
        config: OrchestratorConfig,
    ) -> Self {
        self.orchestrator = Some(OrchestratorBuild { distributed_cache, market_provider: None, change_detector: None, config });
        self
    }

    #[must_use]
    pub fn with_market_status_provider(mut self, provider: Arc<dyn MarketStatusProvider>) -> Self {
        if let Some(o) = &mut self.orchestrator {
            o.market_provider = Some(provider);
        }
        self
    }

    #[must_use]
    pub fn with_data_change_detector(mut self, detector: Arc<dyn DataChangeDetector>) -> Self {
        if let Some(o) = &mut self.orchestrator {
            o.change_detector = Some(detector);
        }
        self
    }

    #[must_use]
    pub fn build(self) -> SymbolCacheSystem {
        info!("building symbol cache system");
        let (config, warnings) = self.config.validated();
        for warning in warnings {
            warn!(%warning, "symbol cache config adjusted to a safe default");
        }

        let tiered_cache = TieredMappingCache::new(self.rule_store.clone(), config.clone(), self.events.clone());

        let change_stream = Arc::new(ChangeStreamSupervisor::new());
        if self.start_change_stream {
            change_stream.start(self.rule_store.clone(), tiered_cache.clone());
        }

        let watchdog = Arc::new(MemoryWatchdog::new());
        if self.start_watchdog {
            watchdog.start(
                self.heap_sampler,
                tiered_cache.l2_tier().clone(),
                tiered_cache.l3_tier().clone(),
                self.events.clone(),
                config.memory_check_interval(),
                config.cleanup_threshold,
                config.retention_ratio,
                config.lru_sort_batch_size,
            );
        }

        let orchestrator = self.orchestrator.map(|o| {
            let (orch_config, warnings) = o.config.validated();
            for warning in warnings {
                warn!(%warning, "orchestrator config adjusted to a safe default");
            }
            SmartCacheOrchestrator::with_change_detector(o.distributed_cache, o.market_provider, o.change_detector, self.events.clone(), orch_config)
        });

        info!("symbol cache system ready");
        SymbolCacheSystem { tiered_cache, orchestrator, change_stream, watchdog }
    }
}
