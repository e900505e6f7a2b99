//! In-process event bus.
//!
//! The cache core never calls a metrics SDK directly — it publishes typed
//! events on a broadcast channel and lets external observers translate them.
//! Mirrors how the cache manager this crate grew out of kept its invalidation
//! publisher decoupled from whatever consumed the Pub/Sub stream downstream.

use std::collections::HashMap;
use tokio::sync::broadcast;

/// Every event the cache core can emit. All carry an implicit publish-time
/// timestamp added by `EventBus::publish`, not by the caller.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    CacheHit {
        layer: CacheLayer,
        provider: String,
        symbol: Option<String>,
        timestamp_ms: u64,
    },
    CacheMiss {
        layer: CacheLayer,
        provider: String,
        symbol: Option<String>,
        timestamp_ms: u64,
    },
    CacheDisabled {
        reason: String,
        provider: String,
        timestamp_ms: u64,
    },
    OperationStart {
        provider: String,
        symbol_count: usize,
        direction: crate::models::Direction,
        is_batch: bool,
        timestamp_ms: u64,
    },
    OperationComplete {
        provider: String,
        symbol_count: usize,
        cache_hits: usize,
        processing_time_ms: u64,
        direction: crate::models::Direction,
        success: bool,
        timestamp_ms: u64,
    },
    OperationError {
        provider: String,
        error: String,
        processing_time_ms: u64,
        operation: String,
        symbol_count: usize,
        timestamp_ms: u64,
    },
    MemoryUsageCheck {
        heap_used_mb: f64,
        heap_total_mb: f64,
        tier_sizes: HashMap<String, usize>,
        timestamp_ms: u64,
    },
    MemoryThresholdExceeded {
        current_memory_mb: f64,
        threshold_mb: f64,
        queue_size_before_cleanup: usize,
        timestamp_ms: u64,
    },
    BackgroundTaskCompleted {
        cache_key: String,
        latency_ms: u64,
        timestamp_ms: u64,
    },
    BackgroundTaskFailed {
        cache_key: String,
        error: String,
        retry_count: u32,
        timestamp_ms: u64,
    },
    ActiveTasksCount {
        active_task_count: usize,
        timestamp_ms: u64,
    },
}

/// Which tier produced a hit or miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    L1,
    L2,
    L3,
}

/// Thin wrapper over a broadcast channel. `publish` never blocks: a full
/// subscriber buffer just drops that subscriber's oldest event, same
/// fire-and-forget semantics the spec requires of the request path.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Errors (no active subscribers) are intentionally swallowed.
    pub fn publish(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
