//! Memory Watchdog: periodic heap sampling with a gradual-cleanup escalator
//! and priority-weighted LRU eviction when usage crosses the configured
//! threshold.

use crate::collaborators::{HeapSampler, HeapStats};
use crate::events::{now_ms, CacheEvent, EventBus};
use crate::lru::{ConcurrentLruTtl, EvictionCandidate};
use crate::models::BatchResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Weight applied to symbols tagged as belonging to a primary market
/// (lower value = more worth preserving).
const PRIMARY_MARKET_VALUE: f64 = 0.2;
const SECONDARY_MARKET_VALUE: f64 = 0.3;
const EPHEMERAL_TOKEN_VALUE: f64 = 0.9;
const DEFAULT_VALUE: f64 = 0.5;

pub struct MemoryWatchdog {
    running: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryWatchdog {
    #[must_use]
    pub fn new() -> Self {
        Self { running: Arc::new(AtomicBool::new(false)), handle: std::sync::Mutex::new(None) }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        sampler: Arc<dyn HeapSampler>,
        l2: ConcurrentLruTtl<String>,
        l3: ConcurrentLruTtl<BatchResult>,
        events: EventBus,
        check_interval: std::time::Duration,
        cleanup_threshold: f64,
        retention_ratio: f64,
        batch_size: usize,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let stats = sampler.sample();
                let mut tier_sizes = std::collections::HashMap::new();
                tier_sizes.insert("l2".to_string(), l2.len());
                tier_sizes.insert("l3".to_string(), l3.len());

                events.publish(CacheEvent::MemoryUsageCheck {
                    heap_used_mb: stats.used_mb,
                    heap_total_mb: stats.total_mb,
                    tier_sizes,
                    timestamp_ms: now_ms(),
                });

                let usage_ratio = usage_ratio(stats);
                if usage_ratio > cleanup_threshold {
                    events.publish(CacheEvent::MemoryThresholdExceeded {
                        current_memory_mb: stats.used_mb,
                        threshold_mb: stats.total_mb * cleanup_threshold,
                        queue_size_before_cleanup: l2.len(),
                        timestamp_ms: now_ms(),
                    });
                    run_gradual_cleanup(&l2, &l3, retention_ratio, batch_size);
                }
            }
        });

        *self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Default for MemoryWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

fn usage_ratio(stats: HeapStats) -> f64 {
    if stats.total_mb <= 0.0 {
        0.0
    } else {
        stats.used_mb / stats.total_mb
    }
}

fn run_gradual_cleanup(l2: &ConcurrentLruTtl<String>, l3: &ConcurrentLruTtl<BatchResult>, retention_ratio: f64, batch_size: usize) {
    l3.clear();
    info!("gradual cleanup: cleared L3 entirely");

    let target_len = (l2.len() as f64 * retention_ratio).floor() as usize;
    let to_evict = l2.len().saturating_sub(target_len);
    if to_evict == 0 {
        return;
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        evict_priority_weighted(l2, to_evict, batch_size)
    }));

    match result {
        Ok(evicted) => info!(evicted, target_len, "gradual cleanup: priority-weighted eviction complete"),
        Err(_) => {
            error!("priority-weighted eviction panicked, falling back to clearing L2 entirely");
            l2.clear();
        }
    }
}

fn eviction_score(candidate: &EvictionCandidate) -> f64 {
    // `lru_rank` 0 is the least-recently-used entry, farthest from the head of the list.
    let distance_from_head_ratio = if candidate.total == 0 { 0.0 } else { 1.0 - (candidate.lru_rank as f64 / candidate.total as f64) };
    let time_decay = distance_from_head_ratio;
    let access_infrequency = distance_from_head_ratio;
    let data_value = data_value_for_key(&candidate.key);

    0.4 * time_decay + 0.4 * access_infrequency + 0.2 * data_value
}

fn data_value_for_key(key: &str) -> f64 {
    let lower = key.to_lowercase();
    if lower.contains("test") || lower.contains("temp") || lower.contains("debug") {
        EPHEMERAL_TOKEN_VALUE
    } else if key.contains(".HK") || key.contains(".SZ") || key.contains(".SS") {
        PRIMARY_MARKET_VALUE
    } else if key.contains(".US") || key.contains(".NASDAQ") || key.contains(".NYSE") {
        SECONDARY_MARKET_VALUE
    } else {
        DEFAULT_VALUE
    }
}

fn evict_priority_weighted(l2: &ConcurrentLruTtl<String>, to_evict: usize, batch_size: usize) -> usize {
    let mut candidates = l2.eviction_candidates();
    candidates.sort_by(|a, b| eviction_score(b).partial_cmp(&eviction_score(a)).unwrap_or(std::cmp::Ordering::Equal));

    let mut evicted = 0;
    for chunk in candidates.chunks(batch_size) {
        if evicted >= to_evict {
            break;
        }
        let remaining = to_evict - evicted;
        let keys: Vec<&str> = chunk.iter().take(remaining).map(|c| c.key.as_str()).collect();
        evicted += l2.evict_many(keys);
    }
    evicted
}
