//! Background Refresh Scheduler: bounded-concurrency worker pool draining a
//! priority queue, throttled per key by a minimum update interval, with
//! linear-backoff retry and a poll-based graceful shutdown.

use crate::collaborators::{DataChangeDetector, DistributedCache, FetchFn, MarketStatus};
use crate::config::StrategyConfig;
use crate::events::{now_ms, CacheEvent, EventBus};
use crate::market;
use crate::models::TaskStatus;
use crate::ttl_policy::{self, CacheStrategy, TtlContext};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const LAST_UPDATE_PRUNE_AGE: Duration = Duration::from_secs(3600);

struct BackgroundTask {
    cache_key: String,
    symbols: Vec<String>,
    fetch_fn: FetchFn,
    strategy: CacheStrategy,
    priority: f64,
    scheduled_at: Instant,
    retry_count: u32,
    status: TaskStatus,
}

/// Wraps a task for the priority queue. `BinaryHeap` is a max-heap, so the
/// highest-priority task is dequeued first; ties break by insertion order
/// (`seq`) so the heap never needs `f64: Ord` directly.
struct QueueEntry {
    priority_fixed: i64,
    seq: u64,
    cache_key: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority_fixed == other.priority_fixed && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority_fixed.cmp(&other.priority_fixed).then_with(|| other.seq.cmp(&self.seq))
    }
}

fn fixed_point(priority: f64) -> i64 {
    (priority * 1000.0).round() as i64
}

struct Inner {
    tasks: DashMap<String, Mutex<BackgroundTask>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    last_update_times: DashMap<String, Instant>,
    active_count: AtomicUsize,
    is_shutting_down: AtomicBool,
    seq: AtomicUsize,
    distributed_cache: Arc<dyn DistributedCache>,
    events: EventBus,
    config: StrategyConfig,
    default_min_update_interval: Duration,
    max_concurrent_updates: usize,
    processor: Mutex<Option<JoinHandle<()>>>,
    change_detector: Option<Arc<dyn DataChangeDetector>>,
    enable_data_change_detection: bool,
}

/// Cheap to clone: all state lives behind `Arc`.
#[derive(Clone)]
pub struct BackgroundRefreshScheduler {
    inner: Arc<Inner>,
}

impl BackgroundRefreshScheduler {
    #[must_use]
    pub fn new(
        distributed_cache: Arc<dyn DistributedCache>,
        events: EventBus,
        config: StrategyConfig,
        default_min_update_interval: Duration,
        max_concurrent_updates: usize,
        change_detector: Option<Arc<dyn DataChangeDetector>>,
        enable_data_change_detection: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: DashMap::new(),
                queue: Mutex::new(BinaryHeap::new()),
                last_update_times: DashMap::new(),
                active_count: AtomicUsize::new(0),
                is_shutting_down: AtomicBool::new(false),
                seq: AtomicUsize::new(0),
                distributed_cache,
                events,
                config,
                default_min_update_interval,
                max_concurrent_updates,
                processor: Mutex::new(None),
                change_detector,
                enable_data_change_detection,
            }),
        }
    }

    pub fn start(&self) {
        let mut guard = self.inner.processor.lock();
        if guard.is_some() {
            return;
        }
        let scheduler = self.clone();
        let tick = self.inner.default_min_update_interval.div_f64(2.0).min(Duration::from_secs(5));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(50)));
            loop {
                ticker.tick().await;
                if scheduler.inner.is_shutting_down.load(AtomicOrdering::SeqCst) {
                    break;
                }
                scheduler.drain_ready().await;
            }
        }));
    }

    /// Enqueues a refresh for `cache_key`. Returns `false` if rejected
    /// (shutting down, already pending, or throttled by the per-key minimum
    /// update interval).
    pub fn schedule_background_update(&self, cache_key: &str, symbols: Vec<String>, fetch_fn: FetchFn, strategy: CacheStrategy) -> bool {
        if self.inner.is_shutting_down.load(AtomicOrdering::SeqCst) {
            return false;
        }
        if self.inner.tasks.contains_key(cache_key) {
            return false;
        }

        let market = market::infer_primary_market(&symbols);
        let min_interval = market.min_update_interval(self.inner.default_min_update_interval);
        let now = Instant::now();

        if let Some(last) = self.inner.last_update_times.get(cache_key) {
            if now.saturating_duration_since(*last) < min_interval {
                return false;
            }
        }

        let priority = priority_for(market, symbols.len());
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst) as u64;

        self.inner.tasks.insert(
            cache_key.to_string(),
            Mutex::new(BackgroundTask {
                cache_key: cache_key.to_string(),
                symbols,
                fetch_fn,
                strategy,
                priority,
                scheduled_at: now,
                retry_count: 0,
                status: TaskStatus::Pending,
            }),
        );
        self.inner.queue.lock().push(QueueEntry { priority_fixed: fixed_point(priority), seq, cache_key: cache_key.to_string() });
        self.inner.last_update_times.insert(cache_key.to_string(), now);
        self.prune_last_update_times();
        true
    }

    fn prune_last_update_times(&self) {
        let now = Instant::now();
        self.inner.last_update_times.retain(|_, last| now.saturating_duration_since(*last) < LAST_UPDATE_PRUNE_AGE);
    }

    async fn drain_ready(&self) {
        loop {
            if self.inner.active_count.load(AtomicOrdering::SeqCst) >= self.inner.max_concurrent_updates {
                return;
            }
            let entry = {
                let mut queue = self.inner.queue.lock();
                let Some(top) = queue.peek() else { return };
                let ready = self
                    .inner
                    .tasks
                    .get(&top.cache_key)
                    .map(|t| t.lock().scheduled_at <= Instant::now())
                    .unwrap_or(false);
                if !ready {
                    return;
                }
                queue.pop()
            };
            let Some(entry) = entry else { return };
            let Some((_, task_lock)) = self.inner.tasks.remove(&entry.cache_key) else { continue };

            self.inner.active_count.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.events.publish(CacheEvent::ActiveTasksCount {
                active_task_count: self.inner.active_count.load(AtomicOrdering::SeqCst),
                timestamp_ms: now_ms(),
            });

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.execute(task_lock).await;
            });
        }
    }

    async fn execute(&self, task_lock: Mutex<BackgroundTask>) {
        let (cache_key, symbols, fetch_fn, strategy, retry_count) = {
            let mut task = task_lock.lock();
            task.status = TaskStatus::Running;
            (task.cache_key.clone(), task.symbols.clone(), task.fetch_fn.clone(), task.strategy, task.retry_count)
        };

        let start = Instant::now();
        let result = (fetch_fn)().await;

        match result {
            Ok(data) => {
                let market = market::infer_primary_market(&symbols);
                let ttl = ttl_policy::effective_ttl(
                    strategy,
                    &self.inner.config,
                    TtlContext { data_size_bytes: data.len(), ..Default::default() },
                );

                if self.inner.enable_data_change_detection {
                    if let Some(detector) = &self.inner.change_detector {
                        let symbol = symbols.first().map_or("", String::as_str);
                        match detector.detect_significant_change(symbol, &data, market, MarketStatus::degraded_closed()).await {
                            Ok(change) if change.significant && change.confidence > 0.8 => {
                                warn!(cache_key = %cache_key, confidence = change.confidence, "significant data change detected during background refresh");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(cache_key = %cache_key, error = %err, "data change detection failed"),
                        }
                    }
                }

                if let Err(err) = self.inner.distributed_cache.set(&cache_key, data, ttl.duration()).await {
                    warn!(cache_key = %cache_key, error = %err, "background refresh write failed");
                }
                let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.inner.events.publish(CacheEvent::BackgroundTaskCompleted { cache_key, latency_ms, timestamp_ms: now_ms() });
            }
            Err(err) => {
                let next_retry = retry_count + 1;
                if next_retry < MAX_RETRIES {
                    let backoff = self.inner.default_min_update_interval * next_retry;
                    let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst) as u64;
                    let priority = {
                        let mut task = task_lock.lock();
                        task.retry_count = next_retry;
                        task.scheduled_at = Instant::now() + backoff;
                        task.status = TaskStatus::Pending;
                        task.priority
                    };
                    self.inner.tasks.insert(cache_key.clone(), task_lock);
                    self.inner.queue.lock().push(QueueEntry { priority_fixed: fixed_point(priority), seq, cache_key });
                } else {
                    warn!(cache_key = %cache_key, error = %err, retries = next_retry, "background refresh exhausted retries");
                    self.inner.events.publish(CacheEvent::BackgroundTaskFailed {
                        cache_key,
                        error: err.to_string(),
                        retry_count: next_retry,
                        timestamp_ms: now_ms(),
                    });
                }
            }
        }

        self.inner.active_count.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    /// Stops accepting new tasks, drops everything still queued, and waits up
    /// to `timeout` for in-flight work to finish. Running tasks are never
    /// force-cancelled; on timeout this just gives up waiting.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.is_shutting_down.store(true, AtomicOrdering::SeqCst);
        if let Some(handle) = self.inner.processor.lock().take() {
            handle.abort();
        }
        let dropped = self.inner.tasks.len();
        self.inner.tasks.clear();
        self.inner.queue.lock().clear();
        if dropped > 0 {
            info!(dropped, "graceful shutdown: dropped pending background tasks");
        }

        let deadline = Instant::now() + timeout;
        loop {
            let active = self.inner.active_count.load(AtomicOrdering::SeqCst);
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(active, "graceful shutdown timed out with tasks still running");
                self.inner.events.publish(CacheEvent::BackgroundTaskFailed {
                    cache_key: "<shutdown>".to_string(),
                    error: "shutdown_timeout".to_string(),
                    retry_count: u32::try_from(active).unwrap_or(u32::MAX),
                    timestamp_ms: now_ms(),
                });
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active_count.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.tasks.len()
    }
}

fn priority_for(market: crate::models::Market, symbol_count: usize) -> f64 {
    let mut rng = rand::thread_rng();
    1.0 + market.priority_weight() + (symbol_count as f64 * 0.1).min(1.0) + rng.gen::<f64>() * 0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_entry_orders_by_priority_then_insertion() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry { priority_fixed: fixed_point(1.0), seq: 0, cache_key: "a".into() });
        heap.push(QueueEntry { priority_fixed: fixed_point(3.0), seq: 1, cache_key: "b".into() });
        heap.push(QueueEntry { priority_fixed: fixed_point(2.0), seq: 2, cache_key: "c".into() });
        assert_eq!(heap.pop().unwrap().cache_key, "b");
        assert_eq!(heap.pop().unwrap().cache_key, "c");
        assert_eq!(heap.pop().unwrap().cache_key, "a");
    }

    #[test]
    fn priority_weights_us_above_hk_above_sz() {
        let us = priority_for(crate::models::Market::Us, 1);
        let hk = priority_for(crate::models::Market::Hk, 1);
        let sz = priority_for(crate::models::Market::Sz, 1);
        // The 0.1 jitter can't close a full 1.0-weight gap.
        assert!(us > hk);
        assert!(hk > sz);
    }
}
