//! Change Stream Supervisor: subscribes to the rule store's change feed and
//! dispatches provider-scoped invalidations, reconnecting with bounded
//! exponential backoff on disconnect.
//!
//! Grounded on the reconnect-loop shape of the invalidation subscriber this
//! crate's ancestor ran over Redis Pub/Sub: a `tokio::select!` between the
//! stream and a shutdown signal, with a sleep-then-resubscribe loop on error.
//! Here the failure mode is a change-feed stream ending rather than a Pub/Sub
//! connection dropping, but the supervision shape is the same.

use crate::collaborators::{ChangeEvent, RuleStore};
use crate::tiered_cache::TieredMappingCache;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct ChangeStreamSupervisor {
    active: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChangeStreamSupervisor {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self { active: Arc::new(AtomicBool::new(false)), shutdown, handle: std::sync::Mutex::new(None) }
    }

    /// Starts the supervision loop. Idempotent: a second call while already
    /// active returns immediately without spawning a duplicate task.
    pub fn start(&self, store: Arc<dyn RuleStore>, cache: TieredMappingCache) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let active = self.active.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let subscribe_result = store.watch_changes().await;
                let mut stream = match subscribe_result {
                    Ok(stream) => {
                        attempt = 0;
                        stream
                    }
                    Err(err) => {
                        let delay = backoff_delay(attempt);
                        warn!(error = %err, attempt, delay_secs = delay.as_secs(), "change stream subscribe failed, retrying");
                        attempt = attempt.saturating_add(1);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => continue,
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        next = stream.next() => {
                            match next {
                                Some(Ok(event)) => dispatch(&cache, event),
                                Some(Err(err)) => {
                                    warn!(error = %err, "change stream emitted an error, reconnecting");
                                    break;
                                }
                                None => {
                                    warn!("change stream closed, reconnecting");
                                    break;
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            active.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }

                let delay = backoff_delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            active.store(false, Ordering::SeqCst);
        });

        *self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
        self.active.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for ChangeStreamSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(MAX_BACKOFF.as_secs());
    Duration::from_secs(secs)
}

fn dispatch(cache: &TieredMappingCache, event: ChangeEvent) {
    let provider = match event {
        ChangeEvent::Insert { provider } | ChangeEvent::Update { provider } | ChangeEvent::Replace { provider } => {
            provider
        }
        ChangeEvent::Delete { provider, document_id } => provider.or_else(|| {
            warn!(document_id = %document_id, "delete event missing provider, falling back to clear_all");
            None
        }),
    };

    match provider {
        Some(p) => {
            info!(provider = %p, "invalidating provider after change event");
            cache.invalidate_provider(&p);
        }
        None => {
            info!("clearing entire cache: change event had no resolvable provider");
            cache.clear_all();
        }
    }
}
