//! Error types for the symbol cache core.
//!
//! Request-path failures that a caller might want to match on are typed here.
//! Everything else (collaborator plumbing, background-task internals) composes
//! through `anyhow::Result`, same split the cache manager this crate grew out of
//! used between its public surface and its internals.

use thiserror::Error;

/// Errors surfaced at the public boundary of the tiered cache and the orchestrator.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A caller-supplied argument failed validation before any cache or store access.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The rule store (or distributed cache) could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    /// A store query did not complete before its deadline.
    #[error("query for {cache_key} timed out after {deadline_ms}ms")]
    QueryTimeout { cache_key: String, deadline_ms: u64 },

    /// A background refresh task exhausted its retry budget.
    #[error("background refresh for {cache_key} failed after {retries} retries")]
    BackgroundTaskFailed { cache_key: String, retries: u32 },
}

impl CacheError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Validates a cache key has the `prefix:content` shape with at least two
/// non-empty colon-separated segments, per the key discipline every tier shares.
pub fn validate_cache_key(key: &str) -> Result<(), CacheError> {
    let segments: Vec<&str> = key.split(':').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(CacheError::invalid_input(format!(
            "malformed cache key '{key}': expected at least two non-empty ':'-separated segments"
        )));
    }
    Ok(())
}
