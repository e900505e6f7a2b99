//! Cache key generation.
//!
//! Batch keys and pending (in-flight dedup) keys are generated identically on
//! purpose: a batch request and a concurrent identical pending lookup must
//! hash to the same string so they coalesce onto one store round-trip.

use crate::models::Direction;

fn normalize_provider(provider: &str) -> String {
    provider.to_lowercase()
}

fn sorted_csv(symbols: &[String]) -> String {
    let mut sorted: Vec<&str> = symbols.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

fn digest(symbols: &[String]) -> String {
    format!("{:x}", md5::compute(sorted_csv(symbols)))
}

#[must_use]
pub fn rules_key(provider: &str) -> String {
    format!("rules:{}", normalize_provider(provider))
}

#[must_use]
pub fn symbol_key(provider: &str, direction: Direction, input: &str) -> String {
    format!("symbol:{}:{direction}:{input}", normalize_provider(provider))
}

#[must_use]
pub fn batch_key(provider: &str, direction: Direction, symbols: &[String]) -> String {
    format!("batch:{}:{direction}:{}", normalize_provider(provider), digest(symbols))
}

#[must_use]
pub fn pending_key(provider: &str, direction: Direction, symbols: &[String]) -> String {
    format!("pending:{}:{direction}:{}", normalize_provider(provider), digest(symbols))
}
