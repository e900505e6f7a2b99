//! Market inference from a raw symbol string.
//!
//! Shared by the tiered cache's bidirectional back-fill, the orchestrator's
//! market-aware TTL strategy, and the background scheduler's priority and
//! throttle computation. Precedence is evaluated top to bottom and stops at
//! the first match.

use crate::models::Market;
use once_cell::sync::Lazy;
use regex::Regex;

static US_TICKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{1,5}$").expect("valid regex"));
static HK_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{5}$").expect("valid regex"));

#[must_use]
pub fn infer_market(symbol: &str) -> Market {
    if symbol.contains(".HK") || HK_NUMERIC.is_match(symbol) {
        return Market::Hk;
    }
    if US_TICKER.is_match(symbol) {
        return Market::Us;
    }
    if symbol.contains(".SZ") || symbol.starts_with("00") || symbol.starts_with("30") {
        return Market::Sz;
    }
    if symbol.contains(".SH") || symbol.starts_with("60") || symbol.starts_with("68") {
        return Market::Sh;
    }
    Market::Us
}

/// Market for a batch of symbols, inferred from the first element. Empty
/// input defaults to `Us`, matching the engine's overall US default.
#[must_use]
pub fn infer_primary_market(symbols: &[String]) -> Market {
    symbols.first().map_or(Market::Us, |s| infer_market(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hk_numeric_symbol() {
        assert_eq!(infer_market("00700"), Market::Hk);
    }

    #[test]
    fn hk_suffixed_symbol() {
        assert_eq!(infer_market("700.HK"), Market::Hk);
    }

    #[test]
    fn us_ticker() {
        assert_eq!(infer_market("AAPL"), Market::Us);
    }

    #[test]
    fn sz_prefixed_symbol() {
        assert_eq!(infer_market("000001"), Market::Sz);
    }

    #[test]
    fn sh_prefixed_symbol() {
        assert_eq!(infer_market("600000"), Market::Sh);
    }

    #[test]
    fn unrecognized_falls_back_to_us() {
        assert_eq!(infer_market("weird_token_123"), Market::Us);
    }
}
