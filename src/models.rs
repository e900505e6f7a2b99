//! Data model shared by the tiered mapping cache and the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Which side of a mapping rule is the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Vendor identifier -> canonical identifier.
    ToStandard,
    /// Canonical identifier -> vendor identifier.
    FromStandard,
}

impl Direction {
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::ToStandard => Self::FromStandard,
            Self::FromStandard => Self::ToStandard,
        }
    }

    fn as_key_segment(self) -> &'static str {
        match self {
            Self::ToStandard => "to_standard",
            Self::FromStandard => "from_standard",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key_segment())
    }
}

/// One vendor <-> standard identifier pairing for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub provider: String,
    pub sdk_symbol: String,
    pub standard_symbol: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl MappingRule {
    /// The source/target field pair for the given direction.
    #[must_use]
    pub fn translate(&self, direction: Direction, input: &str) -> Option<String> {
        if !self.is_active {
            return None;
        }
        match direction {
            Direction::ToStandard if self.sdk_symbol == input => Some(self.standard_symbol.clone()),
            Direction::FromStandard if self.standard_symbol == input => Some(self.sdk_symbol.clone()),
            _ => None,
        }
    }
}

/// Ordered set of mapping rules for one provider, as cached in L1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRules {
    pub provider: String,
    pub rules: Vec<MappingRule>,
}

impl ProviderRules {
    #[must_use]
    pub fn empty(provider: impl Into<String>) -> Self {
        Self { provider: provider.into(), rules: Vec::new() }
    }

    /// First active rule resolving `input` in `direction`, if any.
    #[must_use]
    pub fn resolve(&self, direction: Direction, input: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.translate(direction, input))
    }
}

/// Return shape of a batch mapping request (and of a single-symbol request,
/// represented as a batch of one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: bool,
    pub provider: String,
    pub direction: Direction,
    pub total_processed: usize,
    pub cache_hits: usize,
    pub mapping_details: HashMap<String, String>,
    pub failed_symbols: Vec<String>,
    pub processing_time_ms: u64,
}

impl BatchResult {
    #[must_use]
    pub fn failure(provider: impl Into<String>, direction: Direction, symbols: &[String]) -> Self {
        Self {
            success: false,
            provider: provider.into(),
            direction,
            total_processed: symbols.len(),
            cache_hits: 0,
            mapping_details: HashMap::new(),
            failed_symbols: symbols.to_vec(),
            processing_time_ms: 0,
        }
    }
}

/// Status of a scheduled refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A caller-declared affinity to a market, used by the background scheduler
/// to pick a minimum update interval and a priority weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    Us,
    Hk,
    Sz,
    Sh,
}

impl Market {
    #[must_use]
    pub fn min_update_interval(self, base: Duration) -> Duration {
        match self {
            Self::Us => base,
            Self::Hk => base.max(Duration::from_secs(45)),
            Self::Sz | Self::Sh => base.max(Duration::from_secs(60)),
        }
    }

    #[must_use]
    pub fn priority_weight(self) -> f64 {
        match self {
            Self::Us => 3.0,
            Self::Hk => 2.0,
            Self::Sz | Self::Sh => 1.0,
        }
    }
}

/// Effective TTL computed by the policy engine for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlDecision(Duration);

impl TtlDecision {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    #[must_use]
    pub fn bounded(duration: Duration, min: Duration, max: Duration) -> Self {
        Self(duration.clamp(min, max))
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        self.0
    }
}

/// How urgently a key should be treated by cache-tier sizing and eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Hot,
    Warm,
    Cold,
}
