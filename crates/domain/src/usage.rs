//! Context usage math shared by the budget manager, the gate, and the
//! gateway status surface.

use serde::{Deserialize, Serialize};

use crate::config::ContextBudgetConfig;

/// Observed context consumption for a session at some instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Consumed tokens. `None` = the provider did not report usage.
    pub tokens: Option<u64>,
    /// Model context window; always > 0.
    pub context_window: u64,
}

impl ContextUsage {
    pub fn new(tokens: Option<u64>, context_window: u64) -> Self {
        Self {
            tokens,
            context_window: context_window.max(1),
        }
    }

    /// Consumed fraction of the window, when tokens were reported.
    pub fn percent(&self) -> Option<f64> {
        self.tokens
            .map(|t| t as f64 / self.context_window as f64)
    }
}

/// Derived pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Low,
    High,
    Critical,
}

impl Pressure {
    /// Classify usage against the configured thresholds. Unreported usage
    /// is low pressure — the gate never arms on missing data.
    pub fn classify(usage: &ContextUsage, config: &ContextBudgetConfig) -> Pressure {
        match usage.percent() {
            Some(p) if p >= config.hard_limit_ratio => Pressure::Critical,
            Some(p) if p >= config.compaction_threshold => Pressure::High,
            _ => Pressure::Low,
        }
    }
}

/// Per-model token usage reported for one assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnUsage {
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl TurnUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}
