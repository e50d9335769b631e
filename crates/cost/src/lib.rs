//! Per-session token/USD accounting with proportional per-tool allocation
//! and budget alerts.

pub mod tracker;

pub use tracker::{BudgetStatus, CostSnapshot, CostSummary, CostTracker, ToolCost, UsageContext};
