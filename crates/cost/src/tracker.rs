//! The cost tracker.
//!
//! Usage is recorded per assistant turn and partitioned across that turn's
//! tool calls proportionally to their call counts. Budget thresholds fire
//! one alert per kind/scope; with `action_on_exceed = block_tools` the
//! budget status flips to `blocked` so the tool-policy layer denies
//! subsequent non-lifecycle calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use ov_domain::config::{ActionOnExceed, CostConfig};
use ov_domain::usage::TurnUsage;
use ov_events::EventStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn/skill attribution for a usage record.
#[derive(Debug, Clone, Default)]
pub struct UsageContext {
    pub turn: u64,
    pub skill: Option<String>,
}

/// Accumulated state for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionCosts {
    total_tokens: u64,
    total_cost_usd: f64,
    per_model_tokens: HashMap<String, u64>,
    per_skill_tokens: HashMap<String, u64>,
    per_skill_cost_usd: HashMap<String, f64>,
    /// turn -> (total tokens that turn, tool -> call count).
    turns: HashMap<u64, TurnCosts>,
    /// Alert keys already fired, e.g. `session_alert`, `skill_cap:build`.
    fired_alerts: HashSet<String>,
    blocked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TurnCosts {
    total_tokens: u64,
    tool_calls: HashMap<String, u64>,
}

/// Per-tool allocation in a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCost {
    pub tool: String,
    pub calls: u64,
    pub allocated_tokens: u64,
}

/// Session cost summary with per-model, per-skill, per-tool breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub session_id: String,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub per_model_tokens: HashMap<String, u64>,
    pub per_skill_tokens: HashMap<String, u64>,
    pub per_tool: Vec<ToolCost>,
}

/// Budget evaluation for the tool-policy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub session_id: String,
    pub total_cost_usd: f64,
    pub session_cap_usd: Option<f64>,
    pub blocked: bool,
    pub alerts: Vec<String>,
}

/// Serializable snapshot for session recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshot(SessionCosts);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CostTracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CostTracker {
    config: CostConfig,
    events: Arc<EventStore>,
    sessions: Mutex<HashMap<String, SessionCosts>>,
}

impl CostTracker {
    pub fn new(config: CostConfig, events: Arc<EventStore>) -> Self {
        Self {
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one assistant usage report against a turn (and optional skill).
    pub fn record_usage(&self, session_id: &str, usage: &TurnUsage, context: &UsageContext) {
        let tokens = usage.total_tokens();
        let mut sessions = self.sessions.lock();
        let costs = sessions.entry(session_id.to_string()).or_default();

        costs.total_tokens += tokens;
        costs.total_cost_usd += usage.cost_usd;
        if let Some(model) = &usage.model {
            *costs.per_model_tokens.entry(model.clone()).or_default() += tokens;
        }
        if let Some(skill) = &context.skill {
            *costs.per_skill_tokens.entry(skill.clone()).or_default() += tokens;
            *costs.per_skill_cost_usd.entry(skill.clone()).or_default() += usage.cost_usd;
        }
        costs.turns.entry(context.turn).or_default().total_tokens += tokens;

        self.check_budgets(session_id, costs, context.skill.as_deref());
    }

    /// Record one tool call within a turn.
    pub fn record_tool_call(&self, session_id: &str, tool_name: &str, turn: u64) {
        let mut sessions = self.sessions.lock();
        let costs = sessions.entry(session_id.to_string()).or_default();
        *costs
            .turns
            .entry(turn)
            .or_default()
            .tool_calls
            .entry(tool_name.to_string())
            .or_default() += 1;
    }

    /// Full summary with proportional per-tool allocation.
    ///
    /// For a turn with total tokens T and tool-call counts `n_1..n_m`
    /// summing to K, tool i is allocated `T * n_i / K` tokens (integer
    /// division, remainder assigned to the largest caller so totals
    /// reconcile).
    pub fn summary(&self, session_id: &str) -> CostSummary {
        let sessions = self.sessions.lock();
        let costs = sessions.get(session_id).cloned().unwrap_or_default();

        let mut per_tool: HashMap<String, ToolCost> = HashMap::new();
        for turn in costs.turns.values() {
            let total_calls: u64 = turn.tool_calls.values().sum();
            if total_calls == 0 {
                continue;
            }
            let mut allocated = 0u64;
            let mut largest: Option<(&String, u64)> = None;
            for (tool, calls) in &turn.tool_calls {
                let share = turn.total_tokens * calls / total_calls;
                allocated += share;
                let entry = per_tool.entry(tool.clone()).or_insert_with(|| ToolCost {
                    tool: tool.clone(),
                    calls: 0,
                    allocated_tokens: 0,
                });
                entry.calls += calls;
                entry.allocated_tokens += share;
                if largest.is_none_or(|(_, c)| *calls > c) {
                    largest = Some((tool, *calls));
                }
            }
            // Integer-division remainder goes to the heaviest caller.
            let remainder = turn.total_tokens - allocated;
            if remainder > 0 {
                if let Some((tool, _)) = largest {
                    per_tool.get_mut(tool).map(|t| t.allocated_tokens += remainder);
                }
            }
        }

        let mut per_tool: Vec<ToolCost> = per_tool.into_values().collect();
        per_tool.sort_by(|a, b| a.tool.cmp(&b.tool));

        CostSummary {
            session_id: session_id.to_string(),
            total_tokens: costs.total_tokens,
            total_cost_usd: costs.total_cost_usd,
            per_model_tokens: costs.per_model_tokens,
            per_skill_tokens: costs.per_skill_tokens,
            per_tool,
        }
    }

    pub fn budget_status(&self, session_id: &str) -> BudgetStatus {
        let sessions = self.sessions.lock();
        let costs = sessions.get(session_id).cloned().unwrap_or_default();
        BudgetStatus {
            session_id: session_id.to_string(),
            total_cost_usd: costs.total_cost_usd,
            session_cap_usd: self.config.max_cost_usd_per_session,
            blocked: costs.blocked,
            alerts: costs.fired_alerts.iter().cloned().collect(),
        }
    }

    /// Whether the tool-policy layer should deny non-lifecycle tools.
    pub fn is_blocked(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .map(|c| c.blocked)
            .unwrap_or(false)
    }

    pub fn skill_total_tokens(&self, session_id: &str, skill: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|c| c.per_skill_tokens.get(skill).copied())
            .unwrap_or(0)
    }

    /// Serializable snapshot for session recovery.
    pub fn snapshot(&self, session_id: &str) -> Option<CostSnapshot> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .map(CostSnapshot)
    }

    pub fn restore(&self, session_id: &str, snapshot: CostSnapshot) {
        self.sessions
            .lock()
            .insert(session_id.to_string(), snapshot.0);
    }

    /// Drop in-memory state for a session (the event record survives).
    pub fn forget(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    // ── Private ──────────────────────────────────────────────────────

    fn check_budgets(&self, session_id: &str, costs: &mut SessionCosts, skill: Option<&str>) {
        if let Some(cap) = self.config.max_cost_usd_per_session {
            let alert_at = cap * self.config.session_alert_ratio;
            if costs.total_cost_usd >= alert_at {
                self.fire_once(session_id, costs, "session_alert", &json!({
                    "kind": "session_alert",
                    "cost_usd": costs.total_cost_usd,
                    "threshold_usd": alert_at,
                }));
            }
            if costs.total_cost_usd >= cap {
                self.fire_once(session_id, costs, "session_cap", &json!({
                    "kind": "session_cap",
                    "cost_usd": costs.total_cost_usd,
                    "cap_usd": cap,
                }));
                if self.config.action_on_exceed == ActionOnExceed::BlockTools {
                    costs.blocked = true;
                }
            }
        }

        if let (Some(cap), Some(skill)) = (self.config.max_cost_usd_per_skill, skill) {
            let spent = costs.per_skill_cost_usd.get(skill).copied().unwrap_or(0.0);
            if spent >= cap {
                let key = format!("skill_cap:{skill}");
                self.fire_once(session_id, costs, &key, &json!({
                    "kind": "skill_cap",
                    "skill": skill,
                    "cost_usd": spent,
                    "cap_usd": cap,
                }));
                if self.config.action_on_exceed == ActionOnExceed::BlockTools {
                    costs.blocked = true;
                }
            }
        }
    }

    fn fire_once(
        &self,
        session_id: &str,
        costs: &mut SessionCosts,
        key: &str,
        payload: &serde_json::Value,
    ) {
        if !costs.fired_alerts.insert(key.to_string()) {
            return;
        }
        tracing::warn!(session_id = %session_id, alert = %key, "cost budget alert");
        if let Err(e) = self
            .events
            .append(session_id, "cost_budget_alert", None, Some(payload.clone()))
        {
            tracing::warn!(error = %e, "failed to persist cost alert event");
        }
    }
}
