//! The compaction gate.
//!
//! When a session's observed pressure is critical and it has not
//! compacted recently, every tool except the compaction tool is denied.
//! The first denial per `(session, tool)` emits exactly one
//! `context_compaction_gate_blocked_tool` event for the gated interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use ov_domain::trace::TraceEvent;
use ov_domain::usage::Pressure;
use ov_events::EventStore;

use crate::budget::ContextBudgetManager;

/// The only tool allowed through an armed gate.
pub const COMPACTION_TOOL: &str = "session_compact";

/// Outcome of a gate check.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }
}

#[derive(Default)]
struct GateState {
    armed: bool,
    /// `critical_pressure` and/or `floor_unmet`.
    reasons: Vec<String>,
    /// Tools already warned about during this gated interval.
    blocked_tools: HashSet<String>,
    floor_unmet: bool,
}

pub struct CompactionGate {
    budget: Arc<ContextBudgetManager>,
    events: Arc<EventStore>,
    state: Mutex<HashMap<String, GateState>>,
}

impl CompactionGate {
    pub fn new(budget: Arc<ContextBudgetManager>, events: Arc<EventStore>) -> Self {
        Self {
            budget,
            events,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record that the pipeline could not satisfy all mandatory block
    /// floors for this session; surfaces as a secondary gate reason.
    pub fn note_floor_unmet(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.entry(session_id.to_string()).or_default().floor_unmet = true;
    }

    /// Check whether `tool` may run on `session_id` right now.
    pub fn check_tool(&self, session_id: &str, tool: &str) -> GateDecision {
        let critical = self.budget.session_pressure(session_id) == Pressure::Critical;
        let recent = self.budget.has_recent_compaction(session_id);

        if !critical || recent {
            return GateDecision::allow();
        }

        let turn = self.budget.current_turn(session_id);
        let mut state = self.state.lock();
        let gate = state.entry(session_id.to_string()).or_default();

        if !gate.armed {
            gate.armed = true;
            gate.reasons = vec!["critical_pressure".to_string()];
            if gate.floor_unmet {
                gate.reasons.push("floor_unmet".to_string());
            }
            let payload = json!({ "reasons": gate.reasons });
            self.emit(session_id, "context_compaction_gate_armed", turn, &payload);
            self.emit(session_id, "context_critical_without_compact", turn, &payload);
            TraceEvent::GateArmed {
                session_id: session_id.to_string(),
                reason: gate.reasons.join(","),
            }
            .emit();
        }

        if tool == COMPACTION_TOOL {
            return GateDecision::allow();
        }

        if gate.blocked_tools.insert(tool.to_string()) {
            self.emit(
                session_id,
                "context_compaction_gate_blocked_tool",
                turn,
                &json!({ "tool": tool, "reasons": gate.reasons }),
            );
        }

        GateDecision {
            allowed: false,
            reason: Some(format!(
                "context pressure critical: only {COMPACTION_TOOL} is allowed until compaction"
            )),
        }
    }

    /// Clear the gate after a compaction.
    pub fn clear(&self, session_id: &str) {
        let turn = self.budget.current_turn(session_id);
        let mut state = self.state.lock();
        if let Some(gate) = state.get_mut(session_id) {
            let was_armed = gate.armed;
            gate.armed = false;
            gate.floor_unmet = false;
            gate.reasons.clear();
            gate.blocked_tools.clear();
            if was_armed {
                self.emit(
                    session_id,
                    "context_compaction_gate_cleared",
                    turn,
                    &json!({}),
                );
                TraceEvent::GateCleared {
                    session_id: session_id.to_string(),
                }
                .emit();
            }
        }
    }

    /// Drop all gate state for a session (shutdown).
    pub fn forget(&self, session_id: &str) {
        self.state.lock().remove(session_id);
    }

    fn emit(&self, session_id: &str, kind: &str, turn: u64, payload: &serde_json::Value) {
        if let Err(e) = self
            .events
            .append(session_id, kind, Some(turn), Some(payload.clone()))
        {
            tracing::warn!(error = %e, kind, "failed to persist gate event");
        }
    }
}
