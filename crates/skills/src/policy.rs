//! The tool policy.
//!
//! Gates tool calls against the active skill's contract under three
//! enforcement knobs (`allowed_tools_mode`, `skill_max_tokens_mode`,
//! `skill_max_parallel_mode`), each `off | warn | enforce`. Warn mode
//! emits a single warning event per `(session, skill, offence)`;
//! enforce denies and emits `tool_call_blocked` /
//! `parallel_slot_rejected`. A fixed lifecycle allowlist is always
//! permitted.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use ov_cost::CostTracker;
use ov_domain::config::{EnforcementMode, SkillsConfig};
use ov_events::EventStore;

use crate::registry::SkillRegistry;

/// Tools that keep a session operable regardless of skill policy or cost
/// blocks: completion, compaction, ledger inspection, cost inspection,
/// rollback.
pub const LIFECYCLE_TOOLS: &[&str] = &[
    "skill_complete",
    "session_compact",
    "ledger_query",
    "cost_view",
    "session_rollback",
];

pub fn is_lifecycle_tool(tool: &str) -> bool {
    LIFECYCLE_TOOLS.contains(&tool)
}

/// Outcome of [`ToolPolicy::check_tool_access`].
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warning: Option<String>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warning: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            warning: None,
        }
    }
}

/// Outcome of [`ToolPolicy::acquire_parallel_slot`].
#[derive(Debug, Clone)]
pub struct ParallelDecision {
    pub accepted: bool,
    pub reason: Option<String>,
}

pub struct ToolPolicy {
    /// Behind a lock so mode changes apply to the *next* check — the
    /// parallel limit in particular is re-read on every acquisition.
    config: RwLock<SkillsConfig>,
    registry: Arc<SkillRegistry>,
    cost: Arc<CostTracker>,
    events: Arc<EventStore>,
    /// Offences already warned about: `session\u{1}skill\u{1}offence`.
    warned: Mutex<HashSet<String>>,
}

impl ToolPolicy {
    pub fn new(
        config: SkillsConfig,
        registry: Arc<SkillRegistry>,
        cost: Arc<CostTracker>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            registry,
            cost,
            events,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_config(&self, config: SkillsConfig) {
        *self.config.write() = config;
    }

    /// Gate one tool call for a session.
    ///
    /// Order: lifecycle allowlist → cost block → skill deny list → skill
    /// allow list → tool-call budget → token budget.
    pub fn check_tool_access(&self, session_id: &str, tool: &str) -> AccessDecision {
        if is_lifecycle_tool(tool) {
            return AccessDecision::allow();
        }

        if self.cost.is_blocked(session_id) {
            self.emit_blocked(session_id, None, tool, "cost_budget_exceeded");
            return AccessDecision::deny(format!(
                "cost budget exceeded: tool {tool} is blocked (lifecycle tools remain available)"
            ));
        }

        let Some(skill_name) = self.registry.active_skill(session_id) else {
            return AccessDecision::allow();
        };
        let Some(contract) = self.registry.get(&skill_name) else {
            return AccessDecision::allow();
        };
        let config = self.config.read().clone();

        // Deny list and allow list, under allowed_tools_mode.
        if contract.tools.denies(tool) {
            return self.tool_offence(
                config.allowed_tools_mode,
                session_id,
                &skill_name,
                tool,
                "denied_tool",
                format!("tool {tool} is denied by skill {skill_name}"),
            );
        }
        if !contract.tools.required.is_empty() || !contract.tools.optional.is_empty() {
            if !contract.tools.allows(tool) {
                return self.tool_offence(
                    config.allowed_tools_mode,
                    session_id,
                    &skill_name,
                    tool,
                    "not_allowlisted",
                    format!("tool {tool} is outside the allowlist of skill {skill_name}"),
                );
            }
        }

        // Tool-call budget, governed with the token budget knob (both are
        // budget offences, distinct from list membership).
        if let Some(max_calls) = contract.budget.max_tool_calls {
            if self.registry.tool_calls(session_id) >= max_calls {
                return self.budget_offence(
                    config.skill_max_tokens_mode,
                    session_id,
                    &skill_name,
                    tool,
                    "tool_calls",
                    format!(
                        "skill {skill_name} reached its tool-call budget ({max_calls})"
                    ),
                );
            }
        }
        if let Some(max_tokens) = contract.budget.max_tokens {
            let spent = self.cost.skill_total_tokens(session_id, &skill_name);
            if spent >= max_tokens {
                return self.budget_offence(
                    config.skill_max_tokens_mode,
                    session_id,
                    &skill_name,
                    tool,
                    "tokens",
                    format!(
                        "skill {skill_name} reached its token budget ({spent}/{max_tokens})"
                    ),
                );
            }
        }

        AccessDecision::allow()
    }

    /// Acquire a parallel run slot for the active skill.
    ///
    /// The per-skill mode is re-read from the config on every call rather
    /// than cached at activation.
    pub fn acquire_parallel_slot(&self, session_id: &str, run_id: &str) -> ParallelDecision {
        let Some(skill_name) = self.registry.active_skill(session_id) else {
            return ParallelDecision {
                accepted: true,
                reason: None,
            };
        };
        let Some(contract) = self.registry.get(&skill_name) else {
            return ParallelDecision {
                accepted: true,
                reason: None,
            };
        };
        let mode = self.config.read().skill_max_parallel_mode;

        let limit = contract.max_parallel.unwrap_or(u32::MAX) as usize;
        let held = self.registry.held_slots(session_id, &skill_name);

        if mode == EnforcementMode::Off || held < limit {
            self.registry.hold_slot(session_id, &skill_name, run_id);
            return ParallelDecision {
                accepted: true,
                reason: None,
            };
        }

        match mode {
            EnforcementMode::Warn => {
                self.warn_once(
                    session_id,
                    &skill_name,
                    "parallel",
                    &format!("skill {skill_name} exceeded its parallel limit ({limit})"),
                );
                self.registry.hold_slot(session_id, &skill_name, run_id);
                ParallelDecision {
                    accepted: true,
                    reason: None,
                }
            }
            EnforcementMode::Enforce => {
                let payload = json!({
                    "skill": skill_name,
                    "run_id": run_id,
                    "limit": limit,
                    "held": held,
                });
                self.emit(session_id, "parallel_slot_rejected", &payload);
                ParallelDecision {
                    accepted: false,
                    reason: Some(format!(
                        "skill {skill_name} already holds {held}/{limit} parallel slots"
                    )),
                }
            }
            EnforcementMode::Off => unreachable!("handled above"),
        }
    }

    pub fn release_parallel_slot(&self, session_id: &str, run_id: &str) {
        if let Some(skill) = self.registry.active_skill(session_id) {
            self.registry.release_slot(session_id, &skill, run_id);
        }
    }

    /// Session shutdown: clear warn-once state.
    pub fn forget_session(&self, session_id: &str) {
        let prefix = format!("{session_id}\u{1}");
        self.warned.lock().retain(|key| !key.starts_with(&prefix));
    }

    // ── Private ──────────────────────────────────────────────────────

    fn tool_offence(
        &self,
        mode: EnforcementMode,
        session_id: &str,
        skill: &str,
        tool: &str,
        offence: &str,
        message: String,
    ) -> AccessDecision {
        match mode {
            EnforcementMode::Off => AccessDecision::allow(),
            EnforcementMode::Warn => {
                let warned = self.warn_once(
                    session_id,
                    skill,
                    &format!("{offence}:{tool}"),
                    &message,
                );
                AccessDecision {
                    allowed: true,
                    reason: None,
                    warning: warned.then_some(message),
                }
            }
            EnforcementMode::Enforce => {
                self.emit_blocked(session_id, Some(skill), tool, offence);
                AccessDecision::deny(message)
            }
        }
    }

    fn budget_offence(
        &self,
        mode: EnforcementMode,
        session_id: &str,
        skill: &str,
        tool: &str,
        budget_kind: &str,
        message: String,
    ) -> AccessDecision {
        match mode {
            EnforcementMode::Off => AccessDecision::allow(),
            EnforcementMode::Warn => {
                let warned =
                    self.warn_once(session_id, skill, &format!("budget:{budget_kind}"), &message);
                AccessDecision {
                    allowed: true,
                    reason: None,
                    warning: warned.then_some(message),
                }
            }
            EnforcementMode::Enforce => {
                self.emit_blocked(session_id, Some(skill), tool, &format!("budget:{budget_kind}"));
                AccessDecision::deny(message)
            }
        }
    }

    /// Returns true when this is the first warning for the offence key.
    fn warn_once(&self, session_id: &str, skill: &str, offence: &str, message: &str) -> bool {
        let key = format!("{session_id}\u{1}{skill}\u{1}{offence}");
        if !self.warned.lock().insert(key) {
            return false;
        }
        let kind = if offence == "parallel" {
            "parallel_slot_warning"
        } else if offence.starts_with("budget:") {
            "skill_budget_warning"
        } else {
            "tool_allowlist_warning"
        };
        self.emit(
            session_id,
            kind,
            &json!({ "skill": skill, "offence": offence, "message": message }),
        );
        true
    }

    fn emit_blocked(&self, session_id: &str, skill: Option<&str>, tool: &str, offence: &str) {
        self.emit(
            session_id,
            "tool_call_blocked",
            &json!({ "skill": skill, "tool": tool, "offence": offence }),
        );
    }

    fn emit(&self, session_id: &str, kind: &str, payload: &serde_json::Value) {
        if let Err(e) = self
            .events
            .append(session_id, kind, None, Some(payload.clone()))
        {
            tracing::warn!(error = %e, kind, "failed to persist policy event");
        }
    }
}
