//! Per-session skill activation state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use ov_domain::error::Result;
use ov_events::EventStore;

use crate::catalog;
use crate::contract::{output_satisfied, SkillContract};

/// Outcome of [`SkillRegistry::activate`].
#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub ok: bool,
    pub reason: Option<String>,
}

/// Outcome of [`SkillRegistry::complete`].
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub ok: bool,
    pub missing: Vec<String>,
}

#[derive(Default)]
struct SessionSkills {
    active: Option<String>,
    /// Tool calls made by the active skill.
    tool_calls: u64,
    /// Recorded outputs, per completed (or completing) skill.
    outputs: HashMap<String, HashMap<String, serde_json::Value>>,
    /// Held parallel run slots per skill.
    parallel_slots: HashMap<String, HashSet<String>>,
}

/// The skill registry: immutable contract catalog + mutable per-session
/// activation state.
pub struct SkillRegistry {
    contracts: HashMap<String, SkillContract>,
    events: Arc<EventStore>,
    sessions: Mutex<HashMap<String, SessionSkills>>,
}

impl SkillRegistry {
    pub fn load(catalog_dir: &Path, events: Arc<EventStore>) -> Result<Self> {
        Ok(Self {
            contracts: catalog::scan_contracts(catalog_dir)?,
            events,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Build from an in-memory catalog (tests, embedded defaults).
    pub fn from_contracts(contracts: Vec<SkillContract>, events: Arc<EventStore>) -> Self {
        Self {
            contracts: contracts.into_iter().map(|c| (c.name.clone(), c)).collect(),
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn list(&self) -> Vec<&SkillContract> {
        let mut all: Vec<&SkillContract> = self.contracts.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Option<&SkillContract> {
        self.contracts.get(name)
    }

    /// Activate a skill on a session.
    ///
    /// Activating while another skill is active requires an explicit
    /// `composable_with` relationship in either direction; otherwise the
    /// activation fails naming the blocking skill.
    pub fn activate(&self, session_id: &str, name: &str) -> ActivationResult {
        let Some(contract) = self.contracts.get(name) else {
            return ActivationResult {
                ok: false,
                reason: Some(format!("unknown skill: {name}")),
            };
        };

        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session_id.to_string()).or_default();

        if let Some(active) = &state.active {
            if active != name {
                let active_contract = self.contracts.get(active);
                let composable = active_contract
                    .map(|a| a.composable_with(contract))
                    .unwrap_or(false);
                if !composable {
                    return ActivationResult {
                        ok: false,
                        reason: Some(format!(
                            "skill {name} is not composable with active skill {active}"
                        )),
                    };
                }
            }
        }

        state.active = Some(name.to_string());
        state.tool_calls = 0;
        drop(sessions);

        self.emit(session_id, "skill_activated", &json!({ "skill": name }));
        ActivationResult {
            ok: true,
            reason: None,
        }
    }

    /// Complete the active skill. Succeeds only when every declared output
    /// name carries a non-empty value.
    pub fn complete(
        &self,
        session_id: &str,
        outputs: HashMap<String, serde_json::Value>,
    ) -> CompletionResult {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        let Some(active) = state.active.clone() else {
            return CompletionResult {
                ok: false,
                missing: vec!["no_active_skill".into()],
            };
        };
        let Some(contract) = self.contracts.get(&active) else {
            return CompletionResult {
                ok: false,
                missing: vec![format!("missing_contract:{active}")],
            };
        };

        let missing: Vec<String> = contract
            .outputs
            .iter()
            .filter(|name| !outputs.get(*name).is_some_and(output_satisfied))
            .map(|name| format!("missing_output:{name}"))
            .collect();
        if !missing.is_empty() {
            return CompletionResult { ok: false, missing };
        }

        state.outputs.insert(active.clone(), outputs.clone());
        state.active = None;
        state.tool_calls = 0;
        drop(sessions);

        self.emit(
            session_id,
            "skill_completed",
            &json!({ "skill": active, "outputs": outputs }),
        );
        CompletionResult {
            ok: true,
            missing: Vec::new(),
        }
    }

    pub fn active_skill(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.active.clone())
    }

    pub fn get_outputs(
        &self,
        session_id: &str,
        name: &str,
    ) -> Option<HashMap<String, serde_json::Value>> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.outputs.get(name).cloned())
    }

    /// Outputs of every skill the target's contract `consumes`.
    pub fn get_consumed_outputs(
        &self,
        session_id: &str,
        target_name: &str,
    ) -> HashMap<String, HashMap<String, serde_json::Value>> {
        let Some(contract) = self.contracts.get(target_name) else {
            return HashMap::new();
        };
        let sessions = self.sessions.lock();
        let Some(state) = sessions.get(session_id) else {
            return HashMap::new();
        };
        contract
            .consumes
            .iter()
            .filter_map(|source| {
                state
                    .outputs
                    .get(source)
                    .map(|o| (source.clone(), o.clone()))
            })
            .collect()
    }

    /// Count one tool call against the active skill's budget.
    pub fn record_tool_call(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(state) = sessions.get_mut(session_id) {
            if state.active.is_some() {
                state.tool_calls += 1;
            }
        }
    }

    pub fn tool_calls(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.tool_calls)
            .unwrap_or(0)
    }

    // ── Parallel slots ───────────────────────────────────────────────

    pub fn held_slots(&self, session_id: &str, skill: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.parallel_slots.get(skill))
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    pub fn hold_slot(&self, session_id: &str, skill: &str, run_id: &str) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .parallel_slots
            .entry(skill.to_string())
            .or_default()
            .insert(run_id.to_string());
    }

    pub fn release_slot(&self, session_id: &str, skill: &str, run_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(state) = sessions.get_mut(session_id) {
            if let Some(slots) = state.parallel_slots.get_mut(skill) {
                slots.remove(run_id);
            }
        }
    }

    /// Session shutdown: drop activation state, keep nothing.
    pub fn forget_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    fn emit(&self, session_id: &str, kind: &str, payload: &serde_json::Value) {
        if let Err(e) = self
            .events
            .append(session_id, kind, None, Some(payload.clone()))
        {
            tracing::warn!(error = %e, kind, "failed to persist skill event");
        }
    }
}
