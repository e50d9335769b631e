//! The turn-scoped injection planner.
//!
//! Composes the ordered semantic blocks into one candidate text, trims it
//! to the injection budget by priority, dedupes per scope by fingerprint,
//! and reserves tokens. Supplemental injections speculate against the
//! scope remainder and only count once committed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use ov_domain::config::{PipelineConfig, TruncationStrategy};
use ov_domain::usage::ContextUsage;
use ov_events::EventStore;

use crate::budget::{truncate_chars, ContextBudgetManager};
use crate::gate::CompactionGate;
use crate::scope::{fingerprint, ScopeKey, ScopeLedger};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Block sources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockPriority {
    /// Never dropped; unsatisfiable floors arm the gate instead.
    Critical,
    High,
    Normal,
}

/// A semantic block provider. Implementations render the block body (no
/// title header) or `None` when there is nothing to say this turn.
pub trait BlockSource: Send + Sync {
    fn id(&self) -> &str;
    /// Header label, e.g. `[Identity]`.
    fn title(&self) -> &str;
    fn priority(&self) -> BlockPriority;
    fn render(&self, session_id: &str, prompt: &str) -> Option<String>;
    fn once_per_session(&self) -> bool {
        false
    }
}

/// Per-block outcome in an [`InjectionDecision`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReport {
    pub source_id: String,
    pub title: String,
    pub tokens: u64,
    pub included: bool,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_reason: Option<String>,
}

/// Outcome of [`ContextPipeline::build_injection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionDecision {
    pub accepted: bool,
    pub text: String,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub blocks: Vec<BlockReport>,
}

/// A speculative supplemental injection; tokens reserve on commit only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplementalPlan {
    pub plan_id: String,
    pub accepted: bool,
    pub final_text: String,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct PendingSupplemental {
    scope: ScopeKey,
    tokens: u64,
}

struct RegisteredSource {
    source: Box<dyn BlockSource>,
    cap_tokens: u64,
    floor_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContextPipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ContextPipeline {
    config: PipelineConfig,
    budget: Arc<ContextBudgetManager>,
    gate: Arc<CompactionGate>,
    events: Arc<EventStore>,
    scopes: ScopeLedger,
    sources: Vec<RegisteredSource>,
    emitted_once: Mutex<HashSet<(String, String)>>,
    pending: Mutex<HashMap<String, PendingSupplemental>>,
}

impl ContextPipeline {
    pub fn new(
        config: PipelineConfig,
        budget: Arc<ContextBudgetManager>,
        gate: Arc<CompactionGate>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            config,
            budget,
            gate,
            events,
            scopes: ScopeLedger::new(),
            sources: Vec::new(),
            emitted_once: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a block source. Registration order is the stable block
    /// order of the final injection.
    pub fn register(&mut self, source: Box<dyn BlockSource>) {
        let max = self.budget.config().max_injection_tokens;
        let id = source.id().to_string();
        let fraction = self
            .config
            .cap_fractions
            .get(&id)
            .copied()
            .unwrap_or(self.config.default_cap_fraction);
        let floor = self
            .config
            .floors
            .get(&id)
            .copied()
            .unwrap_or(self.config.default_floor);
        let ceiling = self.config.default_ceiling.max(floor.max(1));
        let cap = ((max as f64 * fraction) as u64).clamp(floor.max(1), ceiling);
        self.sources.push(RegisteredSource {
            source,
            cap_tokens: cap,
            floor_tokens: floor,
        });
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|r| r.source.id().to_string()).collect()
    }

    /// Compose the injection for the next turn of `session_id`.
    pub fn build_injection(
        &self,
        session_id: &str,
        prompt: &str,
        usage: Option<ContextUsage>,
        scope_id: Option<&str>,
    ) -> InjectionDecision {
        if let Some(usage) = usage {
            self.budget.observe_usage(session_id, usage);
        }
        let max_tokens = self.budget.config().max_injection_tokens;
        let chars_per_token = self.budget.config().chars_per_token;

        // 1. Render every source at its per-source cap.
        let mut rendered: Vec<(usize, String, u64, bool)> = Vec::new(); // (source idx, text, tokens, truncated)
        let mut reports: Vec<BlockReport> = Vec::new();
        {
            let emitted = self.emitted_once.lock();
            for (idx, reg) in self.sources.iter().enumerate() {
                let source = &reg.source;
                if source.once_per_session()
                    && emitted.contains(&(session_id.to_string(), source.id().to_string()))
                {
                    continue;
                }
                let Some(body) = source.render(session_id, prompt) else {
                    continue;
                };
                if body.trim().is_empty() {
                    continue;
                }
                // Per-source caps always keep the tail; the drop-entry
                // strategy applies to whole injections, not block bodies.
                let cap_chars = (reg.cap_tokens * chars_per_token) as usize;
                let capped = truncate_chars(&body, cap_chars, TruncationStrategy::Tail);
                let truncated = capped.len() != body.len();
                let text = format!("{}\n{}", source.title(), capped);
                let tokens = self.budget.estimate_tokens(&text);
                reports.push(BlockReport {
                    source_id: source.id().to_string(),
                    title: source.title().to_string(),
                    tokens,
                    included: true,
                    truncated,
                    dropped_reason: None,
                });
                rendered.push((idx, text, tokens, truncated));
            }
        }

        if rendered.is_empty() {
            return InjectionDecision {
                accepted: false,
                text: String::new(),
                tokens: 0,
                fingerprint: None,
                reason: Some("empty".into()),
                blocks: reports,
            };
        }

        // 2. Mandatory floors: if the critical blocks alone cannot fit at
        //    their floors, surface floor_unmet through the gate.
        let critical_floor: u64 = rendered
            .iter()
            .filter(|(idx, ..)| self.sources[*idx].source.priority() == BlockPriority::Critical)
            .map(|(idx, _, tokens, _)| self.sources[*idx].floor_tokens.min(*tokens))
            .sum();
        if critical_floor > max_tokens {
            self.gate.note_floor_unmet(session_id);
        }

        // 3. Trim to the injection budget by priority, lowest first,
        //    dropping later registrations before earlier ones. The last
        //    surviving block is never dropped — residual overflow is
        //    truncated by the budget sizing below.
        let mut total: u64 = rendered.iter().map(|(_, _, t, _)| *t).sum();
        for priority in [BlockPriority::Normal, BlockPriority::High] {
            if total <= max_tokens {
                break;
            }
            for pos in (0..rendered.len()).rev() {
                if total <= max_tokens || rendered.len() == 1 {
                    break;
                }
                let idx = rendered[pos].0;
                if self.sources[idx].source.priority() != priority {
                    continue;
                }
                total -= rendered[pos].2;
                let id = self.sources[idx].source.id();
                if let Some(report) = reports.iter_mut().find(|r| r.source_id == id) {
                    report.included = false;
                    report.dropped_reason = Some("over_budget".into());
                }
                rendered.remove(pos);
            }
        }

        let candidate = rendered
            .iter()
            .map(|(_, text, _, _)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // 4. Final sizing + hard-limit gate.
        let plan = self
            .budget
            .plan_injection(session_id, &candidate, usage.as_ref());
        if !plan.accepted {
            let reason = plan.dropped_reason.clone();
            self.emit_planned(session_id, false, 0, reason.as_deref());
            return InjectionDecision {
                accepted: false,
                text: String::new(),
                tokens: 0,
                fingerprint: None,
                reason,
                blocks: reports,
            };
        }

        // 5. Scope dedupe.
        let scope = ScopeKey::new(session_id, scope_id);
        let fp = fingerprint(&plan.final_text);
        if self.scopes.is_duplicate(&scope, &fp) {
            self.emit_planned(session_id, false, 0, Some("duplicate_content"));
            return InjectionDecision {
                accepted: false,
                text: String::new(),
                tokens: 0,
                fingerprint: Some(fp),
                reason: Some("duplicate_content".into()),
                blocks: reports,
            };
        }

        // 6. Accept: reserve tokens, record fingerprint, retire
        //    once-per-session sources.
        self.scopes.record_acceptance(&scope, &fp, plan.final_tokens);
        {
            let mut emitted = self.emitted_once.lock();
            for (idx, ..) in &rendered {
                let source = &self.sources[*idx].source;
                if source.once_per_session() {
                    emitted.insert((session_id.to_string(), source.id().to_string()));
                }
            }
        }
        self.emit_planned(session_id, true, plan.final_tokens, None);

        InjectionDecision {
            accepted: true,
            text: plan.final_text,
            tokens: plan.final_tokens,
            fingerprint: Some(fp),
            reason: None,
            blocks: reports,
        }
    }

    /// Plan an out-of-band injection against the scope's remaining budget.
    /// Nothing is reserved until [`ContextPipeline::commit_supplemental`].
    pub fn plan_supplemental(
        &self,
        session_id: &str,
        scope_id: Option<&str>,
        text: &str,
    ) -> SupplementalPlan {
        if !self.budget.enabled() {
            return SupplementalPlan {
                plan_id: uuid::Uuid::new_v4().to_string(),
                accepted: true,
                final_text: text.to_string(),
                tokens: 0,
                reason: None,
            };
        }

        let scope = ScopeKey::new(session_id, scope_id);
        let max = self.budget.config().max_injection_tokens;
        let remaining = self.scopes.remaining(&scope, max);
        if remaining == 0 {
            return SupplementalPlan {
                plan_id: uuid::Uuid::new_v4().to_string(),
                accepted: false,
                final_text: String::new(),
                tokens: 0,
                reason: Some("budget_exhausted".into()),
            };
        }

        let max_chars = (remaining * self.budget.config().chars_per_token) as usize;
        let final_text = truncate_chars(text, max_chars, TruncationStrategy::Tail);
        let tokens = self.budget.estimate_tokens(&final_text).min(remaining);
        let plan_id = uuid::Uuid::new_v4().to_string();
        self.pending.lock().insert(
            plan_id.clone(),
            PendingSupplemental {
                scope,
                tokens,
            },
        );
        SupplementalPlan {
            plan_id,
            accepted: true,
            final_text,
            tokens,
            reason: None,
        }
    }

    /// Commit a previously planned supplemental injection, counting its
    /// tokens against the scope. Unknown or already-committed plans return
    /// false.
    pub fn commit_supplemental(&self, plan_id: &str) -> bool {
        if !self.budget.enabled() {
            return true;
        }
        let Some(pending) = self.pending.lock().remove(plan_id) else {
            return false;
        };
        self.scopes.reserve(&pending.scope, pending.tokens);
        true
    }

    /// Post-compaction reset: cadence bookkeeping, every scope fingerprint
    /// and reservation, and the gate.
    pub fn on_compacted(&self, session_id: &str) {
        self.budget.mark_compacted(session_id);
        self.scopes.clear_session(session_id);
        self.gate.clear(session_id);
    }

    /// Session shutdown: clear fingerprints and once-markers, keep stores.
    pub fn forget_session(&self, session_id: &str) {
        self.scopes.clear_session(session_id);
        self.emitted_once
            .lock()
            .retain(|(sid, _)| sid != session_id);
        self.gate.forget(session_id);
        self.budget.forget_session(session_id);
    }

    pub fn reserved_tokens(&self, session_id: &str, scope_id: Option<&str>) -> u64 {
        self.scopes.reserved(&ScopeKey::new(session_id, scope_id))
    }

    fn emit_planned(&self, session_id: &str, accepted: bool, tokens: u64, reason: Option<&str>) {
        let turn = self.budget.current_turn(session_id);
        let payload = json!({
            "accepted": accepted,
            "tokens": tokens,
            "reason": reason,
        });
        if let Err(e) = self.events.append(
            session_id,
            "context_injection_planned",
            Some(turn),
            Some(payload),
        ) {
            tracing::warn!(error = %e, "failed to persist injection event");
        }
    }
}
