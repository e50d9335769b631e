//! The session runtime façade.
//!
//! Owns per-session metadata (turn index, resume hint, latest compaction
//! summary) and coordinates the component crates: every tool call flows
//! through the compaction gate, the cost block, and the skill policy;
//! every tool outcome lands in the evidence ledger and the event stream;
//! memory extraction runs off the event stream subscription.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use ov_context::blocks::{
    identity_block, memory_recall_block, task_ledger_block, truth_facts_block,
    working_memory_block, RecentToolFailuresBlock,
};
use ov_context::{
    CompactionGate, ContextBudgetManager, ContextPipeline, InjectionDecision, SupplementalPlan,
};
use ov_cost::{CostTracker, UsageContext};
use ov_domain::config::Config;
use ov_domain::error::Result;
use ov_domain::usage::{ContextUsage, TurnUsage};
use ov_events::EventStore;
use ov_ledger::{CompactOptions, EvidenceEntry, EvidenceLedger, Verdict};
use ov_memory::{MemoryEngine, MemoryStore, UnitKind, UnitStatus};
use ov_skills::{AccessDecision, SkillRegistry, ToolPolicy};
use ov_verify::{FileChangeTracker, RollbackOutcome, VerificationGate};

use crate::snapshot::{RecoverySnapshot, SessionSnapshotStore};

/// Everything the runtime needs to record one finished tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: String,
    pub args_summary: String,
    pub output_summary: String,
    pub verdict: Verdict,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Default, Clone)]
struct SessionMeta {
    resume_hint: Option<String>,
    compaction_summary: Option<String>,
    last_checkpoint_turn: Option<u64>,
}

pub struct SessionRuntime {
    config: Arc<Config>,
    events: Arc<EventStore>,
    ledger: Arc<EvidenceLedger>,
    budget: Arc<ContextBudgetManager>,
    gate: Arc<CompactionGate>,
    pipeline: Arc<ContextPipeline>,
    skills: Arc<SkillRegistry>,
    policy: Arc<ToolPolicy>,
    cost: Arc<CostTracker>,
    memory: Arc<MemoryEngine>,
    verification: Arc<VerificationGate>,
    tracker: Arc<FileChangeTracker>,
    snapshots: SessionSnapshotStore,
    sessions: Mutex<HashMap<String, SessionMeta>>,
}

impl SessionRuntime {
    /// Wire the full component stack from a config document. The memory
    /// engine is subscribed to the event stream, and the six semantic
    /// blocks are registered in their canonical order.
    pub fn bootstrap(config: Arc<Config>) -> Result<Arc<Self>> {
        let paths = &config.paths;
        let events = Arc::new(EventStore::open(&paths.events_dir())?);
        let ledger = Arc::new(EvidenceLedger::open(&paths.ledger_path())?);
        let budget = Arc::new(ContextBudgetManager::new(config.context_budget.clone()));
        let gate = Arc::new(CompactionGate::new(budget.clone(), events.clone()));
        let cost = Arc::new(CostTracker::new(config.cost.clone(), events.clone()));
        let skills = Arc::new(SkillRegistry::load(&paths.skills_dir(), events.clone())?);
        let policy = Arc::new(ToolPolicy::new(
            config.skills.clone(),
            skills.clone(),
            cost.clone(),
            events.clone(),
        ));
        let memory_store = Arc::new(MemoryStore::open(&paths.memory_dir())?);
        let memory = Arc::new(MemoryEngine::new(
            config.memory.clone(),
            memory_store,
            events.clone(),
            None,
        ));
        let verification = Arc::new(VerificationGate::new(
            config.verification.clone(),
            events.clone(),
        ));
        let tracker = Arc::new(FileChangeTracker::new(
            &paths.resolve(&paths.workspace_root),
            &paths.snapshots_dir(),
        )?);
        let snapshots =
            SessionSnapshotStore::new(&paths.resolve(&paths.orchestrator_dir).join("recovery"))?;

        let mut pipeline = ContextPipeline::new(
            config.pipeline.clone(),
            budget.clone(),
            gate.clone(),
            events.clone(),
        );
        register_standard_blocks(
            &mut pipeline,
            &config,
            ledger.clone(),
            memory.clone(),
        );
        let pipeline = Arc::new(pipeline);

        let runtime = Arc::new(Self {
            config,
            events: events.clone(),
            ledger,
            budget,
            gate,
            pipeline,
            skills,
            policy,
            cost,
            memory: memory.clone(),
            verification,
            tracker,
            snapshots,
            sessions: Mutex::new(HashMap::new()),
        });

        // Memory extraction runs off the live stream.
        let engine = memory;
        events.subscribe(move |record| {
            if let Err(e) = engine.ingest_event(record) {
                tracing::warn!(error = %e, kind = %record.kind, "memory ingestion failed");
            }
        });

        Ok(runtime)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }
    pub fn ledger(&self) -> &Arc<EvidenceLedger> {
        &self.ledger
    }
    pub fn memory(&self) -> &Arc<MemoryEngine> {
        &self.memory
    }
    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }
    pub fn policy(&self) -> &Arc<ToolPolicy> {
        &self.policy
    }
    pub fn cost(&self) -> &Arc<CostTracker> {
        &self.cost
    }
    pub fn verification(&self) -> &Arc<VerificationGate> {
        &self.verification
    }
    pub fn budget(&self) -> &Arc<ContextBudgetManager> {
        &self.budget
    }

    // ── Turn lifecycle ───────────────────────────────────────────────

    pub fn start_session(&self, session_id: &str) -> Result<()> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default();
        self.events
            .append(session_id, "session_started", None, None)?;
        Ok(())
    }

    pub fn on_turn_start(&self, session_id: &str, turn: u64) -> Result<()> {
        self.budget.begin_turn(session_id, turn);
        self.events
            .append(session_id, "turn_started", Some(turn), None)?;
        Ok(())
    }

    pub fn current_turn(&self, session_id: &str) -> u64 {
        self.budget.current_turn(session_id)
    }

    /// Record one assistant usage report against the current turn.
    pub fn record_assistant_usage(&self, session_id: &str, usage: &TurnUsage) {
        let context = UsageContext {
            turn: self.current_turn(session_id),
            skill: self.skills.active_skill(session_id),
        };
        self.cost.record_usage(session_id, usage, &context);
    }

    pub fn observe_context_usage(&self, session_id: &str, usage: ContextUsage) {
        self.budget.observe_usage(session_id, usage);
    }

    // ── Tool gating & recording ──────────────────────────────────────

    /// Gate a tool call: compaction gate first, then cost/skill policy.
    pub fn check_tool_access(&self, session_id: &str, tool: &str) -> AccessDecision {
        let gate = self.gate.check_tool(session_id, tool);
        if !gate.allowed {
            return AccessDecision {
                allowed: false,
                reason: gate.reason,
                warning: None,
            };
        }
        self.policy.check_tool_access(session_id, tool)
    }

    /// Record a finished tool call: event stream, evidence ledger, skill
    /// and cost counters, and the ledger checkpoint cadence.
    pub fn record_tool_result(&self, session_id: &str, outcome: &ToolOutcome) -> Result<()> {
        let turn = self.current_turn(session_id);
        let skill = self.skills.active_skill(session_id);

        self.events.append(
            session_id,
            "tool_call_recorded",
            Some(turn),
            Some(json!({
                "tool": outcome.tool,
                "verdict": outcome.verdict.as_str(),
                "skill": skill,
            })),
        )?;
        self.ledger.append(EvidenceEntry {
            session_id: session_id.to_string(),
            turn,
            skill,
            tool: outcome.tool.clone(),
            args_summary: outcome.args_summary.clone(),
            output_summary: outcome.output_summary.clone(),
            verdict: outcome.verdict,
            metadata: outcome.metadata.clone(),
        })?;
        self.skills.record_tool_call(session_id);
        self.cost.record_tool_call(session_id, &outcome.tool, turn);

        self.maybe_checkpoint(session_id, turn)?;
        Ok(())
    }

    /// Checkpoint the evidence chain once per cadence turn.
    fn maybe_checkpoint(&self, session_id: &str, turn: u64) -> Result<()> {
        let every = self.config.ledger.checkpoint_every_turns;
        if every == 0 || turn == 0 || turn % every != 0 {
            return Ok(());
        }
        {
            let mut sessions = self.sessions.lock();
            let meta = sessions.entry(session_id.to_string()).or_default();
            if meta.last_checkpoint_turn == Some(turn) {
                return Ok(());
            }
            meta.last_checkpoint_turn = Some(turn);
        }
        self.ledger.compact_session(
            session_id,
            &CompactOptions {
                keep_last: self.config.ledger.digest_window,
                reason: format!("turn_cadence:{turn}"),
            },
        )?;
        Ok(())
    }

    // ── Mutation tracking & rollback ─────────────────────────────────

    /// Bracket a mutation tool: snapshot its paths and mark the session
    /// dirty for the verification memo.
    pub fn begin_mutation(
        &self,
        session_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        paths: &[String],
    ) -> Result<()> {
        self.tracker
            .track_start(session_id, tool_call_id, tool_name, paths)?;
        self.verification.note_write(session_id);
        Ok(())
    }

    pub fn end_mutation(&self, tool_call_id: &str, success: bool) -> Result<()> {
        self.tracker.track_end(tool_call_id, success)?;
        Ok(())
    }

    /// Restore the most recent patch set; success resets verification
    /// state for the session.
    pub fn rollback_last(&self, session_id: &str) -> RollbackOutcome {
        let outcome = self.tracker.rollback_last(session_id);
        if outcome.ok {
            self.verification.reset_state(session_id);
            let _ = self.events.append(
                session_id,
                "state_rollback_applied",
                Some(self.current_turn(session_id)),
                Some(json!({ "restored_paths": outcome.restored_paths })),
            );
        }
        outcome
    }

    // ── Context & compaction ─────────────────────────────────────────

    pub fn build_injection(
        &self,
        session_id: &str,
        prompt: &str,
        usage: Option<ContextUsage>,
        scope_id: Option<&str>,
    ) -> InjectionDecision {
        self.pipeline
            .build_injection(session_id, prompt, usage, scope_id)
    }

    pub fn plan_supplemental(
        &self,
        session_id: &str,
        scope_id: Option<&str>,
        text: &str,
    ) -> SupplementalPlan {
        self.pipeline.plan_supplemental(session_id, scope_id, text)
    }

    pub fn commit_supplemental(&self, plan_id: &str) -> bool {
        self.pipeline.commit_supplemental(plan_id)
    }

    pub fn should_request_compaction(
        &self,
        session_id: &str,
        usage: &ContextUsage,
    ) -> ov_context::CompactionAdvice {
        self.budget.should_request_compaction(session_id, usage)
    }

    /// Record a completed compaction: cadence bookkeeping, scope and gate
    /// reset, summary retention, and the `context_compaction_completed`
    /// event.
    pub fn mark_compacted(
        &self,
        session_id: &str,
        from_tokens: Option<u64>,
        to_tokens: Option<u64>,
        summary: Option<String>,
    ) -> Result<()> {
        self.pipeline.on_compacted(session_id);
        if let Some(summary) = &summary {
            self.sessions
                .lock()
                .entry(session_id.to_string())
                .or_default()
                .compaction_summary = Some(summary.clone());
        }
        self.events.append(
            session_id,
            "context_compaction_completed",
            Some(self.current_turn(session_id)),
            Some(json!({ "from_tokens": from_tokens, "to_tokens": to_tokens })),
        )?;
        Ok(())
    }

    pub fn set_resume_hint(&self, session_id: &str, hint: Option<String>) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .resume_hint = hint;
    }

    // ── Recovery snapshots ───────────────────────────────────────────

    pub fn snapshot_session(&self, session_id: &str) -> Result<RecoverySnapshot> {
        let meta = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        let snapshot = RecoverySnapshot {
            session_id: session_id.to_string(),
            turn: self.current_turn(session_id),
            resume_hint: meta.resume_hint,
            compaction_summary: meta.compaction_summary,
            budget: self.budget.snapshot_session(session_id),
            cost: self.cost.snapshot(session_id),
            saved_at: chrono::Utc::now(),
        };
        self.snapshots.save(&snapshot)?;
        Ok(snapshot)
    }

    pub fn restore_session(&self, session_id: &str) -> Result<Option<RecoverySnapshot>> {
        let Some(snapshot) = self.snapshots.load(session_id)? else {
            return Ok(None);
        };
        self.budget.begin_turn(session_id, snapshot.turn);
        if let Some(budget) = &snapshot.budget {
            self.budget.restore_session(session_id, budget.clone());
        }
        if let Some(cost) = &snapshot.cost {
            self.cost.restore(session_id, cost.clone());
        }
        {
            let mut sessions = self.sessions.lock();
            let meta = sessions.entry(session_id.to_string()).or_default();
            meta.resume_hint = snapshot.resume_hint.clone();
            meta.compaction_summary = snapshot.compaction_summary.clone();
        }
        Ok(Some(snapshot))
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Clear the session's volatile state (tool counters, gate warnings,
    /// injection fingerprints). Event, evidence, and memory stores stay
    /// on disk.
    pub fn shutdown_session(&self, session_id: &str) -> Result<()> {
        self.events
            .append(session_id, "session_shutdown", None, None)?;
        self.skills.forget_session(session_id);
        self.policy.forget_session(session_id);
        self.pipeline.forget_session(session_id);
        self.cost.forget(session_id);
        self.verification.forget_session(session_id);
        self.memory.forget_session(session_id);
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

/// Register the six canonical blocks, in their stable order.
fn register_standard_blocks(
    pipeline: &mut ContextPipeline,
    config: &Config,
    ledger: Arc<EvidenceLedger>,
    memory: Arc<MemoryEngine>,
) {
    let workspace = config.paths.resolve(&config.paths.workspace_root);

    // [Identity]: the identity card file, when the workspace carries one.
    let identity_path = workspace.join("IDENTITY.md");
    pipeline.register(identity_block(Arc::new(move |_, _| {
        std::fs::read_to_string(&identity_path).ok()
    })));

    // [TruthFacts]: unresolved facts and constraints from the memory tier.
    let truth_memory = memory.clone();
    pipeline.register(truth_facts_block(Arc::new(move |session_id, _| {
        let units: Vec<String> = truth_memory
            .store()
            .active_session_units(session_id)
            .into_iter()
            .filter(|u| {
                u.status == UnitStatus::Active
                    && matches!(u.kind, UnitKind::Fact | UnitKind::Hypothesis)
            })
            .map(|u| format!("- ({}) {}", u.topic, u.statement))
            .collect();
        if units.is_empty() {
            None
        } else {
            Some(units.join("\n"))
        }
    })));

    // [TaskLedger]: goal, constraints, blockers.
    let task_memory = memory.clone();
    pipeline.register(task_ledger_block(Arc::new(move |session_id, _| {
        let units: Vec<String> = task_memory
            .store()
            .active_session_units(session_id)
            .into_iter()
            .filter(|u| {
                matches!(
                    u.kind,
                    UnitKind::Decision | UnitKind::Constraint | UnitKind::Risk
                )
            })
            .map(|u| format!("- [{}] {}", u.kind.as_str(), u.statement))
            .collect();
        if units.is_empty() {
            None
        } else {
            Some(units.join("\n"))
        }
    })));

    // [RecentToolFailures]: straight from the evidence ledger.
    pipeline.register(RecentToolFailuresBlock::new(
        ledger,
        config.pipeline.recent_failures,
    ));

    // [WorkingMemory]: the published snapshot.
    let wm_memory = memory.clone();
    pipeline.register(working_memory_block(Arc::new(move |session_id, _| {
        let snapshot = wm_memory.get_working_memory(session_id);
        // A bare session header with no units is noise.
        if snapshot.lines().count() <= 1 {
            None
        } else {
            Some(snapshot)
        }
    })));

    // [MemoryRecall]: query-driven retrieval for this prompt.
    pipeline.register(memory_recall_block(Arc::new(move |session_id, prompt| {
        memory.build_recall_block(session_id, prompt, 5)
    })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use ov_domain::config::ActionOnExceed;
    use ov_events::EventQuery;

    fn runtime_with(mutate: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Arc<SessionRuntime>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.workspace_root = dir.path().to_path_buf();
        mutate(&mut config);
        let runtime = SessionRuntime::bootstrap(Arc::new(config)).unwrap();
        (dir, runtime)
    }

    fn outcome(tool: &str, verdict: Verdict) -> ToolOutcome {
        ToolOutcome {
            tool: tool.into(),
            args_summary: format!("{tool} args"),
            output_summary: format!("{tool} output"),
            verdict,
            metadata: None,
        }
    }

    #[test]
    fn compaction_gate_blocks_then_clears_end_to_end() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 3).unwrap();
        rt.observe_context_usage("s1", ContextUsage::new(Some(95), 100));

        let denied = rt.check_tool_access("s1", "exec");
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("session_compact"));

        assert!(rt.check_tool_access("s1", "session_compact").allowed);

        rt.mark_compacted("s1", Some(95), Some(40), None).unwrap();
        assert!(rt.check_tool_access("s1", "exec").allowed);
    }

    #[test]
    fn evidence_chain_survives_turn_cadence_checkpoint() {
        let (_dir, rt) = runtime_with(|config| {
            config.ledger.checkpoint_every_turns = 3;
            config.ledger.digest_window = 2;
        });
        rt.start_session("s1").unwrap();
        for turn in 1..=5 {
            rt.on_turn_start("s1", turn).unwrap();
            rt.record_tool_result("s1", &outcome("exec", Verdict::Pass))
                .unwrap();
        }

        let rows = rt.ledger().list("s1");
        assert!(rows.len() < 6);
        assert!(rows.iter().any(|r| r.tool == ov_ledger::CHECKPOINT_TOOL));
        assert!(rt.ledger().verify_chain("s1").valid);
    }

    #[test]
    fn rows_carry_the_current_turn() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 4).unwrap();
        rt.record_tool_result("s1", &outcome("read", Verdict::Pass))
            .unwrap();
        let rows = rt.ledger().list("s1");
        assert_eq!(rows.last().unwrap().turn, 4);

        let events = rt.events().query(
            "s1",
            &EventQuery {
                kind: Some("tool_call_recorded".into()),
                last: Some(1),
            },
        );
        assert_eq!(events[0].turn, Some(4));
    }

    #[test]
    fn cost_block_denies_tools_but_not_lifecycle() {
        let (_dir, rt) = runtime_with(|config| {
            config.cost.max_cost_usd_per_session = Some(0.01);
            config.cost.action_on_exceed = ActionOnExceed::BlockTools;
        });
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 1).unwrap();
        rt.record_assistant_usage(
            "s1",
            &TurnUsage {
                model: Some("opus".into()),
                input_tokens: 0,
                output_tokens: 10,
                cost_usd: 0.02,
            },
        );

        assert!(!rt.check_tool_access("s1", "read").allowed);
        assert!(rt.check_tool_access("s1", "skill_complete").allowed);
        assert!(rt.check_tool_access("s1", "session_compact").allowed);
    }

    #[test]
    fn injection_includes_truth_and_failures() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 1).unwrap();

        // The event subscription feeds memory extraction.
        rt.events()
            .append(
                "s1",
                "truth_fact_recorded",
                Some(1),
                Some(json!({"topic": "build", "statement": "uses cargo nextest"})),
            )
            .unwrap();
        rt.record_tool_result("s1", &outcome("exec", Verdict::Fail))
            .unwrap();

        let decision = rt.build_injection("s1", "how do I run tests", None, None);
        assert!(decision.accepted);
        assert!(decision.text.contains("[TruthFacts]"));
        assert!(decision.text.contains("uses cargo nextest"));
        assert!(decision.text.contains("[RecentToolFailures]"));
        assert!(decision.text.contains("exec output"));
    }

    #[test]
    fn rollback_resets_verification_state() {
        let (dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 1).unwrap();

        let file = dir.path().join("f.txt");
        std::fs::write(&file, "before").unwrap();
        rt.begin_mutation("s1", "call-1", "write_file", &["f.txt".into()])
            .unwrap();
        std::fs::write(&file, "after").unwrap();
        rt.end_mutation("call-1", true).unwrap();

        let outcome = rt.rollback_last("s1");
        assert!(outcome.ok);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "before");

        let resets = rt.events().query(
            "s1",
            &EventQuery {
                kind: Some("verification_state_reset".into()),
                last: None,
            },
        );
        assert_eq!(resets.len(), 1);
        let rollbacks = rt.events().query(
            "s1",
            &EventQuery {
                kind: Some("state_rollback_applied".into()),
                last: None,
            },
        );
        assert_eq!(rollbacks.len(), 1);
    }

    #[test]
    fn rollback_without_patchset_reports_reason() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        let outcome = rt.rollback_last("s1");
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some("no_patchset"));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 6).unwrap();
        rt.set_resume_hint("s1", Some("mid-refactor".into()));
        rt.record_assistant_usage(
            "s1",
            &TurnUsage {
                model: Some("opus".into()),
                input_tokens: 100,
                output_tokens: 50,
                cost_usd: 0.01,
            },
        );
        rt.snapshot_session("s1").unwrap();

        // Simulate a worker restart.
        rt.shutdown_session("s1").unwrap();
        assert_eq!(rt.current_turn("s1"), 0);

        let restored = rt.restore_session("s1").unwrap().unwrap();
        assert_eq!(restored.turn, 6);
        assert_eq!(rt.current_turn("s1"), 6);
        assert_eq!(restored.resume_hint.as_deref(), Some("mid-refactor"));
        assert_eq!(rt.cost().summary("s1").total_tokens, 150);
    }

    #[test]
    fn shutdown_preserves_stores() {
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();
        rt.on_turn_start("s1", 1).unwrap();
        rt.record_tool_result("s1", &outcome("exec", Verdict::Pass))
            .unwrap();
        rt.shutdown_session("s1").unwrap();

        // Evidence and events survive; volatile state does not.
        assert_eq!(rt.ledger().list("s1").len(), 1);
        assert!(!rt.events().query("s1", &EventQuery::default()).is_empty());
        assert_eq!(rt.current_turn("s1"), 0);
    }

    #[test]
    fn duplicate_injection_across_scopes_and_compaction() {
        // No IDENTITY.md on disk: the once-per-session identity block
        // would make consecutive builds differ by construction.
        let (_dir, rt) = runtime_with(|_| {});
        rt.start_session("s1").unwrap();

        rt.on_turn_start("s1", 1).unwrap();
        rt.events()
            .append(
                "s1",
                "truth_fact_recorded",
                Some(1),
                Some(json!({"topic": "t", "statement": "fixed statement"})),
            )
            .unwrap();

        let first = rt.build_injection("s1", "p", None, Some("leaf-a"));
        assert!(first.accepted);

        rt.on_turn_start("s1", 2).unwrap();
        let second = rt.build_injection("s1", "p", None, Some("leaf-a"));
        assert!(!second.accepted);
        assert_eq!(second.reason.as_deref(), Some("duplicate_content"));

        rt.on_turn_start("s1", 3).unwrap();
        let other_scope = rt.build_injection("s1", "p", None, Some("leaf-b"));
        assert!(other_scope.accepted);

        rt.mark_compacted("s1", None, None, None).unwrap();
        rt.on_turn_start("s1", 4).unwrap();
        let after = rt.build_injection("s1", "p", None, Some("leaf-a"));
        assert!(after.accepted);
    }
}
