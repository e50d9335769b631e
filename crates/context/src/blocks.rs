//! The standard semantic block sources.
//!
//! The pipeline owns only ordering and budgeting; block *content* comes
//! from collaborators wired in by the runtime (identity card, truth
//! ledger, task ledger, memory engine). Those arrive as provider
//! closures so this crate stays below the memory engine in the
//! dependency order. The one exception is `[RecentToolFailures]`, which
//! reads the evidence ledger directly.

use std::sync::Arc;

use ov_ledger::{EvidenceLedger, LedgerFilter, Verdict};

use crate::pipeline::{BlockPriority, BlockSource};

/// Content callback: `(session_id, prompt) -> block body`.
pub type BlockProvider = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

struct ProviderBlock {
    id: &'static str,
    title: &'static str,
    priority: BlockPriority,
    once_per_session: bool,
    provider: BlockProvider,
}

impl BlockSource for ProviderBlock {
    fn id(&self) -> &str {
        self.id
    }
    fn title(&self) -> &str {
        self.title
    }
    fn priority(&self) -> BlockPriority {
        self.priority
    }
    fn render(&self, session_id: &str, prompt: &str) -> Option<String> {
        (self.provider)(session_id, prompt)
    }
    fn once_per_session(&self) -> bool {
        self.once_per_session
    }
}

/// Build a provider-backed block source.
pub fn provider_block(
    id: &'static str,
    title: &'static str,
    priority: BlockPriority,
    once_per_session: bool,
    provider: BlockProvider,
) -> Box<dyn BlockSource> {
    Box::new(ProviderBlock {
        id,
        title,
        priority,
        once_per_session,
        provider,
    })
}

/// `[Identity]`: the agent identity card, injected once per session.
pub fn identity_block(provider: BlockProvider) -> Box<dyn BlockSource> {
    provider_block("identity", "[Identity]", BlockPriority::Critical, true, provider)
}

/// `[TruthFacts]`: current unresolved facts.
pub fn truth_facts_block(provider: BlockProvider) -> Box<dyn BlockSource> {
    provider_block(
        "truth_facts",
        "[TruthFacts]",
        BlockPriority::Critical,
        false,
        provider,
    )
}

/// `[TaskLedger]`: goal, constraints, blockers, status.
pub fn task_ledger_block(provider: BlockProvider) -> Box<dyn BlockSource> {
    provider_block(
        "task_ledger",
        "[TaskLedger]",
        BlockPriority::High,
        false,
        provider,
    )
}

/// `[WorkingMemory]`: the memory engine's working snapshot.
pub fn working_memory_block(provider: BlockProvider) -> Box<dyn BlockSource> {
    provider_block(
        "working_memory",
        "[WorkingMemory]",
        BlockPriority::High,
        false,
        provider,
    )
}

/// `[MemoryRecall]`: query-driven retrieval hits for this prompt.
pub fn memory_recall_block(provider: BlockProvider) -> Box<dyn BlockSource> {
    provider_block(
        "memory_recall",
        "[MemoryRecall]",
        BlockPriority::Normal,
        false,
        provider,
    )
}

/// `[RecentToolFailures]`: the last N failed tool results from the
/// evidence ledger.
pub struct RecentToolFailuresBlock {
    ledger: Arc<EvidenceLedger>,
    last: usize,
}

impl RecentToolFailuresBlock {
    pub fn new(ledger: Arc<EvidenceLedger>, last: usize) -> Box<dyn BlockSource> {
        Box::new(Self { ledger, last })
    }
}

impl BlockSource for RecentToolFailuresBlock {
    fn id(&self) -> &str {
        "recent_tool_failures"
    }
    fn title(&self) -> &str {
        "[RecentToolFailures]"
    }
    fn priority(&self) -> BlockPriority {
        BlockPriority::High
    }
    fn render(&self, session_id: &str, _prompt: &str) -> Option<String> {
        let failures = self.ledger.query(
            session_id,
            &LedgerFilter {
                verdict: Some(Verdict::Fail),
                last: Some(self.last),
                ..Default::default()
            },
        );
        if failures.is_empty() {
            return None;
        }
        let lines: Vec<String> = failures
            .iter()
            .map(|row| format!("- turn {}: {}: {}", row.turn, row.tool, row.output_summary))
            .collect();
        Some(lines.join("\n"))
    }
}
