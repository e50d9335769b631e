//! Context-window budget management and the turn-scoped injection
//! pipeline, including the compaction gate.

pub mod blocks;
pub mod budget;
pub mod gate;
pub mod pipeline;
pub mod scope;

pub use budget::{BudgetSnapshot, CompactionAdvice, ContextBudgetManager, InjectionPlan};
pub use gate::{CompactionGate, GateDecision, COMPACTION_TOOL};
pub use pipeline::{
    BlockPriority, BlockReport, BlockSource, ContextPipeline, InjectionDecision, SupplementalPlan,
};
pub use scope::ScopeKey;
