//! The semantic memory tier: unit extraction from session events, a
//! published working snapshot, topic crystals with cross-session
//! promotion and decay, hybrid retrieval with an optional cognitive
//! reranker, and evolves-edge inference.

pub mod engine;
pub mod evolves;
pub mod extract;
pub mod insight;
pub mod retrieval;
pub mod store;
pub mod unit;

pub use engine::{MemoryEngine, RebuildMode, RecallItem, SearchHit, SearchRequest};
pub use evolves::{EvolvesEdge, EdgeStatus, Relation};
pub use insight::{Insight, InsightStatus};
pub use retrieval::{CognitiveRanker, RankCandidate, RankOutcome};
pub use store::MemoryStore;
pub use unit::{MemoryUnit, UnitKind, UnitStatus};
