//! Event record shapes and category inference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema tag carried by the structured projection.
pub const EVENT_SCHEMA: &str = "overseer.event.v1";

/// A single persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    /// Process-wide monotonic sequence, assigned at append.
    pub seq: u64,
    pub session_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Coarse category inferred from the kind prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Session,
    Turn,
    Tool,
    Context,
    Cost,
    Verification,
    State,
    Other,
}

impl EventCategory {
    /// Rule-based inference on the kind string prefix.
    pub fn infer(kind: &str) -> EventCategory {
        for (prefix, category) in [
            ("session", EventCategory::Session),
            ("turn", EventCategory::Turn),
            ("tool", EventCategory::Tool),
            ("context", EventCategory::Context),
            ("cost", EventCategory::Cost),
            ("verification", EventCategory::Verification),
            ("state", EventCategory::State),
        ] {
            if kind == prefix || kind.starts_with(&format!("{prefix}_")) || kind.starts_with(&format!("{prefix}.")) {
                return category;
            }
        }
        EventCategory::Other
    }
}

/// Structured projection of an [`EventRecord`] for clients.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredEvent {
    pub schema: &'static str,
    pub id: String,
    pub seq: u64,
    pub session_id: String,
    pub kind: String,
    pub category: EventCategory,
    pub iso_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl From<&EventRecord> for StructuredEvent {
    fn from(record: &EventRecord) -> Self {
        Self {
            schema: EVENT_SCHEMA,
            id: record.id.clone(),
            seq: record.seq,
            session_id: record.session_id.clone(),
            kind: record.kind.clone(),
            category: EventCategory::infer(&record.kind),
            iso_time: record.timestamp.to_rfc3339(),
            turn: record.turn,
            payload: record.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_inference_by_prefix() {
        assert_eq!(EventCategory::infer("session_started"), EventCategory::Session);
        assert_eq!(EventCategory::infer("turn_started"), EventCategory::Turn);
        assert_eq!(EventCategory::infer("tool_call_blocked"), EventCategory::Tool);
        assert_eq!(
            EventCategory::infer("context_compaction_gate_cleared"),
            EventCategory::Context
        );
        assert_eq!(EventCategory::infer("cost_budget_alert"), EventCategory::Cost);
        assert_eq!(
            EventCategory::infer("verification_outcome_recorded"),
            EventCategory::Verification
        );
        assert_eq!(EventCategory::infer("state_snapshot_written"), EventCategory::State);
        assert_eq!(EventCategory::infer("truth_fact_recorded"), EventCategory::Other);
    }

    #[test]
    fn prefix_requires_separator() {
        // "tooling_x" is not a tool event.
        assert_eq!(EventCategory::infer("tooling_x"), EventCategory::Other);
        assert_eq!(EventCategory::infer("session.turn.start"), EventCategory::Session);
    }
}
