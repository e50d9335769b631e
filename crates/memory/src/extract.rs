//! Deterministic unit extraction from session events.
//!
//! Each known event kind maps to zero or more unit candidates and zero or
//! more resolve directives. Unknown kinds extract nothing.

use ov_events::EventRecord;

use crate::unit::{normalize, UnitKind};

/// A unit-to-be before merging/upsert.
#[derive(Debug, Clone)]
pub struct UnitCandidate {
    pub kind: UnitKind,
    pub topic: String,
    pub statement: String,
    pub confidence: f64,
    pub source_ref: String,
}

/// Marks existing active units as resolved.
#[derive(Debug, Clone)]
pub struct ResolveDirective {
    pub topic: String,
    /// Match topics by prefix instead of exact normalized equality.
    pub prefix: bool,
    /// When set, only units whose normalized statement matches.
    pub statement: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub candidates: Vec<UnitCandidate>,
    pub resolves: Vec<ResolveDirective>,
}

/// Apply the extraction rules to one event.
pub fn extract(event: &EventRecord) -> Extraction {
    let mut out = Extraction::default();
    let payload = event.payload.clone().unwrap_or(serde_json::Value::Null);
    let text = |key: &str| -> Option<String> {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
    };
    let confidence = payload
        .get("confidence")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0));

    match event.kind.as_str() {
        "truth_fact_recorded" => {
            if let (Some(topic), Some(statement)) = (text("topic"), text("statement")) {
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Fact,
                    topic,
                    statement,
                    confidence: confidence.unwrap_or(0.7),
                    source_ref: event.id.clone(),
                });
            }
        }
        "truth_assumption_recorded" => {
            if let (Some(topic), Some(statement)) = (text("topic"), text("statement")) {
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Hypothesis,
                    topic,
                    statement,
                    confidence: confidence.unwrap_or(0.5),
                    source_ref: event.id.clone(),
                });
            }
        }
        "truth_fact_resolved" => {
            if let Some(topic) = text("topic") {
                out.resolves.push(ResolveDirective {
                    topic,
                    prefix: false,
                    statement: None,
                });
            }
        }
        "task_goal_set" => {
            if let Some(goal) = text("goal") {
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Decision,
                    topic: "goal".into(),
                    statement: goal,
                    confidence: confidence.unwrap_or(0.8),
                    source_ref: event.id.clone(),
                });
            }
        }
        "task_constraint_added" => {
            if let Some(constraint) = text("constraint") {
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Constraint,
                    topic: "constraints".into(),
                    statement: constraint,
                    confidence: confidence.unwrap_or(0.8),
                    source_ref: event.id.clone(),
                });
            }
        }
        "task_blocker_added" => {
            if let Some(blocker) = text("blocker") {
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Risk,
                    topic: "blockers".into(),
                    statement: blocker,
                    confidence: confidence.unwrap_or(0.7),
                    source_ref: event.id.clone(),
                });
            }
        }
        "task_blocker_cleared" => {
            if let Some(blocker) = text("blocker") {
                out.resolves.push(ResolveDirective {
                    topic: "blockers".into(),
                    prefix: false,
                    statement: Some(blocker),
                });
            }
        }
        "skill_completed" => {
            if let Some(skill) = text("skill") {
                let outputs = payload
                    .get("outputs")
                    .and_then(|o| o.as_object())
                    .map(|o| {
                        let mut keys: Vec<&str> = o.keys().map(String::as_str).collect();
                        keys.sort_unstable();
                        keys.join(", ")
                    })
                    .unwrap_or_default();
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Learning,
                    topic: format!("skill:{skill}"),
                    statement: if outputs.is_empty() {
                        format!("skill {skill} completed")
                    } else {
                        format!("skill {skill} completed with outputs: {outputs}")
                    },
                    confidence: confidence.unwrap_or(0.6),
                    source_ref: event.id.clone(),
                });
            }
        }
        "verification_state_reset" => {
            out.resolves.push(ResolveDirective {
                topic: "verification".into(),
                prefix: true,
                statement: None,
            });
        }
        "verification_outcome_recorded" => {
            if let Some(check) = text("check") {
                let passed = payload
                    .get("passed")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                out.candidates.push(UnitCandidate {
                    kind: UnitKind::Fact,
                    topic: format!("verification:{check}"),
                    statement: format!(
                        "check {check} {}",
                        if passed { "passed" } else { "failed" }
                    ),
                    confidence: if passed { 0.9 } else { 0.8 },
                    source_ref: event.id.clone(),
                });
            }
        }
        "cognitive_outcome_reflection" => {
            if let Some(insight) = text("insight") {
                let kind = match text("kind").as_deref() {
                    Some("pattern") => UnitKind::Pattern,
                    _ => UnitKind::Learning,
                };
                out.candidates.push(UnitCandidate {
                    kind,
                    topic: text("topic").unwrap_or_else(|| "reflection".into()),
                    statement: insight,
                    confidence: confidence.unwrap_or(0.6),
                    source_ref: event.id.clone(),
                });
            }
        }
        _ => {}
    }

    out
}

/// Merge candidates that collapse to the same `(kind, topic, statement)`
/// identity: keep the max confidence and the union of source refs.
pub fn merge_candidates(candidates: Vec<UnitCandidate>) -> Vec<MergedCandidate> {
    let mut merged: Vec<MergedCandidate> = Vec::new();
    for candidate in candidates {
        let key = (
            candidate.kind,
            normalize(&candidate.topic),
            normalize(&candidate.statement),
        );
        if let Some(existing) = merged.iter_mut().find(|m| m.key == key) {
            existing.confidence = existing.confidence.max(candidate.confidence);
            if !existing.source_refs.contains(&candidate.source_ref) {
                existing.source_refs.push(candidate.source_ref);
            }
        } else {
            merged.push(MergedCandidate {
                key,
                kind: candidate.kind,
                topic: candidate.topic,
                statement: candidate.statement,
                confidence: candidate.confidence,
                source_refs: vec![candidate.source_ref],
            });
        }
    }
    merged
}

#[derive(Debug, Clone)]
pub struct MergedCandidate {
    key: (UnitKind, String, String),
    pub kind: UnitKind,
    pub topic: String,
    pub statement: String,
    pub confidence: f64,
    pub source_refs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: &str, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 1,
            session_id: "s1".into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            turn: Some(1),
            payload: Some(payload),
        }
    }

    #[test]
    fn truth_fact_extracts_a_fact() {
        let e = event(
            "truth_fact_recorded",
            json!({"topic": "build", "statement": "uses cargo", "confidence": 0.9}),
        );
        let extraction = extract(&e);
        assert_eq!(extraction.candidates.len(), 1);
        let c = &extraction.candidates[0];
        assert_eq!(c.kind, UnitKind::Fact);
        assert_eq!(c.confidence, 0.9);
    }

    #[test]
    fn unknown_kind_extracts_nothing() {
        let e = event("turn_started", json!({}));
        let extraction = extract(&e);
        assert!(extraction.candidates.is_empty());
        assert!(extraction.resolves.is_empty());
    }

    #[test]
    fn blocker_cleared_resolves_by_statement() {
        let e = event("task_blocker_cleared", json!({"blocker": "missing token"}));
        let extraction = extract(&e);
        assert_eq!(extraction.resolves.len(), 1);
        assert_eq!(
            extraction.resolves[0].statement.as_deref(),
            Some("missing token")
        );
    }

    #[test]
    fn verification_reset_resolves_by_prefix() {
        let e = event("verification_state_reset", json!({}));
        let extraction = extract(&e);
        assert!(extraction.resolves[0].prefix);
        assert_eq!(extraction.resolves[0].topic, "verification");
    }

    #[test]
    fn reflection_kind_selects_pattern() {
        let e = event(
            "cognitive_outcome_reflection",
            json!({"insight": "retry after network errors", "kind": "pattern"}),
        );
        let extraction = extract(&e);
        assert_eq!(extraction.candidates[0].kind, UnitKind::Pattern);
    }

    #[test]
    fn merge_keeps_max_confidence_and_unions_refs() {
        let a = UnitCandidate {
            kind: UnitKind::Fact,
            topic: "Build".into(),
            statement: "Uses cargo".into(),
            confidence: 0.6,
            source_ref: "e1".into(),
        };
        let b = UnitCandidate {
            kind: UnitKind::Fact,
            topic: "build".into(),
            statement: "uses cargo!".into(),
            confidence: 0.9,
            source_ref: "e2".into(),
        };
        let merged = merge_candidates(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].confidence, 0.9);
        assert_eq!(merged[0].source_refs, vec!["e1".to_string(), "e2".to_string()]);
    }
}
