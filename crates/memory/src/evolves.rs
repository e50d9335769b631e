//! Evolves edges and deterministic relation inference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::unit::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Confirms,
    Enriches,
    Replaces,
    Challenges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Proposed,
    Accepted,
    Rejected,
}

/// Directed edge between two memory units. Stored as IDs; resolved
/// through the store on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolvesEdge {
    pub id: String,
    pub session_id: String,
    pub source_unit_id: String,
    pub target_unit_id: String,
    pub relation: Relation,
    pub status: EdgeStatus,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Jaccard overlap of the two statements' token sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta: std::collections::HashSet<String> = tokenize(a).into_iter().collect();
    let tb: std::collections::HashSet<String> = tokenize(b).into_iter().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Infer the relation of a new statement toward an existing one.
///
/// Lexical cues win over overlap: `replaces` / `instead of` mark a
/// replacement, `however` / a leading contrast marks a challenge. High
/// overlap confirms, moderate overlap enriches, low overlap is unrelated.
pub fn infer_relation(new_statement: &str, existing_statement: &str) -> Option<(Relation, f64)> {
    let lower = new_statement.to_lowercase();
    let overlap = jaccard(new_statement, existing_statement);

    if lower.contains("instead of") || lower.contains("replaces") {
        return Some((Relation::Replaces, 0.8));
    }
    if lower.contains("however") || lower.starts_with("but ") || lower.contains("contrary to") {
        return Some((Relation::Challenges, 0.7));
    }
    if overlap >= 0.8 {
        return Some((Relation::Confirms, overlap));
    }
    if overlap >= 0.4 {
        return Some((Relation::Enriches, overlap));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_statements_confirm() {
        let (relation, confidence) =
            infer_relation("the build uses cargo", "The build uses Cargo!").unwrap();
        assert_eq!(relation, Relation::Confirms);
        assert!(confidence > 0.99);
    }

    #[test]
    fn partial_overlap_enriches() {
        let (relation, _) = infer_relation(
            "the build uses cargo with the release profile",
            "the build uses cargo",
        )
        .unwrap();
        assert_eq!(relation, Relation::Enriches);
    }

    #[test]
    fn replace_cue_wins_over_overlap() {
        let (relation, _) =
            infer_relation("uses just instead of make", "the build uses make").unwrap();
        assert_eq!(relation, Relation::Replaces);
    }

    #[test]
    fn challenge_cue() {
        let (relation, _) = infer_relation(
            "however the tests fail on linux",
            "tests pass on all platforms",
        )
        .unwrap();
        assert_eq!(relation, Relation::Challenges);
    }

    #[test]
    fn unrelated_statements_yield_nothing() {
        assert!(infer_relation("deploy to staging", "the cat sat on the mat").is_none());
    }
}
