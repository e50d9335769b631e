//! Hybrid retrieval scoring and the cognitive reranker port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use ov_domain::config::RetrievalWeights;

use crate::unit::{tokenize, MemoryUnit};

/// A candidate handed to the reranker: id + the text it may judge.
#[derive(Debug, Clone, Serialize)]
pub struct RankCandidate {
    pub unit_id: String,
    pub topic: String,
    pub statement: String,
}

/// Result of a synchronous rank attempt.
pub enum RankOutcome {
    /// Unit ids in the ranker's preferred order.
    Ready(Vec<String>),
    /// Only an asynchronous result is available.
    Pending,
}

/// The cognitive relevance ranker port. Implementations may be purely
/// synchronous (return `Ready` from `try_rank`) or asynchronous (return
/// `Pending` and implement `rank`).
#[async_trait]
pub trait CognitiveRanker: Send + Sync {
    fn try_rank(&self, query: &str, candidates: &[RankCandidate]) -> RankOutcome;

    async fn rank(&self, query: &str, candidates: &[RankCandidate]) -> Vec<String> {
        match self.try_rank(query, candidates) {
            RankOutcome::Ready(order) => order,
            RankOutcome::Pending => Vec::new(),
        }
    }
}

/// Normalize the weights to sum to 1 (after any caller override). A
/// degenerate all-zero triple falls back to lexical-only.
pub fn normalize_weights(weights: &RetrievalWeights) -> RetrievalWeights {
    let sum = weights.lexical + weights.recency + weights.confidence;
    if sum <= 0.0 || !sum.is_finite() {
        return RetrievalWeights {
            lexical: 1.0,
            recency: 0.0,
            confidence: 0.0,
        };
    }
    RetrievalWeights {
        lexical: weights.lexical / sum,
        recency: weights.recency / sum,
        confidence: weights.confidence / sum,
    }
}

/// Token-overlap score of a query against a unit's topic + statement.
pub fn lexical_score(query: &str, unit: &MemoryUnit) -> f64 {
    let query_tokens: std::collections::HashSet<String> = tokenize(query).into_iter().collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let unit_tokens: std::collections::HashSet<String> =
        tokenize(&format!("{} {}", unit.topic, unit.statement))
            .into_iter()
            .collect();
    let hits = query_tokens.intersection(&unit_tokens).count() as f64;
    hits / query_tokens.len() as f64
}

/// Exponential decay over days since the unit was last seen.
pub fn recency_score(unit: &MemoryUnit, now: DateTime<Utc>) -> f64 {
    let days = now
        .signed_duration_since(unit.last_seen_at)
        .num_seconds()
        .max(0) as f64
        / 86_400.0;
    (-days / 7.0).exp()
}

/// `score = w_lex·lex + w_recency·recency + w_confidence·confidence`.
pub fn hybrid_score(
    query: &str,
    unit: &MemoryUnit,
    weights: &RetrievalWeights,
    now: DateTime<Utc>,
) -> f64 {
    weights.lexical * lexical_score(query, unit)
        + weights.recency * recency_score(unit, now)
        + weights.confidence * unit.confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{fingerprint, UnitKind, UnitStatus};

    fn unit(topic: &str, statement: &str, confidence: f64, age_days: i64) -> MemoryUnit {
        let seen = Utc::now() - chrono::Duration::days(age_days);
        MemoryUnit {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s1".into(),
            kind: UnitKind::Fact,
            status: UnitStatus::Active,
            topic: topic.into(),
            statement: statement.into(),
            fingerprint: fingerprint(UnitKind::Fact, topic, statement),
            confidence,
            source_refs: vec![],
            metadata: None,
            updated_at: seen,
            last_seen_at: seen,
        }
    }

    #[test]
    fn weights_normalize_to_unit_sum() {
        let w = normalize_weights(&RetrievalWeights {
            lexical: 2.0,
            recency: 1.0,
            confidence: 1.0,
        });
        assert!((w.lexical + w.recency + w.confidence - 1.0).abs() < 1e-9);
        assert!((w.lexical - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_fall_back_to_lexical() {
        let w = normalize_weights(&RetrievalWeights {
            lexical: 0.0,
            recency: 0.0,
            confidence: 0.0,
        });
        assert_eq!(w.lexical, 1.0);
    }

    #[test]
    fn lexical_match_beats_mismatch() {
        let weights = normalize_weights(&RetrievalWeights::default());
        let now = Utc::now();
        let relevant = unit("build", "the build uses cargo", 0.5, 0);
        let irrelevant = unit("pets", "the cat sat down", 0.5, 0);
        let query = "how does the build work";
        assert!(
            hybrid_score(query, &relevant, &weights, now)
                > hybrid_score(query, &irrelevant, &weights, now)
        );
    }

    #[test]
    fn recency_decays() {
        let fresh = unit("t", "s", 0.5, 0);
        let stale = unit("t", "s", 0.5, 30);
        let now = Utc::now();
        assert!(recency_score(&fresh, now) > recency_score(&stale, now));
    }
}
