//! Evidence row shapes and chain hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tool name of the synthetic row a compaction leaves behind.
pub const CHECKPOINT_TOOL: &str = "ledger_checkpoint";

/// Outcome classification of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Inconclusive => "inconclusive",
        }
    }
}

/// What callers hand to [`crate::EvidenceLedger::append`]; id, hashes, and
/// timestamp are assigned by the ledger.
#[derive(Debug, Clone)]
pub struct EvidenceEntry {
    pub session_id: String,
    pub turn: u64,
    pub skill: Option<String>,
    pub tool: String,
    pub args_summary: String,
    pub output_summary: String,
    pub verdict: Verdict,
    pub metadata: Option<serde_json::Value>,
}

/// A persisted, chained row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRow {
    pub id: String,
    pub session_id: String,
    pub turn: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    pub tool: String,
    pub args_summary: String,
    pub output_summary: String,
    /// Hash of the (redacted) output summary alone.
    pub output_hash: String,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl EvidenceRow {
    /// Canonical byte string of everything except `hash`, in a fixed field
    /// order. The chain hash is `sha256(previous_hash ∥ canonical)`; any
    /// serialization drift would break replay determinism, so this is
    /// assembled by hand rather than through serde.
    pub fn canonical(&self) -> String {
        let metadata = self
            .metadata
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.session_id,
            self.turn,
            self.skill.as_deref().unwrap_or(""),
            self.tool,
            self.args_summary,
            self.output_summary,
            self.output_hash,
            self.verdict.as_str(),
            self.timestamp.to_rfc3339(),
            metadata,
        )
    }

    /// Recompute this row's chain hash from `previous_hash` + canonical form.
    pub fn compute_hash(&self) -> String {
        chain_hash(&self.previous_hash, &self.canonical())
    }
}

pub fn chain_hash(previous_hash: &str, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_is_stable_across_metadata_absence() {
        let mut row = EvidenceRow {
            id: "r1".into(),
            session_id: "s1".into(),
            turn: 1,
            skill: None,
            tool: "exec".into(),
            args_summary: "ls".into(),
            output_summary: "ok".into(),
            output_hash: content_hash("ok"),
            verdict: Verdict::Pass,
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            previous_hash: String::new(),
            hash: String::new(),

            metadata: None,
        };
        let a = row.canonical();
        row.hash = "ignored".into();
        assert_eq!(a, row.canonical(), "hash field must not affect canonical form");
    }

    #[test]
    fn chain_hash_changes_with_previous() {
        let c = "x|y";
        assert_ne!(chain_hash("", c), chain_hash("aa", c));
    }
}
