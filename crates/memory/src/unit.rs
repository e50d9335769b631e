//! Memory units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Fact,
    Decision,
    Preference,
    Constraint,
    Risk,
    Hypothesis,
    Learning,
    Pattern,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Fact => "fact",
            UnitKind::Decision => "decision",
            UnitKind::Preference => "preference",
            UnitKind::Constraint => "constraint",
            UnitKind::Risk => "risk",
            UnitKind::Hypothesis => "hypothesis",
            UnitKind::Learning => "learning",
            UnitKind::Pattern => "pattern",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Active,
    Resolved,
    Superseded,
}

/// One semantic memory unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub id: String,
    pub session_id: String,
    pub kind: UnitKind,
    pub status: UnitStatus,
    pub topic: String,
    pub statement: String,
    /// Deterministic over `(kind, normalized(topic), normalized(statement))`.
    /// At most one `active` unit per `(session_id, fingerprint)`.
    pub fingerprint: String,
    pub confidence: f64,
    pub source_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Lowercase, strip punctuation to spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Deterministic unit fingerprint.
pub fn fingerprint(kind: UnitKind, topic: &str, statement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(topic).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(statement).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Whitespace tokens of a normalized statement (for overlap scoring).
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_noise() {
        assert_eq!(normalize("  The Build,   FAILED! "), "the build failed");
        assert_eq!(normalize("a-b_c"), "a b c");
    }

    #[test]
    fn fingerprint_is_stable_under_formatting() {
        let a = fingerprint(UnitKind::Fact, "Build", "The build FAILED.");
        let b = fingerprint(UnitKind::Fact, "build", "the build failed");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_kind() {
        let a = fingerprint(UnitKind::Fact, "t", "s");
        let b = fingerprint(UnitKind::Risk, "t", "s");
        assert_ne!(a, b);
    }
}
