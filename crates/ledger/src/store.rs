//! The evidence ledger store.
//!
//! One JSONL file holds every session's rows (the per-session chains are
//! independent; `previous_hash` links only within a session). Compaction
//! rewrites the whole file atomically via tmp + rename.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use ov_domain::error::{Error, Result};
use ov_domain::redact::redact_str;
use ov_domain::trace::TraceEvent;

use crate::row::{chain_hash, content_hash, EvidenceEntry, EvidenceRow, Verdict, CHECKPOINT_TOOL};

/// Filter for [`EvidenceLedger::query`].
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub tool: Option<String>,
    pub verdict: Option<Verdict>,
    pub turn: Option<u64>,
    pub last: Option<usize>,
}

/// Options for [`EvidenceLedger::compact_session`].
#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// How many most-recent rows survive.
    pub keep_last: usize,
    pub reason: String,
}

/// Result of [`EvidenceLedger::verify_chain`].
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub valid: bool,
    pub rows: usize,
    /// Id of the first row whose hash fails, when invalid.
    pub broken_at: Option<String>,
}

/// Hash-chained per-session evidence ledger.
pub struct EvidenceLedger {
    path: PathBuf,
    inner: Mutex<HashMap<String, Vec<EvidenceRow>>>,
}

impl EvidenceLedger {
    /// Open (or create) the ledger file, hydrating all session chains.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let mut sessions: HashMap<String, Vec<EvidenceRow>> = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EvidenceRow>(line) {
                    Ok(row) => sessions.entry(row.session_id.clone()).or_default().push(row),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed ledger line");
                    }
                }
            }
        }

        tracing::info!(
            path = %path.display(),
            sessions = sessions.len(),
            "evidence ledger opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(sessions),
        })
    }

    /// Append one entry: redact, hash-link onto the session chain, persist.
    pub fn append(&self, entry: EvidenceEntry) -> Result<EvidenceRow> {
        let mut inner = self.inner.lock();
        let chain = inner.entry(entry.session_id.clone()).or_default();
        let previous_hash = chain.last().map(|r| r.hash.clone()).unwrap_or_default();

        let output_summary = redact_str(&entry.output_summary);
        let mut row = EvidenceRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: entry.session_id,
            turn: entry.turn,
            skill: entry.skill,
            tool: entry.tool,
            args_summary: redact_str(&entry.args_summary),
            output_hash: content_hash(&output_summary),
            output_summary,
            verdict: entry.verdict,
            timestamp: Utc::now(),
            previous_hash,
            hash: String::new(),
            metadata: entry.metadata.map(|m| ov_domain::redact::redact_value(&m)),
        };
        row.hash = row.compute_hash();

        self.append_line(&row)?;
        chain.push(row.clone());
        Ok(row)
    }

    /// All rows for a session, in append order.
    pub fn list(&self, session_id: &str) -> Vec<EvidenceRow> {
        self.inner
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Filtered view; `last` returns the N most recent matches (still in
    /// append order).
    pub fn query(&self, session_id: &str, filter: &LedgerFilter) -> Vec<EvidenceRow> {
        let inner = self.inner.lock();
        let Some(chain) = inner.get(session_id) else {
            return Vec::new();
        };
        let mut matches: Vec<EvidenceRow> = chain
            .iter()
            .filter(|r| filter.tool.as_deref().is_none_or(|t| r.tool == t))
            .filter(|r| filter.verdict.is_none_or(|v| r.verdict == v))
            .filter(|r| filter.turn.is_none_or(|t| r.turn == t))
            .cloned()
            .collect();
        if let Some(n) = filter.last {
            let start = matches.len().saturating_sub(n);
            matches = matches.split_off(start);
        }
        matches
    }

    /// Walk the session chain recomputing every hash.
    pub fn verify_chain(&self, session_id: &str) -> ChainReport {
        let inner = self.inner.lock();
        let Some(chain) = inner.get(session_id) else {
            return ChainReport {
                valid: true,
                rows: 0,
                broken_at: None,
            };
        };

        let mut expected_previous = String::new();
        for row in chain {
            if row.previous_hash != expected_previous || row.compute_hash() != row.hash {
                return ChainReport {
                    valid: false,
                    rows: chain.len(),
                    broken_at: Some(row.id.clone()),
                };
            }
            expected_previous = row.hash.clone();
        }
        ChainReport {
            valid: true,
            rows: chain.len(),
            broken_at: None,
        }
    }

    /// Replace all rows older than the tail window with one checkpoint row.
    ///
    /// The checkpoint's `previous_hash` links into the original chain (the
    /// hash preceding the removed range) and its own hash re-seeds the
    /// surviving tail, which is re-linked row by row. A no-op when the
    /// session has fewer rows than `keep_last + 1`.
    pub fn compact_session(&self, session_id: &str, options: &CompactOptions) -> Result<usize> {
        let mut inner = self.inner.lock();
        let Some(chain) = inner.get_mut(session_id) else {
            return Ok(0);
        };
        if chain.len() <= options.keep_last {
            return Ok(0);
        }

        let split = chain.len() - options.keep_last;
        let removed: Vec<EvidenceRow> = chain.drain(..split).collect();
        let tail: Vec<EvidenceRow> = chain.drain(..).collect();

        let mut pass = 0usize;
        let mut fail = 0usize;
        let mut inconclusive = 0usize;
        for row in &removed {
            match row.verdict {
                Verdict::Pass => pass += 1,
                Verdict::Fail => fail += 1,
                Verdict::Inconclusive => inconclusive += 1,
            }
        }

        let summary = format!(
            "checkpoint: {} rows compacted (pass={pass} fail={fail} inconclusive={inconclusive})",
            removed.len()
        );
        let mut checkpoint = EvidenceRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            turn: removed.last().map(|r| r.turn).unwrap_or(0),
            skill: None,
            tool: CHECKPOINT_TOOL.to_string(),
            args_summary: options.reason.clone(),
            output_hash: content_hash(&summary),
            output_summary: summary,
            verdict: Verdict::Pass,
            timestamp: Utc::now(),
            previous_hash: removed
                .first()
                .map(|r| r.previous_hash.clone())
                .unwrap_or_default(),
            hash: String::new(),
            metadata: Some(json!({
                "compacted_rows": removed.len(),
                "pass": pass,
                "fail": fail,
                "inconclusive": inconclusive,
                "from_turn": removed.first().map(|r| r.turn),
                "to_turn": removed.last().map(|r| r.turn),
            })),
        };
        checkpoint.hash = checkpoint.compute_hash();

        chain.push(checkpoint);
        let mut previous = chain[0].hash.clone();
        for mut row in tail {
            row.previous_hash = previous;
            row.hash = chain_hash(&row.previous_hash, &row.canonical());
            previous = row.hash.clone();
            chain.push(row);
        }

        let removed_count = removed.len();
        let kept = chain.len();
        self.rewrite_locked(&inner)?;

        TraceEvent::LedgerCheckpoint {
            session_id: session_id.to_string(),
            removed_rows: removed_count,
            kept_rows: kept,
        }
        .emit();

        Ok(removed_count)
    }

    // ── Private ──────────────────────────────────────────────────────

    fn append_line(&self, row: &EvidenceRow) -> Result<()> {
        let json = serde_json::to_string(row).map_err(Error::Json)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;
        Ok(())
    }

    /// Rewrite the whole file from the in-memory state, atomically.
    fn rewrite_locked(&self, sessions: &HashMap<String, Vec<EvidenceRow>>) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        let mut ids: Vec<&String> = sessions.keys().collect();
        ids.sort();
        for id in ids {
            for row in &sessions[id] {
                buf.push_str(&serde_json::to_string(row).map_err(Error::Json)?);
                buf.push('\n');
            }
        }
        std::fs::write(&tmp, buf).map_err(Error::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, EvidenceLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = EvidenceLedger::open(&dir.path().join("evidence.jsonl")).unwrap();
        (dir, ledger)
    }

    fn entry(session: &str, turn: u64, tool: &str, verdict: Verdict) -> EvidenceEntry {
        EvidenceEntry {
            session_id: session.into(),
            turn,
            skill: Some("build".into()),
            tool: tool.into(),
            args_summary: format!("{tool} args"),
            output_summary: format!("{tool} output on turn {turn}"),
            verdict,
            metadata: None,
        }
    }

    #[test]
    fn chain_verifies_after_appends() {
        let (_dir, ledger) = ledger();
        for turn in 1..=4 {
            ledger.append(entry("s1", turn, "exec", Verdict::Pass)).unwrap();
        }
        let report = ledger.verify_chain("s1");
        assert!(report.valid);
        assert_eq!(report.rows, 4);
    }

    #[test]
    fn first_row_links_to_empty_hash() {
        let (_dir, ledger) = ledger();
        let row = ledger.append(entry("s1", 1, "exec", Verdict::Pass)).unwrap();
        assert!(row.previous_hash.is_empty());
        assert_eq!(row.hash, row.compute_hash());
    }

    #[test]
    fn secrets_are_redacted_before_hashing() {
        let (_dir, ledger) = ledger();
        let mut e = entry("s1", 1, "exec", Verdict::Pass);
        e.output_summary = "token sk-abcdefghijklmnop1234 used".into();
        let row = ledger.append(e).unwrap();
        assert!(!row.output_summary.contains("sk-abcdef"));
        // The stored hash covers the redacted text.
        assert_eq!(row.output_hash, content_hash(&row.output_summary));
        assert!(ledger.verify_chain("s1").valid);
    }

    #[test]
    fn compaction_keeps_tail_and_verifies() {
        let (_dir, ledger) = ledger();
        for turn in 1..=5 {
            ledger.append(entry("s1", turn, "exec", Verdict::Pass)).unwrap();
        }
        let removed = ledger
            .compact_session(
                "s1",
                &CompactOptions {
                    keep_last: 2,
                    reason: "cadence".into(),
                },
            )
            .unwrap();
        assert_eq!(removed, 3);

        let rows = ledger.list("s1");
        assert!(rows.len() < 6);
        assert_eq!(rows.len(), 3); // checkpoint + 2 survivors
        assert_eq!(rows[0].tool, CHECKPOINT_TOOL);
        assert_eq!(rows[0].metadata.as_ref().unwrap()["compacted_rows"], 3);
        assert!(ledger.verify_chain("s1").valid);

        // The checkpoint links into the original chain's root.
        assert!(rows[0].previous_hash.is_empty());
    }

    #[test]
    fn compaction_interleaved_with_appends_stays_valid() {
        let (_dir, ledger) = ledger();
        for turn in 1..=3 {
            ledger.append(entry("s1", turn, "exec", Verdict::Fail)).unwrap();
        }
        ledger
            .compact_session(
                "s1",
                &CompactOptions {
                    keep_last: 1,
                    reason: "test".into(),
                },
            )
            .unwrap();
        for turn in 4..=6 {
            ledger.append(entry("s1", turn, "read", Verdict::Pass)).unwrap();
        }
        ledger
            .compact_session(
                "s1",
                &CompactOptions {
                    keep_last: 2,
                    reason: "test".into(),
                },
            )
            .unwrap();
        assert!(ledger.verify_chain("s1").valid);
    }

    #[test]
    fn compaction_noop_when_under_window() {
        let (_dir, ledger) = ledger();
        ledger.append(entry("s1", 1, "exec", Verdict::Pass)).unwrap();
        let removed = ledger
            .compact_session(
                "s1",
                &CompactOptions {
                    keep_last: 5,
                    reason: "test".into(),
                },
            )
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(ledger.list("s1").len(), 1);
    }

    #[test]
    fn sessions_have_independent_chains() {
        let (_dir, ledger) = ledger();
        ledger.append(entry("a", 1, "exec", Verdict::Pass)).unwrap();
        ledger.append(entry("b", 1, "exec", Verdict::Pass)).unwrap();
        assert!(ledger.verify_chain("a").valid);
        assert!(ledger.verify_chain("b").valid);
        assert!(ledger.list("b")[0].previous_hash.is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.jsonl");
        {
            let ledger = EvidenceLedger::open(&path).unwrap();
            for turn in 1..=3 {
                ledger.append(entry("s1", turn, "exec", Verdict::Pass)).unwrap();
            }
        }
        let ledger = EvidenceLedger::open(&path).unwrap();
        assert_eq!(ledger.list("s1").len(), 3);
        assert!(ledger.verify_chain("s1").valid);
    }

    #[test]
    fn query_filters() {
        let (_dir, ledger) = ledger();
        ledger.append(entry("s1", 1, "exec", Verdict::Pass)).unwrap();
        ledger.append(entry("s1", 1, "read", Verdict::Fail)).unwrap();
        ledger.append(entry("s1", 2, "exec", Verdict::Fail)).unwrap();

        let fails = ledger.query(
            "s1",
            &LedgerFilter {
                verdict: Some(Verdict::Fail),
                ..Default::default()
            },
        );
        assert_eq!(fails.len(), 2);

        let last_exec = ledger.query(
            "s1",
            &LedgerFilter {
                tool: Some("exec".into()),
                last: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(last_exec.len(), 1);
        assert_eq!(last_exec[0].turn, 2);
    }
}
