//! The verification gate.
//!
//! For `standard`/`strict` levels the configured check commands run via
//! `sh -c` with a timeout and an output cap. Each result is memoized per
//! `(session, check)` until the session's next write invalidates it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use ov_domain::config::{VerificationCheck, VerificationConfig, VerificationLevel};
use ov_domain::error::Result;
use ov_events::EventStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_excerpt: String,
    pub duration_ms: u64,
    /// True when served from the memo instead of a fresh run.
    pub memoized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub missing_evidence: Vec<String>,
    pub checks: Vec<CheckResult>,
}

struct MemoEntry {
    at: DateTime<Utc>,
    result: CheckResult,
}

#[derive(Default)]
struct SessionVerify {
    last_write_at: Option<DateTime<Utc>>,
    memo: HashMap<String, MemoEntry>,
}

pub struct VerificationGate {
    config: VerificationConfig,
    events: Arc<EventStore>,
    sessions: Mutex<HashMap<String, SessionVerify>>,
}

impl VerificationGate {
    pub fn new(config: VerificationConfig, events: Arc<EventStore>) -> Self {
        Self {
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a mutation-tool write; stale memos re-execute on the next
    /// evaluation.
    pub fn note_write(&self, session_id: &str) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .last_write_at = Some(Utc::now());
    }

    /// Clear all memoized results (rollback, explicit reset).
    pub fn reset_state(&self, session_id: &str) {
        {
            let mut sessions = self.sessions.lock();
            let state = sessions.entry(session_id.to_string()).or_default();
            state.memo.clear();
            state.last_write_at = None;
        }
        if let Err(e) =
            self.events
                .append(session_id, "verification_state_reset", None, Some(json!({})))
        {
            tracing::warn!(error = %e, "failed to persist verification reset event");
        }
    }

    pub fn forget_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    /// Evaluate the session at a verification level.
    ///
    /// `none` and `basic` demand no command evidence. `standard`/`strict`
    /// run every configured check whose level is at or below the request;
    /// a level that demands evidence with no eligible checks configured
    /// fails with `missing_verification_commands`.
    pub async fn evaluate(&self, session_id: &str, level: VerificationLevel) -> Result<VerificationReport> {
        if level <= VerificationLevel::Basic {
            return Ok(VerificationReport {
                passed: true,
                missing_evidence: Vec::new(),
                checks: Vec::new(),
            });
        }

        let eligible: Vec<VerificationCheck> = self
            .config
            .checks
            .iter()
            .filter(|c| c.level <= level)
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Ok(VerificationReport {
                passed: false,
                missing_evidence: vec!["missing_verification_commands".into()],
                checks: Vec::new(),
            });
        }

        let mut checks = Vec::new();
        let mut missing = Vec::new();
        for check in eligible {
            if let Some(memoized) = self.memo_lookup(session_id, &check.name) {
                checks.push(memoized);
                continue;
            }
            let mut result = run_check(&check).await;
            self.emit_outcome(session_id, &result);
            self.memo_store(session_id, &result);
            if result.timed_out {
                missing.push(format!("missing_check_result:{}", check.name));
            }
            result.memoized = false;
            checks.push(result);
        }

        let passed = missing.is_empty() && checks.iter().all(|c| c.passed);
        Ok(VerificationReport {
            passed,
            missing_evidence: missing,
            checks,
        })
    }

    // ── Private ──────────────────────────────────────────────────────

    fn memo_lookup(&self, session_id: &str, check_name: &str) -> Option<CheckResult> {
        let sessions = self.sessions.lock();
        let state = sessions.get(session_id)?;
        let entry = state.memo.get(check_name)?;
        // A write after the memoized run makes it stale.
        if let Some(write_at) = state.last_write_at {
            if write_at >= entry.at {
                return None;
            }
        }
        let mut result = entry.result.clone();
        result.memoized = true;
        Some(result)
    }

    fn memo_store(&self, session_id: &str, result: &CheckResult) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .memo
            .insert(
                result.name.clone(),
                MemoEntry {
                    at: Utc::now(),
                    result: result.clone(),
                },
            );
    }

    fn emit_outcome(&self, session_id: &str, result: &CheckResult) {
        let payload = json!({
            "check": result.name,
            "passed": result.passed,
            "exit_code": result.exit_code,
            "duration_ms": result.duration_ms,
        });
        if let Err(e) = self.events.append(
            session_id,
            "verification_outcome_recorded",
            None,
            Some(payload),
        ) {
            tracing::warn!(error = %e, "failed to persist verification outcome");
        }
    }
}

async fn run_check(check: &VerificationCheck) -> CheckResult {
    let started = std::time::Instant::now();
    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return CheckResult {
                name: check.name.clone(),
                passed: false,
                exit_code: None,
                timed_out: false,
                output_excerpt: format!("spawn failed: {e}"),
                duration_ms: started.elapsed().as_millis() as u64,
                memoized: false,
            };
        }
    };

    let timeout = std::time::Duration::from_millis(check.timeout_ms);
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut excerpt = String::from_utf8_lossy(&output.stdout).into_owned();
            excerpt.push_str(&String::from_utf8_lossy(&output.stderr));
            if excerpt.len() > check.max_output_bytes {
                excerpt.truncate(floor_char_boundary(&excerpt, check.max_output_bytes));
                excerpt.push_str("\n[output truncated]");
            }
            CheckResult {
                name: check.name.clone(),
                passed: output.status.success(),
                exit_code: output.status.code(),
                timed_out: false,
                output_excerpt: excerpt,
                duration_ms: started.elapsed().as_millis() as u64,
                memoized: false,
            }
        }
        Ok(Err(e)) => CheckResult {
            name: check.name.clone(),
            passed: false,
            exit_code: None,
            timed_out: false,
            output_excerpt: format!("wait failed: {e}"),
            duration_ms: started.elapsed().as_millis() as u64,
            memoized: false,
        },
        Err(_) => CheckResult {
            name: check.name.clone(),
            passed: false,
            exit_code: None,
            timed_out: true,
            output_excerpt: "[timed out]".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            memoized: false,
        },
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(checks: Vec<VerificationCheck>) -> (tempfile::TempDir, VerificationGate) {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStore::open(dir.path()).unwrap());
        (
            dir,
            VerificationGate::new(VerificationConfig { checks }, events),
        )
    }

    fn check(name: &str, command: &str) -> VerificationCheck {
        VerificationCheck {
            name: name.into(),
            command: command.into(),
            timeout_ms: 5_000,
            max_output_bytes: 4_096,
            level: VerificationLevel::Standard,
        }
    }

    #[tokio::test]
    async fn basic_level_needs_no_evidence() {
        let (_dir, gate) = gate_with(vec![]);
        let report = gate.evaluate("s1", VerificationLevel::Basic).await.unwrap();
        assert!(report.passed);
        assert!(report.checks.is_empty());
    }

    #[tokio::test]
    async fn standard_without_checks_is_missing_evidence() {
        let (_dir, gate) = gate_with(vec![]);
        let report = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(
            report.missing_evidence,
            vec!["missing_verification_commands".to_string()]
        );
    }

    #[tokio::test]
    async fn passing_and_failing_commands() {
        let (_dir, gate) = gate_with(vec![check("ok", "true"), check("bad", "exit 3")]);
        let report = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert!(!report.passed);
        let ok = report.checks.iter().find(|c| c.name == "ok").unwrap();
        assert!(ok.passed);
        let bad = report.checks.iter().find(|c| c.name == "bad").unwrap();
        assert!(!bad.passed);
        assert_eq!(bad.exit_code, Some(3));
    }

    #[tokio::test]
    async fn results_memoize_until_write() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cmd = format!("echo x >> {} && true", marker.display());
        let (_edir, gate) = gate_with(vec![check("count", &cmd)]);

        gate.evaluate("s1", VerificationLevel::Standard).await.unwrap();
        let second = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert!(second.checks[0].memoized);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);

        gate.note_write("s1");
        let third = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert!(!third.checks[0].memoized);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let mut slow = check("slow", "sleep 5");
        slow.timeout_ms = 100;
        let (_dir, gate) = gate_with(vec![slow]);
        let report = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.checks[0].timed_out);
        assert!(report
            .missing_evidence
            .iter()
            .any(|m| m.contains("slow")));
    }

    #[tokio::test]
    async fn strict_includes_strict_only_checks() {
        let mut strict_check = check("deep", "true");
        strict_check.level = VerificationLevel::Strict;
        let (_dir, gate) = gate_with(vec![check("fast", "true"), strict_check]);

        let standard = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        assert_eq!(standard.checks.len(), 1);

        let strict = gate.evaluate("s1", VerificationLevel::Strict).await.unwrap();
        assert_eq!(strict.checks.len(), 2);
    }

    #[tokio::test]
    async fn reset_state_clears_memo() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cmd = format!("echo x >> {} && true", marker.display());
        let (_edir, gate) = gate_with(vec![check("count", &cmd)]);

        gate.evaluate("s1", VerificationLevel::Standard).await.unwrap();
        gate.reset_state("s1");
        gate.evaluate("s1", VerificationLevel::Standard).await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut noisy = check("noisy", "yes | head -c 100000");
        noisy.max_output_bytes = 512;
        let (_dir, gate) = gate_with(vec![noisy]);
        let report = gate
            .evaluate("s1", VerificationLevel::Standard)
            .await
            .unwrap();
        let excerpt = &report.checks[0].output_excerpt;
        assert!(excerpt.len() < 1_000);
        assert!(excerpt.contains("[output truncated]"));
    }
}
