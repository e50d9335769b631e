//! Structured trace events emitted across all Overseer crates.
//!
//! These are *operational* logs (one JSON field on a tracing line), not
//! the persisted per-session event stream — that lives in `ov-events`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    EventAppended {
        session_id: String,
        kind: String,
        seq: u64,
    },
    LedgerCheckpoint {
        session_id: String,
        removed_rows: usize,
        kept_rows: usize,
    },
    InjectionPlanned {
        session_id: String,
        accepted: bool,
        final_tokens: u64,
        dropped_reason: Option<String>,
    },
    CompactionRequested {
        session_id: String,
        reason: String,
    },
    GateArmed {
        session_id: String,
        reason: String,
    },
    GateCleared {
        session_id: String,
    },
    WorkerSpawned {
        session_id: String,
        pid: u32,
    },
    WorkerStopped {
        session_id: String,
        reason: String,
    },
    TokenRotated {
        revoked_connections: usize,
    },
    IdleSweep {
        examined: usize,
        closed: usize,
    },
    HeartbeatReloaded {
        rules: usize,
        removed: usize,
        closed_sessions: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ov_event");
    }
}
