//! The context-window budget manager.
//!
//! Tracks per-session turn/compaction cadence, sizes injections against
//! `max_injection_tokens`, and decides when to request compaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ov_domain::config::{ContextBudgetConfig, TruncationStrategy};
use ov_domain::usage::{ContextUsage, Pressure};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of sizing a primary injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionPlan {
    pub accepted: bool,
    pub final_text: String,
    pub original_tokens: u64,
    pub final_tokens: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_reason: Option<String>,
}

/// Outcome of the compaction cadence check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionAdvice {
    pub should_compact: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionBudget {
    turn: u64,
    last_compaction_turn: Option<u64>,
    last_compaction_at: Option<DateTime<Utc>>,
    last_usage: Option<ContextUsage>,
}

/// Serializable per-session snapshot for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot(SessionBudget);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContextBudgetManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ContextBudgetManager {
    config: ContextBudgetConfig,
    sessions: Mutex<HashMap<String, SessionBudget>>,
}

impl ContextBudgetManager {
    pub fn new(config: ContextBudgetConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContextBudgetConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record the start of a turn. Turn indexes are monotonic; a stale
    /// index (replayed message) is ignored rather than rewound.
    pub fn begin_turn(&self, session_id: &str, turn: u64) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        if turn > state.turn {
            state.turn = turn;
        }
    }

    pub fn current_turn(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.turn)
            .unwrap_or(0)
    }

    pub fn observe_usage(&self, session_id: &str, usage: ContextUsage) {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_default()
            .last_usage = Some(usage);
    }

    pub fn last_usage(&self, session_id: &str) -> Option<ContextUsage> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.last_usage)
    }

    pub fn pressure(&self, usage: &ContextUsage) -> Pressure {
        Pressure::classify(usage, &self.config)
    }

    /// Pressure of the most recently observed usage for this session.
    pub fn session_pressure(&self, session_id: &str) -> Pressure {
        match self.last_usage(session_id) {
            Some(usage) => self.pressure(&usage),
            None => Pressure::Low,
        }
    }

    /// Size a primary injection against the budget.
    ///
    /// At or beyond the hard-limit ratio the whole injection is dropped
    /// (`dropped_reason = "hard_limit"`); otherwise text over
    /// `max_injection_tokens` is truncated per the configured strategy
    /// (`drop-entry` rejects instead of truncating).
    pub fn plan_injection(
        &self,
        session_id: &str,
        text: &str,
        usage: Option<&ContextUsage>,
    ) -> InjectionPlan {
        let original_tokens = self.estimate_tokens(text);

        if !self.config.enabled {
            return InjectionPlan {
                accepted: true,
                final_text: text.to_string(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                dropped_reason: None,
            };
        }

        if let Some(usage) = usage {
            self.observe_usage(session_id, *usage);
            if let Some(percent) = usage.percent() {
                if percent >= self.config.hard_limit_ratio {
                    return InjectionPlan {
                        accepted: false,
                        final_text: String::new(),
                        original_tokens,
                        final_tokens: 0,
                        truncated: false,
                        dropped_reason: Some("hard_limit".into()),
                    };
                }
            }
        }

        if original_tokens <= self.config.max_injection_tokens {
            return InjectionPlan {
                accepted: true,
                final_text: text.to_string(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                dropped_reason: None,
            };
        }

        if self.config.truncation_strategy == TruncationStrategy::DropEntry {
            return InjectionPlan {
                accepted: false,
                final_text: String::new(),
                original_tokens,
                final_tokens: 0,
                truncated: false,
                dropped_reason: Some("drop_entry".into()),
            };
        }

        let max_chars = (self.config.max_injection_tokens * self.config.chars_per_token) as usize;
        let final_text = truncate_chars(text, max_chars, self.config.truncation_strategy);
        let final_tokens = self.estimate_tokens(&final_text);
        InjectionPlan {
            accepted: true,
            final_text,
            original_tokens,
            final_tokens,
            truncated: true,
            dropped_reason: None,
        }
    }

    /// Compaction cadence: pressure threshold + minimum turns + minimum
    /// seconds, with a bypass ratio that overrides the cadence entirely.
    pub fn should_request_compaction(
        &self,
        session_id: &str,
        usage: &ContextUsage,
    ) -> CompactionAdvice {
        if !self.config.enabled {
            return advice(false, "disabled");
        }
        let Some(percent) = usage.percent() else {
            return advice(false, "no_usage");
        };

        if percent >= self.config.pressure_bypass_percent {
            return advice(true, "pressure_bypass");
        }
        if percent < self.config.compaction_threshold {
            return advice(false, "below_threshold");
        }

        let sessions = self.sessions.lock();
        let state = sessions.get(session_id).cloned().unwrap_or_default();

        if let Some(last_turn) = state.last_compaction_turn {
            let elapsed = state.turn.saturating_sub(last_turn);
            if elapsed < self.config.min_turns_between_compaction {
                return advice(false, "turn_cadence");
            }
        }
        if let Some(last_at) = state.last_compaction_at {
            let elapsed = Utc::now().signed_duration_since(last_at).num_seconds();
            if elapsed < self.config.min_seconds_between_compaction {
                return advice(false, "time_cadence");
            }
        }
        advice(true, "threshold")
    }

    /// Record a completed compaction at the session's current turn.
    pub fn mark_compacted(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.last_compaction_turn = Some(state.turn);
        state.last_compaction_at = Some(Utc::now());
    }

    /// Whether a compaction happened within the recent-compaction window.
    pub fn has_recent_compaction(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock();
        let Some(state) = sessions.get(session_id) else {
            return false;
        };
        match state.last_compaction_turn {
            Some(last) => {
                state.turn.saturating_sub(last) <= self.config.recent_compaction_window_turns
            }
            None => false,
        }
    }

    pub fn snapshot_session(&self, session_id: &str) -> Option<BudgetSnapshot> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .map(BudgetSnapshot)
    }

    pub fn restore_session(&self, session_id: &str, snapshot: BudgetSnapshot) {
        self.sessions
            .lock()
            .insert(session_id.to_string(), snapshot.0);
    }

    pub fn forget_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    /// Fixed characters-per-token estimator, rounded up.
    pub fn estimate_tokens(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(self.config.chars_per_token.max(1))
    }
}

fn advice(should_compact: bool, reason: &str) -> CompactionAdvice {
    CompactionAdvice {
        should_compact,
        reason: reason.to_string(),
    }
}

/// Truncate `text` to `max_chars` characters.
///
/// Budgets of 3 chars or fewer return a plain head slice; larger budgets
/// reserve the final character for an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize, strategy: TruncationStrategy) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return chars[..max_chars].iter().collect();
    }

    let body = max_chars - 1;
    let mut out: String = match strategy {
        TruncationStrategy::Tail => chars[chars.len() - body..].iter().collect(),
        TruncationStrategy::Summarize => {
            // Head + tail excerpt with an elision marker in the middle.
            let head = body * 3 / 5;
            let tail = body - head;
            let mut s: String = chars[..head].iter().collect();
            s.push('\n');
            s.push_str(&chars[chars.len() - tail.saturating_sub(1)..].iter().collect::<String>());
            s
        }
        TruncationStrategy::DropEntry => String::new(),
    };
    out.push('…');
    out
}
