//! Per-scope injection accounting.
//!
//! A scope is a branch-like sub-identity within a session. Each scope
//! tracks the tokens reserved by accepted injections and the fingerprint
//! of the last accepted one (for duplicate suppression). Compaction
//! clears every scope of the session.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Key of an injection scope: `(session_id, scope_id?)`. A `None` scope is
/// the session's root scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub session_id: String,
    pub scope_id: Option<String>,
}

impl ScopeKey {
    pub fn new(session_id: &str, scope_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.to_string(),
            scope_id: scope_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ScopeState {
    reserved_tokens: u64,
    last_fingerprint: Option<String>,
}

/// Tracks reservations and fingerprints across all scopes.
#[derive(Default)]
pub struct ScopeLedger {
    scopes: Mutex<HashMap<ScopeKey, ScopeState>>,
}

impl ScopeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `fingerprint` matches the last accepted injection in scope.
    pub fn is_duplicate(&self, key: &ScopeKey, fingerprint: &str) -> bool {
        self.scopes
            .lock()
            .get(key)
            .and_then(|s| s.last_fingerprint.as_deref())
            .is_some_and(|last| last == fingerprint)
    }

    /// Record an accepted injection: store the fingerprint and add the
    /// reservation.
    pub fn record_acceptance(&self, key: &ScopeKey, fingerprint: &str, tokens: u64) {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(key.clone()).or_default();
        state.last_fingerprint = Some(fingerprint.to_string());
        state.reserved_tokens += tokens;
    }

    /// Add a reservation without touching the fingerprint (supplemental
    /// commits).
    pub fn reserve(&self, key: &ScopeKey, tokens: u64) {
        self.scopes.lock().entry(key.clone()).or_default().reserved_tokens += tokens;
    }

    pub fn reserved(&self, key: &ScopeKey) -> u64 {
        self.scopes
            .lock()
            .get(key)
            .map(|s| s.reserved_tokens)
            .unwrap_or(0)
    }

    /// Remaining budget in this scope against `max_tokens`.
    pub fn remaining(&self, key: &ScopeKey, max_tokens: u64) -> u64 {
        max_tokens.saturating_sub(self.reserved(key))
    }

    /// Drop every scope belonging to `session_id` (post-compaction).
    pub fn clear_session(&self, session_id: &str) {
        self.scopes
            .lock()
            .retain(|key, _| key.session_id != session_id);
    }
}

/// Stable fingerprint of an injection text.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection_per_scope() {
        let ledger = ScopeLedger::new();
        let a = ScopeKey::new("s1", Some("leaf-a"));
        let b = ScopeKey::new("s1", Some("leaf-b"));
        let fp = fingerprint("hello");

        assert!(!ledger.is_duplicate(&a, &fp));
        ledger.record_acceptance(&a, &fp, 10);
        assert!(ledger.is_duplicate(&a, &fp));
        assert!(!ledger.is_duplicate(&b, &fp));
    }

    #[test]
    fn reservations_accumulate_and_clear() {
        let ledger = ScopeLedger::new();
        let key = ScopeKey::new("s1", None);
        ledger.record_acceptance(&key, &fingerprint("x"), 30);
        ledger.reserve(&key, 20);
        assert_eq!(ledger.reserved(&key), 50);
        assert_eq!(ledger.remaining(&key, 60), 10);
        assert_eq!(ledger.remaining(&key, 40), 0);

        ledger.clear_session("s1");
        assert_eq!(ledger.reserved(&key), 0);
        assert!(!ledger.is_duplicate(&key, &fingerprint("x")));
    }

    #[test]
    fn clear_only_targets_one_session() {
        let ledger = ScopeLedger::new();
        let a = ScopeKey::new("s1", None);
        let b = ScopeKey::new("s2", None);
        ledger.reserve(&a, 5);
        ledger.reserve(&b, 7);
        ledger.clear_session("s1");
        assert_eq!(ledger.reserved(&a), 0);
        assert_eq!(ledger.reserved(&b), 7);
    }
}
