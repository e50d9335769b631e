//! The event store: append, query, subscribe.
//!
//! Persistence is one append-only JSONL file per session under the events
//! directory. Readers tolerate a truncated or garbage trailing line (a
//! crash mid-flush); everything before it is preserved.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use ov_domain::error::{Error, Result};
use ov_domain::redact::{normalize_payload, redact_value};
use ov_domain::trace::TraceEvent;

use crate::record::{EventRecord, StructuredEvent};

type Listener = Box<dyn Fn(&EventRecord) + Send + Sync>;

/// Handle returned by [`EventStore::subscribe`]; pass back to
/// [`EventStore::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Filter for [`EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kind: Option<String>,
    /// When set and > 0, return the last N matches in reverse-chronological
    /// order. Otherwise all matches ascending.
    pub last: Option<usize>,
}

/// The process-wide sequence counter. Single owner; advanced only here.
struct EventSeq {
    next: AtomicU64,
}

impl EventSeq {
    fn starting_after(max_seen: u64) -> Self {
        Self {
            next: AtomicU64::new(max_seen + 1),
        }
    }

    fn advance(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Append-only per-session event streams with live subscribers.
pub struct EventStore {
    dir: PathBuf,
    seq: EventSeq,
    sessions: RwLock<HashMap<String, Vec<EventRecord>>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
}

impl EventStore {
    /// Open (or create) the store rooted at `dir`. Existing streams are
    /// hydrated so the sequence counter resumes past every persisted event.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;

        let mut sessions: HashMap<String, Vec<EventRecord>> = HashMap::new();
        let mut max_seq = 0u64;

        for entry in std::fs::read_dir(dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let records = read_stream(&path)?;
            for r in &records {
                max_seq = max_seq.max(r.seq);
            }
            sessions.insert(session_id.to_string(), records);
        }

        tracing::info!(
            dir = %dir.display(),
            sessions = sessions.len(),
            resumed_seq = max_seq,
            "event store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            seq: EventSeq::starting_after(max_seq),
            sessions: RwLock::new(sessions),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Append one event: normalize + redact the payload, assign a stable id
    /// and the next global sequence, flush to disk, then dispatch to
    /// subscribers synchronously.
    pub fn append(
        &self,
        session_id: &str,
        kind: &str,
        turn: Option<u64>,
        payload: Option<serde_json::Value>,
    ) -> Result<EventRecord> {
        let payload = payload
            .map(|p| redact_value(&normalize_payload(&p)))
            .filter(|p| !matches!(p, serde_json::Value::Object(m) if m.is_empty()));

        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.seq.advance(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            timestamp: Utc::now(),
            turn,
            payload,
        };

        self.flush_line(&record)?;
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push(record.clone());

        TraceEvent::EventAppended {
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            seq: record.seq,
        }
        .emit();

        self.dispatch(&record);
        Ok(record)
    }

    /// Query a session's events. See [`EventQuery`] for ordering rules.
    pub fn query(&self, session_id: &str, query: &EventQuery) -> Vec<EventRecord> {
        let sessions = self.sessions.read();
        let Some(records) = sessions.get(session_id) else {
            return Vec::new();
        };

        let mut matches: Vec<EventRecord> = records
            .iter()
            .filter(|r| query.kind.as_deref().is_none_or(|k| r.kind == k))
            .cloned()
            .collect();

        match query.last {
            Some(n) if n > 0 => {
                let start = matches.len().saturating_sub(n);
                let mut tail: Vec<EventRecord> = matches.split_off(start);
                tail.reverse();
                tail
            }
            _ => matches,
        }
    }

    /// Structured projection of [`EventStore::query`].
    pub fn query_structured(&self, session_id: &str, query: &EventQuery) -> Vec<StructuredEvent> {
        self.query(session_id, query)
            .iter()
            .map(StructuredEvent::from)
            .collect()
    }

    /// All session ids with at least one event, sorted.
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Most recent event for a session.
    pub fn latest(&self, session_id: &str) -> Option<EventRecord> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|records| records.last().cloned())
    }

    /// Register a listener invoked synchronously inside every `append`.
    /// Listener panics are swallowed so the stream stays live.
    pub fn subscribe(
        &self,
        listener: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, Box::new(listener));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().remove(&id.0);
    }

    // ── Private ──────────────────────────────────────────────────────

    fn dispatch(&self, record: &EventRecord) {
        let listeners = self.listeners.lock();
        for (id, listener) in listeners.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(record)
            }));
            if result.is_err() {
                tracing::warn!(listener_id = id, "event listener panicked; continuing");
            }
        }
    }

    fn flush_line(&self, record: &EventRecord) -> Result<()> {
        let path = self.dir.join(format!("{}.jsonl", record.session_id));
        let json = serde_json::to_string(record).map_err(Error::Json)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;
        Ok(())
    }
}

/// Read one session stream, skipping malformed lines.
fn read_stream(path: &Path) -> Result<Vec<EventRecord>> {
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut records = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(r) => records.push(r),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping malformed event line"
                );
            }
        }
    }
    Ok(records)
}
