//! Connection registry: per-connection state, subscription sets, and the
//! session → connections reverse index used for scoped broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ov_protocol::ServerFrame;

use crate::seq::BroadcastSeq;

/// What travels to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

pub type ConnSink = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    Connected,
    Authenticating,
    Authenticated,
    Closing,
}

pub struct ConnState {
    pub conn_id: u64,
    pub sink: ConnSink,
    pub phase: ConnPhase,
    /// The raw token this connection authenticated with; revoked
    /// connections are matched by it at rotation time.
    pub authenticated_token: Option<String>,
    pub challenge_nonce: String,
    pub subscribed_sessions: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

pub struct ConnectionRegistry {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnState>>,
    /// session id → connections subscribed to it.
    reverse: Mutex<HashMap<String, HashSet<u64>>>,
    seq: Arc<BroadcastSeq>,
}

impl ConnectionRegistry {
    pub fn new(seq: Arc<BroadcastSeq>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
            seq,
        }
    }

    pub fn register(&self, sink: ConnSink, challenge_nonce: String) -> u64 {
        let conn_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        self.conns.lock().insert(
            conn_id,
            ConnState {
                conn_id,
                sink,
                phase: ConnPhase::Authenticating,
                authenticated_token: None,
                challenge_nonce,
                subscribed_sessions: HashSet::new(),
                connected_at: now,
                last_seen_at: now,
            },
        );
        conn_id
    }

    /// Remove a connection from the registry and every reverse index.
    pub fn remove(&self, conn_id: u64) {
        let removed = self.conns.lock().remove(&conn_id);
        if let Some(conn) = removed {
            let mut reverse = self.reverse.lock();
            for session in conn.subscribed_sessions {
                if let Some(subscribers) = reverse.get_mut(&session) {
                    subscribers.remove(&conn_id);
                    if subscribers.is_empty() {
                        reverse.remove(&session);
                    }
                }
            }
        }
    }

    pub fn touch(&self, conn_id: u64) {
        if let Some(conn) = self.conns.lock().get_mut(&conn_id) {
            conn.last_seen_at = Utc::now();
        }
    }

    pub fn challenge_nonce(&self, conn_id: u64) -> Option<String> {
        self.conns
            .lock()
            .get(&conn_id)
            .map(|c| c.challenge_nonce.clone())
    }

    pub fn phase(&self, conn_id: u64) -> Option<ConnPhase> {
        self.conns.lock().get(&conn_id).map(|c| c.phase)
    }

    pub fn is_authenticated(&self, conn_id: u64) -> bool {
        self.phase(conn_id) == Some(ConnPhase::Authenticated)
    }

    pub fn mark_authenticated(&self, conn_id: u64, token: &str) {
        if let Some(conn) = self.conns.lock().get_mut(&conn_id) {
            conn.phase = ConnPhase::Authenticated;
            conn.authenticated_token = Some(token.to_string());
        }
    }

    pub fn subscribe(&self, conn_id: u64, session_id: &str) -> bool {
        let mut conns = self.conns.lock();
        let Some(conn) = conns.get_mut(&conn_id) else {
            return false;
        };
        conn.subscribed_sessions.insert(session_id.to_string());
        drop(conns);
        self.reverse
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id);
        true
    }

    pub fn unsubscribe(&self, conn_id: u64, session_id: &str) -> bool {
        let mut conns = self.conns.lock();
        let Some(conn) = conns.get_mut(&conn_id) else {
            return false;
        };
        let removed = conn.subscribed_sessions.remove(session_id);
        drop(conns);
        if removed {
            let mut reverse = self.reverse.lock();
            if let Some(subscribers) = reverse.get_mut(session_id) {
                subscribers.remove(&conn_id);
                if subscribers.is_empty() {
                    reverse.remove(session_id);
                }
            }
        }
        removed
    }

    pub fn subscriptions(&self, conn_id: u64) -> Vec<String> {
        let mut subs: Vec<String> = self
            .conns
            .lock()
            .get(&conn_id)
            .map(|c| c.subscribed_sessions.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Send a response frame to one connection.
    pub fn send_to(&self, conn_id: u64, frame: ServerFrame) {
        if let Some(conn) = self.conns.lock().get(&conn_id) {
            if conn.sink.try_send(Outbound::Frame(frame)).is_err() {
                tracing::debug!(conn_id, "dropping frame for slow connection");
            }
        }
    }

    /// Broadcast an event to every authenticated connection; one `seq`
    /// for all recipients.
    pub fn broadcast(&self, event: &str, payload: Option<serde_json::Value>) -> u64 {
        let seq = self.seq.advance();
        let conns = self.conns.lock();
        for conn in conns.values() {
            if conn.phase != ConnPhase::Authenticated {
                continue;
            }
            let frame = ServerFrame::Event {
                event: event.to_string(),
                payload: payload.clone(),
                seq,
            };
            if conn.sink.try_send(Outbound::Frame(frame)).is_err() {
                tracing::debug!(conn_id = conn.conn_id, "dropping broadcast for slow connection");
            }
        }
        seq
    }

    /// Deliver a session-scoped event to that session's subscribers only;
    /// all of them observe the identical `seq`.
    pub fn session_event(
        &self,
        session_id: &str,
        event: &str,
        payload: Option<serde_json::Value>,
    ) -> u64 {
        let seq = self.seq.advance();
        let subscribers: Vec<u64> = self
            .reverse
            .lock()
            .get(session_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let conns = self.conns.lock();
        for conn_id in subscribers {
            let Some(conn) = conns.get(&conn_id) else {
                continue;
            };
            if conn.phase != ConnPhase::Authenticated {
                continue;
            }
            let frame = ServerFrame::Event {
                event: event.to_string(),
                payload: payload.clone(),
                seq,
            };
            if conn.sink.try_send(Outbound::Frame(frame)).is_err() {
                tracing::debug!(conn_id, "dropping session event for slow connection");
            }
        }
        seq
    }

    /// How many live connections authenticated with `token`.
    pub fn count_conns_with_token(&self, token: &str) -> usize {
        self.conns
            .lock()
            .values()
            .filter(|conn| conn.authenticated_token.as_deref() == Some(token))
            .count()
    }

    /// Close every connection authenticated with `token`, clearing their
    /// subscription entries. Returns how many were revoked.
    pub fn close_conns_with_token(&self, token: &str, code: u16, reason: &str) -> usize {
        let targets: Vec<u64> = self
            .conns
            .lock()
            .values_mut()
            .filter(|conn| conn.authenticated_token.as_deref() == Some(token))
            .map(|conn| {
                conn.phase = ConnPhase::Closing;
                let _ = conn.sink.try_send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                });
                conn.conn_id
            })
            .collect();
        let revoked = targets.len();
        for conn_id in targets {
            self.remove(conn_id);
        }
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ConnectionRegistry, Vec<(u64, mpsc::Receiver<Outbound>)>) {
        let registry = ConnectionRegistry::new(Arc::new(BroadcastSeq::new()));
        let mut conns = Vec::new();
        for i in 0..3 {
            let (tx, rx) = mpsc::channel(16);
            let id = registry.register(tx, format!("nonce-{i}"));
            registry.mark_authenticated(id, "tok");
            conns.push((id, rx));
        }
        (registry, conns)
    }

    fn recv_seq(rx: &mut mpsc::Receiver<Outbound>) -> u64 {
        match rx.try_recv().unwrap() {
            Outbound::Frame(ServerFrame::Event { seq, .. }) => seq,
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn broadcast_shares_one_seq() {
        let (registry, mut conns) = registry();
        registry.broadcast("tick", None);
        let seqs: Vec<u64> = conns.iter_mut().map(|(_, rx)| recv_seq(rx)).collect();
        assert!(seqs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn session_events_are_scoped() {
        let (registry, mut conns) = registry();
        let (a, _) = conns[0];
        let (b, _) = conns[1];
        registry.subscribe(a, "session-A");
        registry.subscribe(b, "session-B");

        registry.session_event("session-A", "session.turn.start", None);

        assert!(matches!(
            conns[0].1.try_recv(),
            Ok(Outbound::Frame(ServerFrame::Event { .. }))
        ));
        assert!(conns[1].1.try_recv().is_err());
        assert!(conns[2].1.try_recv().is_err());
    }

    #[test]
    fn same_scope_subscribers_observe_identical_seq() {
        let (registry, mut conns) = registry();
        let (a, _) = conns[0];
        let (b, _) = conns[1];
        registry.subscribe(a, "s");
        registry.subscribe(b, "s");
        registry.session_event("s", "session.turn.start", None);
        let seq_a = recv_seq(&mut conns[0].1);
        let seq_b = recv_seq(&mut conns[1].1);
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn remove_cleans_reverse_index() {
        let (registry, conns) = registry();
        let (a, _) = conns[0];
        registry.subscribe(a, "s");
        registry.remove(a);
        // The event goes nowhere and must not panic.
        registry.session_event("s", "session.turn.start", None);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (registry, mut conns) = registry();
        let (a, _) = conns[0];
        registry.subscribe(a, "s");
        assert!(registry.unsubscribe(a, "s"));
        assert!(!registry.unsubscribe(a, "s"));
        registry.session_event("s", "x", None);
        assert!(conns[0].1.try_recv().is_err());
    }

    #[test]
    fn token_revocation_closes_and_clears() {
        let (registry, mut conns) = registry();
        let (a, _) = conns[0];
        registry.subscribe(a, "s");

        let revoked = registry.close_conns_with_token("tok", 1008, "auth token rotated");
        assert_eq!(revoked, 3);
        assert_eq!(registry.connection_count(), 0);
        match conns[0].1.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "auth token rotated");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        // Reverse index is clean.
        registry.session_event("s", "x", None);
    }

    #[test]
    fn unauthenticated_conns_receive_nothing() {
        let registry = ConnectionRegistry::new(Arc::new(BroadcastSeq::new()));
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(tx, "n".into());
        registry.broadcast("tick", None);
        assert!(rx.try_recv().is_err());
    }
}
