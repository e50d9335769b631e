//! The session supervisor: worker handles, the persisted children
//! registry, capacity limits, and the idle sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ov_domain::config::GatewayConfig;
use ov_domain::trace::TraceEvent;

use crate::backend::{SessionBackend, SessionBackendError, StateErrorKind};

/// One supervised worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub session_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pending_requests: u64,
    pub pending_turns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_request_id: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
}

pub struct SessionSupervisor {
    config: GatewayConfig,
    children_path: PathBuf,
    backend: Arc<dyn SessionBackend>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl SessionSupervisor {
    pub fn new(
        config: GatewayConfig,
        children_path: &Path,
        backend: Arc<dyn SessionBackend>,
    ) -> Self {
        let supervisor = Self {
            config,
            children_path: children_path.to_path_buf(),
            backend,
            workers: Mutex::new(HashMap::new()),
        };
        supervisor.load_registry();
        supervisor
    }

    /// Open (or reuse) the worker for a session. Enforces the hard worker
    /// limit; with queueing disabled overflow is a capacity error.
    pub async fn open_session(
        &self,
        session_id: &str,
    ) -> Result<(WorkerHandle, bool), SessionBackendError> {
        {
            let mut workers = self.workers.lock();
            if let Some(handle) = workers.get_mut(session_id) {
                handle.last_activity_at = Utc::now();
                return Ok((handle.clone(), false));
            }
            if workers.len() >= self.config.max_workers && !self.config.queue_enabled {
                return Err(SessionBackendError::Capacity);
            }
        }

        let pid = self.backend.spawn(session_id).await?;
        let now = Utc::now();
        let handle = WorkerHandle {
            session_id: session_id.to_string(),
            pid,
            started_at: now,
            last_activity_at: now,
            pending_requests: 0,
            pending_turns: 0,
            ready_request_id: None,
            last_heartbeat_at: now,
        };
        self.workers
            .lock()
            .insert(session_id.to_string(), handle.clone());
        self.persist_registry();

        TraceEvent::WorkerSpawned {
            session_id: session_id.to_string(),
            pid,
        }
        .emit();
        Ok((handle, true))
    }

    /// Route one message to a session's worker, opening it on demand.
    pub async fn send(&self, session_id: &str, message: &str) -> Result<(), SessionBackendError> {
        self.open_session(session_id).await?;
        {
            let mut workers = self.workers.lock();
            if let Some(handle) = workers.get_mut(session_id) {
                handle.pending_requests += 1;
                handle.pending_turns += 1;
            }
        }

        let result = self.backend.send(session_id, message).await;

        {
            let mut workers = self.workers.lock();
            if let Some(handle) = workers.get_mut(session_id) {
                handle.pending_requests = handle.pending_requests.saturating_sub(1);
                handle.pending_turns = handle.pending_turns.saturating_sub(1);
                handle.last_activity_at = Utc::now();
            }
        }
        result
    }

    /// Stop one session's worker. Returns whether a worker was closed.
    pub async fn stop_session(&self, session_id: &str, reason: &str) -> bool {
        let existed = self.workers.lock().remove(session_id).is_some();
        if !existed {
            return false;
        }
        self.persist_registry();
        match self.backend.stop(session_id, reason).await {
            Ok(()) => {
                TraceEvent::WorkerStopped {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                }
                .emit();
                true
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "worker stop failed");
                true
            }
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(handle) = self.workers.lock().get_mut(session_id) {
            handle.last_activity_at = Utc::now();
        }
    }

    pub fn heartbeat(&self, session_id: &str) {
        if let Some(handle) = self.workers.lock().get_mut(session_id) {
            handle.last_heartbeat_at = Utc::now();
        }
    }

    pub fn set_ready_request(&self, session_id: &str, request_id: Option<String>) {
        if let Some(handle) = self.workers.lock().get_mut(session_id) {
            handle.ready_request_id = request_id;
        }
    }

    pub fn worker(&self, session_id: &str) -> Option<WorkerHandle> {
        self.workers.lock().get(session_id).cloned()
    }

    pub fn list_workers(&self) -> Vec<WorkerHandle> {
        let mut workers: Vec<WorkerHandle> = self.workers.lock().values().cloned().collect();
        workers.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Close workers idle past the TTL. A worker with pending requests or
    /// an outstanding ready request is never closed, regardless of its
    /// last activity. Individual stop failures never abort the sweep.
    pub async fn idle_sweep(&self) -> (usize, usize) {
        let ttl = Duration::milliseconds(self.config.session_idle_ttl_ms as i64);
        let now = Utc::now();
        let candidates: Vec<String> = {
            let workers = self.workers.lock();
            workers
                .values()
                .filter(|w| {
                    now.signed_duration_since(w.last_activity_at) >= ttl
                        && w.pending_requests == 0
                        && w.ready_request_id.is_none()
                })
                .map(|w| w.session_id.clone())
                .collect()
        };
        let examined = self.worker_count();

        let mut closed = 0usize;
        for session_id in candidates {
            if self.stop_session(&session_id, "idle_ttl").await {
                closed += 1;
            }
        }

        TraceEvent::IdleSweep { examined, closed }.emit();
        (examined, closed)
    }

    /// Stop every worker (daemon shutdown).
    pub async fn stop_all(&self, reason: &str) {
        let sessions: Vec<String> = self.workers.lock().keys().cloned().collect();
        for session_id in sessions {
            self.stop_session(&session_id, reason).await;
        }
    }

    // ── Registry persistence ─────────────────────────────────────────

    /// `children.json`, written whole via tmp + rename.
    fn persist_registry(&self) {
        let workers = self.list_workers();
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.children_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.children_path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&workers)?)?;
            std::fs::rename(&tmp, &self.children_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist children registry");
        }
    }

    /// Re-adopt registry entries whose processes are still alive; stale
    /// entries are dropped (their workers died with the old daemon).
    fn load_registry(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.children_path) else {
            return;
        };
        let Ok(entries) = serde_json::from_str::<Vec<WorkerHandle>>(&raw) else {
            tracing::warn!(path = %self.children_path.display(), "malformed children registry");
            return;
        };
        let mut workers = self.workers.lock();
        let mut adopted = 0usize;
        for entry in entries {
            if process_alive(entry.pid) && entry.pid != std::process::id() {
                workers.insert(entry.session_id.clone(), entry);
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::info!(adopted, "re-adopted workers from children registry");
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    false
}
