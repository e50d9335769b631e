//! Session backends: how the supervisor actually runs a session.
//!
//! The production backend spawns one child process per session speaking
//! JSON lines over stdio (`overseer worker`). The in-process backend
//! drives a [`SessionRuntime`] inside the daemon, used by tests and
//! `overseer run`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ov_runtime::SessionRuntime;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    SessionBusy,
    SessionNotFound,
}

impl StateErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateErrorKind::SessionBusy => "session_busy",
            StateErrorKind::SessionNotFound => "session_not_found",
        }
    }
}

/// Backend failures, mapped onto wire error codes by the method layer:
/// capacity → `bad_state` retryable, state → `bad_state` non-retryable.
#[derive(Debug)]
pub enum SessionBackendError {
    Capacity,
    State(StateErrorKind),
    Internal(String),
}

impl std::fmt::Display for SessionBackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionBackendError::Capacity => write!(f, "worker capacity exhausted"),
            SessionBackendError::State(kind) => write!(f, "{}", kind.as_str()),
            SessionBackendError::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SessionBackendError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events a worker surfaces while processing a send; the supervisor
/// forwards them as session-scoped broadcasts.
pub type EventEmitter =
    Arc<dyn Fn(&str, &str, serde_json::Value) + Send + Sync>;

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Start the session, returning the owning pid.
    async fn spawn(&self, session_id: &str) -> Result<u32, SessionBackendError>;

    /// Process one inbound message; resolves when the turn is done.
    async fn send(&self, session_id: &str, message: &str) -> Result<(), SessionBackendError>;

    /// Stop the session. `reason` is recorded, not interpreted.
    async fn stop(&self, session_id: &str, reason: &str) -> Result<(), SessionBackendError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InProcessBackend {
    runtime: Arc<SessionRuntime>,
    emitter: EventEmitter,
    busy: Mutex<std::collections::HashSet<String>>,
}

impl InProcessBackend {
    pub fn new(runtime: Arc<SessionRuntime>, emitter: EventEmitter) -> Self {
        Self {
            runtime,
            emitter,
            busy: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

#[async_trait]
impl SessionBackend for InProcessBackend {
    async fn spawn(&self, session_id: &str) -> Result<u32, SessionBackendError> {
        self.runtime
            .start_session(session_id)
            .map_err(|e| SessionBackendError::Internal(e.to_string()))?;
        Ok(std::process::id())
    }

    async fn send(&self, session_id: &str, message: &str) -> Result<(), SessionBackendError> {
        if !self.busy.lock().insert(session_id.to_string()) {
            return Err(SessionBackendError::State(StateErrorKind::SessionBusy));
        }
        let result = self.run_turn(session_id, message);
        self.busy.lock().remove(session_id);
        result
    }

    async fn stop(&self, session_id: &str, reason: &str) -> Result<(), SessionBackendError> {
        tracing::info!(session_id, reason, "stopping in-process session");
        self.runtime
            .shutdown_session(session_id)
            .map_err(|e| SessionBackendError::Internal(e.to_string()))
    }
}

impl InProcessBackend {
    fn run_turn(&self, session_id: &str, message: &str) -> Result<(), SessionBackendError> {
        let turn = self.runtime.current_turn(session_id) + 1;
        self.runtime
            .on_turn_start(session_id, turn)
            .map_err(|e| SessionBackendError::Internal(e.to_string()))?;
        (self.emitter)(session_id, "session.turn.start", json!({ "turn": turn }));

        let decision = self.runtime.build_injection(session_id, message, None, None);
        // The LLM is an external collaborator; the worker acknowledges the
        // message and surfaces the planned injection size.
        (self.emitter)(
            session_id,
            "session.turn.chunk",
            json!({
                "turn": turn,
                "text": format!("ack: {message}"),
                "injection_tokens": decision.tokens,
            }),
        );
        (self.emitter)(session_id, "session.turn.end", json!({ "turn": turn }));
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One line sent to a worker's stdin.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Send { message: String },
    Stop { reason: String },
}

/// One line read from a worker's stdout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerEvent {
    Event {
        event: String,
        payload: serde_json::Value,
    },
    TurnEnd,
    Stopped,
}

struct ChildHandle {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

/// Spawns `overseer worker --session <id>` per session and speaks JSON
/// lines over its stdio.
pub struct ProcessBackend {
    workspace_root: std::path::PathBuf,
    graceful_timeout_ms: u64,
    emitter: EventEmitter,
    children: tokio::sync::Mutex<HashMap<String, ChildHandle>>,
}

impl ProcessBackend {
    pub fn new(
        workspace_root: &std::path::Path,
        graceful_timeout_ms: u64,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            graceful_timeout_ms,
            emitter,
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionBackend for ProcessBackend {
    async fn spawn(&self, session_id: &str) -> Result<u32, SessionBackendError> {
        let exe = std::env::current_exe()
            .map_err(|e| SessionBackendError::Internal(format!("current_exe: {e}")))?;
        let mut child = tokio::process::Command::new(exe)
            .arg("worker")
            .arg("--session")
            .arg(session_id)
            .arg("--workspace")
            .arg(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionBackendError::Internal(format!("spawn worker: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| SessionBackendError::Internal("worker exited at spawn".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionBackendError::Internal("no worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| SessionBackendError::Internal("no worker stdout".into()))?;

        self.children.lock().await.insert(
            session_id.to_string(),
            ChildHandle {
                child,
                stdin,
                stdout,
            },
        );
        tracing::info!(session_id, pid, "worker spawned");
        Ok(pid)
    }

    async fn send(&self, session_id: &str, message: &str) -> Result<(), SessionBackendError> {
        let mut children = self.children.lock().await;
        let handle = children
            .get_mut(session_id)
            .ok_or(SessionBackendError::State(StateErrorKind::SessionNotFound))?;

        let request = serde_json::to_string(&WorkerRequest::Send {
            message: message.to_string(),
        })
        .map_err(|e| SessionBackendError::Internal(e.to_string()))?;
        handle
            .stdin
            .write_all(format!("{request}\n").as_bytes())
            .await
            .map_err(|e| SessionBackendError::Internal(format!("worker stdin: {e}")))?;

        // Forward worker events until the turn completes.
        let mut line = String::new();
        loop {
            line.clear();
            let read = handle
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| SessionBackendError::Internal(format!("worker stdout: {e}")))?;
            if read == 0 {
                return Err(SessionBackendError::Internal("worker closed stdout".into()));
            }
            match serde_json::from_str::<WorkerEvent>(line.trim()) {
                Ok(WorkerEvent::Event { event, payload }) => {
                    (self.emitter)(session_id, &event, payload);
                }
                Ok(WorkerEvent::TurnEnd) => return Ok(()),
                Ok(WorkerEvent::Stopped) => {
                    return Err(SessionBackendError::State(StateErrorKind::SessionNotFound))
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable worker line");
                }
            }
        }
    }

    async fn stop(&self, session_id: &str, reason: &str) -> Result<(), SessionBackendError> {
        let Some(mut handle) = self.children.lock().await.remove(session_id) else {
            return Err(SessionBackendError::State(StateErrorKind::SessionNotFound));
        };

        let request = serde_json::to_string(&WorkerRequest::Stop {
            reason: reason.to_string(),
        })
        .map_err(|e| SessionBackendError::Internal(e.to_string()))?;
        // A worker that already died still counts as stopped.
        let _ = handle
            .stdin
            .write_all(format!("{request}\n").as_bytes())
            .await;

        let grace = std::time::Duration::from_millis(self.graceful_timeout_ms);
        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(session_id, "worker ignored graceful stop; killing");
                let _ = handle.child.kill().await;
            }
        }
        tracing::info!(session_id, reason, "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ov_domain::config::Config;
    use parking_lot::Mutex as PMutex;

    fn in_process() -> (tempfile::TempDir, InProcessBackend, Arc<PMutex<Vec<String>>>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.workspace_root = dir.path().to_path_buf();
        let runtime = SessionRuntime::bootstrap(Arc::new(config)).unwrap();
        let seen: Arc<PMutex<Vec<String>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let backend = InProcessBackend::new(
            runtime,
            Arc::new(move |_, event, _| sink.lock().push(event.to_string())),
        );
        (dir, backend, seen)
    }

    #[tokio::test]
    async fn turn_emits_start_chunk_end() {
        let (_dir, backend, seen) = in_process();
        backend.spawn("s1").await.unwrap();
        backend.send("s1", "hello").await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                "session.turn.start".to_string(),
                "session.turn.chunk".to_string(),
                "session.turn.end".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn stop_then_send_still_works_from_turn_one() {
        let (_dir, backend, _) = in_process();
        backend.spawn("s1").await.unwrap();
        backend.send("s1", "a").await.unwrap();
        backend.stop("s1", "test").await.unwrap();
        // Shutdown cleared volatile state; a new spawn restarts turns.
        backend.spawn("s1").await.unwrap();
        backend.send("s1", "b").await.unwrap();
    }
}
