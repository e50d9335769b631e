//! The per-session worker process (`overseer worker`).
//!
//! The supervisor owns this process and speaks JSON lines over stdio:
//! requests on stdin, events on stdout. The worker owns its session's
//! files (events, ledger, memory) for its lifetime.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use ov_domain::config::Config;
use ov_runtime::SessionRuntime;

use crate::backend::{WorkerEvent, WorkerRequest};

/// Entry point for `overseer worker --session <id> --workspace <root>`.
pub fn worker_main(session_id: &str, workspace: &Path) -> anyhow::Result<()> {
    let mut config = Config::load(workspace)?;
    config.paths.workspace_root = workspace.to_path_buf();
    let runtime = SessionRuntime::bootstrap(Arc::new(config))?;

    runtime.start_session(session_id)?;
    // Resume from the recovery snapshot when one exists.
    if let Some(snapshot) = runtime.restore_session(session_id)? {
        tracing::info!(
            session_id,
            turn = snapshot.turn,
            "worker resumed from recovery snapshot"
        );
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable worker request");
                continue;
            }
        };

        match request {
            WorkerRequest::Send { message } => {
                run_turn(&runtime, session_id, &message, &mut stdout)?;
            }
            WorkerRequest::Stop { reason } => {
                tracing::info!(session_id, reason = %reason, "worker stopping");
                runtime.snapshot_session(session_id)?;
                runtime.shutdown_session(session_id)?;
                emit(&mut stdout, &WorkerEvent::Stopped)?;
                break;
            }
        }
    }
    Ok(())
}

fn run_turn(
    runtime: &Arc<SessionRuntime>,
    session_id: &str,
    message: &str,
    stdout: &mut impl Write,
) -> anyhow::Result<()> {
    let turn = runtime.current_turn(session_id) + 1;
    runtime.on_turn_start(session_id, turn)?;
    emit(
        stdout,
        &WorkerEvent::Event {
            event: "session.turn.start".into(),
            payload: json!({ "turn": turn }),
        },
    )?;

    let decision = runtime.build_injection(session_id, message, None, None);
    emit(
        stdout,
        &WorkerEvent::Event {
            event: "session.turn.chunk".into(),
            payload: json!({
                "turn": turn,
                "text": format!("ack: {message}"),
                "injection_tokens": decision.tokens,
            }),
        },
    )?;
    emit(
        stdout,
        &WorkerEvent::Event {
            event: "session.turn.end".into(),
            payload: json!({ "turn": turn }),
        },
    )?;
    emit(stdout, &WorkerEvent::TurnEnd)?;
    Ok(())
}

fn emit(stdout: &mut impl Write, event: &WorkerEvent) -> anyhow::Result<()> {
    let line = serde_json::to_string(event)?;
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}
