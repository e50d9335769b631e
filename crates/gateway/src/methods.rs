//! Post-auth method dispatch.

use serde_json::json;

use ov_protocol::{ErrorCode, ServerFrame};

use crate::backend::SessionBackendError;
use crate::daemon::GatewayState;

/// Work to perform after the response frame is queued.
pub enum PostAction {
    RevokeToken { old_token: String },
    StopDaemon,
}

pub struct Dispatched {
    pub response: ServerFrame,
    pub post: Option<PostAction>,
}

impl Dispatched {
    fn reply(response: ServerFrame) -> Self {
        Self {
            response,
            post: None,
        }
    }
}

pub async fn dispatch(
    state: &GatewayState,
    conn_id: u64,
    id: &str,
    trace: Option<&str>,
    method: &str,
    params: &serde_json::Value,
) -> Dispatched {
    match method {
        "health" => health(state, id, trace),
        "status.deep" => status_deep(state, id, trace),
        "heartbeat.reload" => heartbeat_reload(state, id, trace).await,
        "sessions.open" => sessions_open(state, id, trace, params).await,
        "sessions.close" => sessions_close(state, id, trace, params).await,
        "sessions.send" => sessions_send(state, conn_id, id, trace, params).await,
        "sessions.subscribe" => sessions_subscribe(state, conn_id, id, trace, params, true),
        "sessions.unsubscribe" => sessions_subscribe(state, conn_id, id, trace, params, false),
        "gateway.rotate-token" => rotate_token(state, id, trace),
        "gateway.stop" => Dispatched {
            response: ServerFrame::ok(id, trace, json!({ "stopping": true })),
            post: Some(PostAction::StopDaemon),
        },
        other => Dispatched::reply(ServerFrame::err(
            id,
            trace,
            ErrorCode::NotFound,
            &format!("unknown method: {other}"),
        )),
    }
}

// ── Individual methods ───────────────────────────────────────────────

fn health(state: &GatewayState, id: &str, trace: Option<&str>) -> Dispatched {
    let uptime_ms = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_milliseconds();
    Dispatched::reply(ServerFrame::ok(
        id,
        trace,
        json!({
            "ok": true,
            "uptimeMs": uptime_ms,
            "workers": state.supervisor.worker_count(),
            "connections": state.conns.connection_count(),
        }),
    ))
}

fn status_deep(state: &GatewayState, id: &str, trace: Option<&str>) -> Dispatched {
    let workers = state.supervisor.list_workers();
    Dispatched::reply(ServerFrame::ok(
        id,
        trace,
        json!({
            "workers": workers,
            "connections": state.conns.connection_count(),
            "seq": state.seq.current(),
            "heartbeatRules": state.heartbeat.rule_count(),
            "startedAt": state.started_at.to_rfc3339(),
        }),
    ))
}

async fn heartbeat_reload(state: &GatewayState, id: &str, trace: Option<&str>) -> Dispatched {
    let diff = state.heartbeat.reload();
    let mut closed = Vec::new();
    for session_id in &diff.sessions_to_close {
        if state
            .supervisor
            .stop_session(session_id, "heartbeat_removed")
            .await
        {
            closed.push(session_id.clone());
        }
    }
    ov_domain::trace::TraceEvent::HeartbeatReloaded {
        rules: diff.rules,
        removed: diff.removed.len(),
        closed_sessions: closed.len(),
    }
    .emit();
    Dispatched::reply(ServerFrame::ok(
        id,
        trace,
        json!({
            "rules": diff.rules,
            "added": diff.added,
            "removed": diff.removed.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            "closedSessions": closed,
        }),
    ))
}

async fn sessions_open(
    state: &GatewayState,
    id: &str,
    trace: Option<&str>,
    params: &serde_json::Value,
) -> Dispatched {
    let session_id = match optional_str(params, "sessionId") {
        Ok(Some(session_id)) => session_id.to_string(),
        Ok(None) => uuid::Uuid::new_v4().to_string(),
        Err(frame) => return Dispatched::reply(frame(id, trace)),
    };

    match state.supervisor.open_session(&session_id).await {
        Ok((worker, created)) => {
            if created {
                state
                    .conns
                    .broadcast("gateway.session.opened", Some(json!({ "sessionId": session_id })));
            }
            Dispatched::reply(ServerFrame::ok(
                id,
                trace,
                json!({ "sessionId": session_id, "created": created, "pid": worker.pid }),
            ))
        }
        Err(e) => Dispatched::reply(backend_error(id, trace, e)),
    }
}

async fn sessions_close(
    state: &GatewayState,
    id: &str,
    trace: Option<&str>,
    params: &serde_json::Value,
) -> Dispatched {
    let session_id = match required_str(params, "sessionId") {
        Ok(session_id) => session_id.to_string(),
        Err(frame) => return Dispatched::reply(frame(id, trace)),
    };
    let closed = state
        .supervisor
        .stop_session(&session_id, "remote_close")
        .await;
    Dispatched::reply(ServerFrame::ok(
        id,
        trace,
        json!({ "sessionId": session_id, "closed": closed }),
    ))
}

async fn sessions_send(
    state: &GatewayState,
    conn_id: u64,
    id: &str,
    trace: Option<&str>,
    params: &serde_json::Value,
) -> Dispatched {
    let session_id = match required_str(params, "sessionId") {
        Ok(session_id) => session_id.to_string(),
        Err(frame) => return Dispatched::reply(frame(id, trace)),
    };
    let message = match required_str(params, "message") {
        Ok(message) => message.to_string(),
        Err(frame) => return Dispatched::reply(frame(id, trace)),
    };

    // The sender always observes its own session's events.
    state.conns.subscribe(conn_id, &session_id);

    match state.supervisor.send(&session_id, &message).await {
        Ok(()) => Dispatched::reply(ServerFrame::ok(
            id,
            trace,
            json!({ "sessionId": session_id, "delivered": true }),
        )),
        Err(e) => Dispatched::reply(backend_error(id, trace, e)),
    }
}

fn sessions_subscribe(
    state: &GatewayState,
    conn_id: u64,
    id: &str,
    trace: Option<&str>,
    params: &serde_json::Value,
    subscribe: bool,
) -> Dispatched {
    let session_id = match required_str(params, "sessionId") {
        Ok(session_id) => session_id.to_string(),
        Err(frame) => return Dispatched::reply(frame(id, trace)),
    };
    if subscribe {
        state.conns.subscribe(conn_id, &session_id);
    } else {
        state.conns.unsubscribe(conn_id, &session_id);
    }
    Dispatched::reply(ServerFrame::ok(
        id,
        trace,
        json!({ "subscribed": state.conns.subscriptions(conn_id) }),
    ))
}

fn rotate_token(state: &GatewayState, id: &str, trace: Option<&str>) -> Dispatched {
    match state.token.rotate() {
        Ok((old, _new)) => {
            // Count how many connections will be revoked for the
            // response; the actual closes happen post-response.
            let response = ServerFrame::ok(id, trace, json!({ "rotated": true }));
            Dispatched {
                response: with_revoked_count(response, state, &old),
                post: Some(PostAction::RevokeToken { old_token: old }),
            }
        }
        Err(e) => Dispatched::reply(ServerFrame::err(
            id,
            trace,
            ErrorCode::Internal,
            &format!("token rotation failed: {e}"),
        )),
    }
}

fn with_revoked_count(frame: ServerFrame, state: &GatewayState, old_token: &str) -> ServerFrame {
    let count = state.conns.count_conns_with_token(old_token);
    match frame {
        ServerFrame::Res {
            id,
            trace_id,
            ok,
            mut payload,
            error,
        } => {
            if let Some(serde_json::Value::Object(map)) = payload.as_mut() {
                map.insert("revokedConnections".into(), json!(count));
            }
            ServerFrame::Res {
                id,
                trace_id,
                ok,
                payload,
                error,
            }
        }
        other => other,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

type FrameBuilder = Box<dyn Fn(&str, Option<&str>) -> ServerFrame>;

fn required_str<'a>(
    params: &'a serde_json::Value,
    key: &'static str,
) -> std::result::Result<&'a str, FrameBuilder> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Box::new(move |id, trace| {
            ServerFrame::err(
                id,
                trace,
                ErrorCode::InvalidRequest,
                &format!("missing string param: {key}"),
            )
        })),
    }
}

fn optional_str<'a>(
    params: &'a serde_json::Value,
    key: &'static str,
) -> std::result::Result<Option<&'a str>, FrameBuilder> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(value)) if !value.is_empty() => Ok(Some(value.as_str())),
        _ => Err(Box::new(move |id, trace| {
            ServerFrame::err(
                id,
                trace,
                ErrorCode::InvalidRequest,
                &format!("invalid param: {key}"),
            )
        })),
    }
}

fn backend_error(id: &str, trace: Option<&str>, error: SessionBackendError) -> ServerFrame {
    match error {
        SessionBackendError::Capacity => ServerFrame::err_retryable(
            id,
            trace,
            ErrorCode::BadState,
            "worker capacity exhausted",
            Some(true),
        ),
        SessionBackendError::State(kind) => {
            ServerFrame::err_retryable(id, trace, ErrorCode::BadState, kind.as_str(), Some(false))
        }
        SessionBackendError::Internal(message) => {
            ServerFrame::err(id, trace, ErrorCode::Internal, &message)
        }
    }
}
