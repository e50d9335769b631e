//! Websocket connection handling: challenge issuance, the connect
//! handshake, and frame dispatch.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use ov_protocol::{
    ClientFrame, ConnectParams, ErrorCode, ServerFrame, CONNECT_CHALLENGE_EVENT, PROTOCOL_VERSION,
};

use crate::conn::{ConnPhase, Outbound};
use crate::daemon::GatewayState;
use crate::methods::{self, PostAction};

/// GET /ws — upgrade and enter the connection loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);

    let nonce = uuid::Uuid::new_v4().to_string();
    let conn_id = state.conns.register(outbound_tx, nonce.clone());

    // Writer task: forwards queued frames, closes on request.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if ws_sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // The pre-auth challenge carries a per-connection nonce.
    let challenge_seq = state.seq.advance();
    state.conns.send_to(
        conn_id,
        ServerFrame::Event {
            event: CONNECT_CHALLENGE_EVENT.to_string(),
            payload: Some(json!({ "nonce": nonce })),
            seq: challenge_seq,
        },
    );

    tracing::debug!(conn_id, "connection accepted, challenge sent");

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                handle_frame(&state, conn_id, &text).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                state.conns.touch(conn_id);
            }
            _ => {}
        }
    }

    state.conns.remove(conn_id);
    writer.abort();
    tracing::debug!(conn_id, "connection closed");
}

async fn handle_frame(state: &GatewayState, conn_id: u64, text: &str) {
    state.conns.touch(conn_id);

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.conns.send_to(
                conn_id,
                ServerFrame::err("", None, ErrorCode::InvalidRequest, &format!("bad frame: {e}")),
            );
            return;
        }
    };
    let ClientFrame::Req {
        id,
        trace_id,
        method,
        params,
    } = frame;
    let trace = trace_id.as_deref();

    if method == "connect" {
        let response = handle_connect(state, conn_id, &id, trace, params);
        state.conns.send_to(conn_id, response);
        return;
    }

    if !state.conns.is_authenticated(conn_id) {
        state.conns.send_to(
            conn_id,
            ServerFrame::err(&id, trace, ErrorCode::Unauthorized, "connect first"),
        );
        return;
    }

    let dispatched = methods::dispatch(state, conn_id, &id, trace, &method, &params).await;
    state.conns.send_to(conn_id, dispatched.response);

    // Post actions run after the response is queued so the caller sees
    // its result before any close lands.
    match dispatched.post {
        Some(PostAction::RevokeToken { old_token }) => {
            let revoked = state.conns.close_conns_with_token(
                &old_token,
                ov_protocol::CLOSE_TOKEN_ROTATED,
                ov_protocol::CLOSE_TOKEN_ROTATED_REASON,
            );
            ov_domain::trace::TraceEvent::TokenRotated {
                revoked_connections: revoked,
            }
            .emit();
        }
        Some(PostAction::StopDaemon) => {
            let cancel = state.cancel.clone();
            tokio::spawn(async move {
                // Give the response a moment to flush.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }
        None => {}
    }
}

fn handle_connect(
    state: &GatewayState,
    conn_id: u64,
    id: &str,
    trace: Option<&str>,
    params: serde_json::Value,
) -> ServerFrame {
    if state.conns.phase(conn_id) == Some(ConnPhase::Authenticated) {
        return ServerFrame::err(id, trace, ErrorCode::BadState, "already connected");
    }

    let parsed: ConnectParams = match serde_json::from_value(params) {
        Ok(parsed) => parsed,
        Err(e) => {
            return ServerFrame::err(
                id,
                trace,
                ErrorCode::InvalidRequest,
                &format!("connect params: {e}"),
            );
        }
    };

    let expected_nonce = state.conns.challenge_nonce(conn_id).unwrap_or_default();
    if parsed.challenge_nonce != expected_nonce {
        return ServerFrame::err(id, trace, ErrorCode::Unauthorized, "invalid challenge nonce");
    }
    if !state.token.verify(&parsed.auth.token) {
        return ServerFrame::err(id, trace, ErrorCode::Unauthorized, "invalid token");
    }

    state.conns.mark_authenticated(conn_id, &parsed.auth.token);
    tracing::info!(conn_id, client = %parsed.client, "connection authenticated");

    ServerFrame::ok(
        id,
        trace,
        json!({
            "protocol": PROTOCOL_VERSION,
            "server": { "name": "overseer", "version": env!("CARGO_PKG_VERSION") },
        }),
    )
}
