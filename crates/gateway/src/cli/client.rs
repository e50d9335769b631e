//! Minimal websocket client used by `overseer stop|status|rotate-token`:
//! connects to the local daemon, completes the challenge handshake, and
//! issues one request.

use std::path::Path;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ov_protocol::{ClientFrame, ServerFrame, CONNECT_CHALLENGE_EVENT, PROTOCOL_VERSION};

use crate::cli::pid;
use crate::daemon::DaemonPaths;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Call one method on the running daemon, returning its payload.
pub async fn call(state_dir: &Path, method: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
    let paths = DaemonPaths::new(state_dir);
    let record = pid::read_pid_file(&paths.pid_path)
        .context("no running daemon (pid file missing or unreadable)")?;
    let token = std::fs::read_to_string(&paths.token_path)
        .context("reading token file")?
        .trim()
        .to_string();

    let url = format!("ws://127.0.0.1:{}/ws", record.port);
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {url}"))?;

    // 1. Receive the challenge.
    let nonce = loop {
        let message = socket
            .next()
            .await
            .context("daemon closed before challenge")??;
        if let Message::Text(text) = message {
            if let Ok(ServerFrame::Event { event, payload, .. }) = serde_json::from_str(&text) {
                if event == CONNECT_CHALLENGE_EVENT {
                    break payload
                        .and_then(|p| p.get("nonce").and_then(|n| n.as_str()).map(str::to_string))
                        .context("challenge without nonce")?;
                }
            }
        }
    };

    // 2. Authenticate.
    let connect_payload = request(
        &mut socket,
        "connect",
        json!({
            "protocol": PROTOCOL_VERSION,
            "client": format!("overseer-cli/{}", env!("CARGO_PKG_VERSION")),
            "auth": { "token": token },
            "challengeNonce": nonce,
        }),
    )
    .await?;
    tracing::debug!(payload = %connect_payload, "authenticated");

    // 3. The actual call.
    request(&mut socket, method, params).await
}

async fn request(
    socket: &mut Socket,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let id = uuid::Uuid::new_v4().to_string();
    let frame = ClientFrame::Req {
        id: id.clone(),
        trace_id: None,
        method: method.to_string(),
        params,
    };
    socket
        .send(Message::Text(serde_json::to_string(&frame)?))
        .await?;

    loop {
        let message = match socket.next().await {
            Some(message) => message?,
            None => anyhow::bail!("connection closed awaiting response to {method}"),
        };
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Res {
                id: res_id,
                ok,
                payload,
                error,
                ..
            }) if res_id == id => {
                if ok {
                    return Ok(payload.unwrap_or(serde_json::Value::Null));
                }
                let message = error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown error".into());
                anyhow::bail!("{method} failed: {message}");
            }
            _ => {}
        }
    }
}
