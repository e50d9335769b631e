//! End-to-end websocket protocol tests against a daemon on an ephemeral
//! loopback port with the in-process worker backend.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ov_domain::config::{Config, WorkerBackendKind};
use ov_gateway::daemon::{start_daemon, RunningDaemon};
use ov_protocol::{ServerFrame, CONNECT_CHALLENGE_EVENT, PROTOCOL_VERSION};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DEADLINE: Duration = Duration::from_secs(5);

async fn spawn_daemon(mutate: impl FnOnce(&mut Config)) -> (tempfile::TempDir, RunningDaemon) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.paths.workspace_root = dir.path().to_path_buf();
    config.gateway.port = 0;
    config.gateway.backend = WorkerBackendKind::InProcess;
    mutate(&mut config);
    let daemon = start_daemon(Arc::new(config)).await.unwrap();
    (dir, daemon)
}

async fn connect_raw(daemon: &RunningDaemon) -> (Socket, String) {
    let url = format!("ws://{}/ws", daemon.addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let nonce = loop {
        let message = next_message(&mut socket).await.expect("challenge");
        if let Message::Text(text) = message {
            if let Ok(ServerFrame::Event { event, payload, .. }) = serde_json::from_str(&text) {
                if event == CONNECT_CHALLENGE_EVENT {
                    break payload.unwrap()["nonce"].as_str().unwrap().to_string();
                }
            }
        }
    };
    (socket, nonce)
}

async fn next_message(socket: &mut Socket) -> Option<Message> {
    tokio::time::timeout(DEADLINE, socket.next())
        .await
        .ok()
        .flatten()
        .and_then(|r| r.ok())
}

/// Send one request and read frames until its response arrives; any
/// event frames seen on the way are returned too.
async fn request(
    socket: &mut Socket,
    id: &str,
    trace_id: Option<&str>,
    method: &str,
    params: Value,
) -> (Value, Vec<Value>) {
    let frame = json!({
        "type": "req",
        "id": id,
        "traceId": trace_id,
        "method": method,
        "params": params,
    });
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        let message = next_message(socket).await.expect("response");
        let Message::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        match value["type"].as_str() {
            Some("res") if value["id"] == id => return (value, events),
            Some("event") => events.push(value),
            _ => {}
        }
    }
}

async fn authenticate(socket: &mut Socket, nonce: &str, token: &str) -> Value {
    let (res, _) = request(
        socket,
        "connect-1",
        None,
        "connect",
        json!({
            "protocol": PROTOCOL_VERSION,
            "client": "test-client/1.0",
            "auth": { "token": token },
            "challengeNonce": nonce,
        }),
    )
    .await;
    res
}

async fn connected_client(daemon: &RunningDaemon) -> Socket {
    let token = daemon.state.token.current();
    let (mut socket, nonce) = connect_raw(daemon).await;
    let res = authenticate(&mut socket, &nonce, &token).await;
    assert_eq!(res["ok"], true, "handshake failed: {res}");
    socket
}

/// Wait for a specific event on the socket.
async fn expect_event(socket: &mut Socket, name: &str) -> Value {
    loop {
        let message = next_message(socket).await.unwrap_or_else(|| {
            panic!("did not receive event {name} before the deadline")
        });
        let Message::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "event" && value["event"] == name {
            return value;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn methods_before_connect_are_unauthorized() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let (mut socket, _nonce) = connect_raw(&daemon).await;

    let (res, _) = request(&mut socket, "r1", None, "health", json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "unauthorized");

    daemon.stop().await;
}

#[tokio::test]
async fn connect_with_wrong_token_fails() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let (mut socket, nonce) = connect_raw(&daemon).await;

    let res = authenticate(&mut socket, &nonce, "not-the-token").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "unauthorized");
    assert_eq!(res["error"]["message"], "[unauthorized] invalid token");

    daemon.stop().await;
}

#[tokio::test]
async fn connect_with_wrong_nonce_fails() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let token = daemon.state.token.current();
    let (mut socket, _nonce) = connect_raw(&daemon).await;

    let res = authenticate(&mut socket, "stale-nonce", &token).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "unauthorized");

    daemon.stop().await;
}

#[tokio::test]
async fn repeated_connect_is_bad_state() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let token = daemon.state.token.current();
    let (mut socket, nonce) = connect_raw(&daemon).await;

    let first = authenticate(&mut socket, &nonce, &token).await;
    assert_eq!(first["ok"], true);
    assert_eq!(first["payload"]["protocol"], PROTOCOL_VERSION);

    let second = authenticate(&mut socket, &nonce, &token).await;
    assert_eq!(second["ok"], false);
    assert_eq!(second["error"]["code"], "bad_state");

    daemon.stop().await;
}

#[tokio::test]
async fn trace_id_is_echoed_verbatim() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    let (res, _) = request(&mut socket, "r9", Some("trace-xyz"), "health", json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["traceId"], "trace-xyz");
    assert_eq!(res["payload"]["ok"], true);

    daemon.stop().await;
}

#[tokio::test]
async fn invalid_params_and_unknown_methods() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    let (res, _) = request(&mut socket, "r1", None, "sessions.send", json!({})).await;
    assert_eq!(res["error"]["code"], "invalid_request");

    let (res, _) = request(&mut socket, "r2", None, "no.such.method", json!({})).await;
    assert_eq!(res["error"]["code"], "not_found");

    daemon.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token rotation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn rotation_revokes_peers_and_old_token() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let old_token = daemon.state.token.current();

    let mut caller = connected_client(&daemon).await;
    let mut peer = connected_client(&daemon).await;

    let (res, _) = request(&mut caller, "rot-1", None, "gateway.rotate-token", json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["rotated"], true);
    assert!(res["payload"]["revokedConnections"].as_u64().unwrap() >= 1);

    // Both sockets close with 1008 / "auth token rotated".
    for socket in [&mut caller, &mut peer] {
        let close = loop {
            match next_message(socket).await {
                Some(Message::Close(frame)) => break frame,
                Some(_) => continue,
                None => panic!("socket did not close after rotation"),
            }
        };
        let frame = close.expect("close frame with code");
        assert_eq!(u16::from(frame.code), 1008);
        assert_eq!(frame.reason, "auth token rotated");
        assert_eq!(frame.code, CloseCode::Policy);
    }

    // The old token no longer authenticates.
    let (mut stale, nonce) = connect_raw(&daemon).await;
    let res = authenticate(&mut stale, &nonce, &old_token).await;
    assert_eq!(res["error"]["message"], "[unauthorized] invalid token");

    // The token file holds the new token, which does.
    let token_file = daemon.state.paths.token_path.clone();
    let new_token = std::fs::read_to_string(token_file).unwrap().trim().to_string();
    assert_ne!(new_token, old_token);
    let (mut fresh, nonce) = connect_raw(&daemon).await;
    let res = authenticate(&mut fresh, &nonce, &new_token).await;
    assert_eq!(res["ok"], true);

    daemon.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broadcast & scoping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn broadcast_events_share_one_seq() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut a = connected_client(&daemon).await;
    let mut b = connected_client(&daemon).await;
    let mut opener = connected_client(&daemon).await;

    request(
        &mut opener,
        "open-1",
        None,
        "sessions.open",
        json!({ "sessionId": "sess-broadcast" }),
    )
    .await;

    let event_a = expect_event(&mut a, "gateway.session.opened").await;
    let event_b = expect_event(&mut b, "gateway.session.opened").await;
    assert_eq!(event_a["seq"], event_b["seq"]);
    assert_eq!(event_a["payload"]["sessionId"], "sess-broadcast");

    daemon.stop().await;
}

#[tokio::test]
async fn session_events_are_isolated_to_subscribers() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut a = connected_client(&daemon).await;
    let mut b = connected_client(&daemon).await;

    // B watches a different session.
    let (res, _) = request(
        &mut b,
        "sub-1",
        None,
        "sessions.subscribe",
        json!({ "sessionId": "session-B" }),
    )
    .await;
    assert_eq!(res["ok"], true);

    // A sends into session-A; auto-subscribe delivers the turn events.
    let (res, events) = request(
        &mut a,
        "send-1",
        None,
        "sessions.send",
        json!({ "sessionId": "session-A", "message": "hello" }),
    )
    .await;
    assert_eq!(res["ok"], true, "send failed: {res}");
    assert_eq!(res["payload"]["delivered"], true);
    let names: Vec<&str> = events
        .iter()
        .filter_map(|e| e["event"].as_str())
        .collect();
    assert!(names.contains(&"session.turn.start"), "events: {names:?}");
    assert!(names.contains(&"session.turn.end"));

    // B must not see session-A's events. Drain B briefly; only the
    // gateway.session.opened broadcast is acceptable.
    let leaked = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match b.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "event"
                        && value["event"].as_str().unwrap_or("").starts_with("session.")
                    {
                        return value;
                    }
                }
                _ => continue,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "subscriber of session-B saw session-A events: {leaked:?}");

    // Subscribers of the same session observe identical seq values.
    let (_, _) = request(
        &mut b,
        "sub-2",
        None,
        "sessions.subscribe",
        json!({ "sessionId": "session-A" }),
    )
    .await;
    let (_, events_a) = request(
        &mut a,
        "send-2",
        None,
        "sessions.send",
        json!({ "sessionId": "session-A", "message": "again" }),
    )
    .await;
    let start_a = events_a
        .iter()
        .find(|e| e["event"] == "session.turn.start")
        .expect("sender sees turn start");
    let start_b = expect_event(&mut b, "session.turn.start").await;
    assert_eq!(start_a["seq"], start_b["seq"]);

    daemon.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn worker_capacity_maps_to_retryable_bad_state() {
    let (_dir, daemon) = spawn_daemon(|config| {
        config.gateway.max_workers = 1;
    })
    .await;
    let mut socket = connected_client(&daemon).await;

    let (res, _) = request(
        &mut socket,
        "o1",
        None,
        "sessions.open",
        json!({ "sessionId": "s1" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["created"], true);

    let (res, _) = request(
        &mut socket,
        "o2",
        None,
        "sessions.open",
        json!({ "sessionId": "s2" }),
    )
    .await;
    assert_eq!(res["error"]["code"], "bad_state");
    assert_eq!(res["error"]["retryable"], true);

    // Reopening the existing session is fine and not "created".
    let (res, _) = request(
        &mut socket,
        "o3",
        None,
        "sessions.open",
        json!({ "sessionId": "s1" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["created"], false);

    daemon.stop().await;
}

#[tokio::test]
async fn close_reports_whether_a_worker_existed() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    request(&mut socket, "o1", None, "sessions.open", json!({ "sessionId": "s1" })).await;

    let (res, _) = request(
        &mut socket,
        "c1",
        None,
        "sessions.close",
        json!({ "sessionId": "s1" }),
    )
    .await;
    assert_eq!(res["payload"]["closed"], true);

    let (res, _) = request(
        &mut socket,
        "c2",
        None,
        "sessions.close",
        json!({ "sessionId": "s1" }),
    )
    .await;
    assert_eq!(res["payload"]["closed"], false);

    daemon.stop().await;
}

#[tokio::test]
async fn health_and_status_deep_report_workers() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    request(&mut socket, "o1", None, "sessions.open", json!({ "sessionId": "s1" })).await;

    let (health, _) = request(&mut socket, "h1", None, "health", json!({})).await;
    assert_eq!(health["payload"]["ok"], true);
    assert_eq!(health["payload"]["workers"], 1);

    let (status, _) = request(&mut socket, "d1", None, "status.deep", json!({})).await;
    let workers = status["payload"]["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["session_id"], "s1");

    daemon.stop().await;
}

#[tokio::test]
async fn heartbeat_reload_closes_orphaned_default_sessions() {
    let (dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    // Open the default session of a rule that is about to disappear.
    request(
        &mut socket,
        "o1",
        None,
        "sessions.open",
        json!({ "sessionId": "heartbeat:doomed" }),
    )
    .await;

    std::fs::write(dir.path().join("HEARTBEAT.md"), "## doomed\n").unwrap();
    let (res, _) = request(&mut socket, "hb1", None, "heartbeat.reload", json!({})).await;
    assert_eq!(res["payload"]["rules"], 1);

    // Now remove the rule; its default session closes.
    std::fs::write(dir.path().join("HEARTBEAT.md"), "# empty\n").unwrap();
    let (res, _) = request(&mut socket, "hb2", None, "heartbeat.reload", json!({})).await;
    assert_eq!(res["payload"]["rules"], 0);
    assert_eq!(
        res["payload"]["closedSessions"],
        json!(["heartbeat:doomed"])
    );

    let (health, _) = request(&mut socket, "h1", None, "health", json!({})).await;
    assert_eq!(health["payload"]["workers"], 0);

    daemon.stop().await;
}

#[tokio::test]
async fn gateway_stop_shuts_the_daemon_down() {
    let (_dir, daemon) = spawn_daemon(|_| {}).await;
    let mut socket = connected_client(&daemon).await;

    let (res, _) = request(&mut socket, "stop-1", None, "gateway.stop", json!({})).await;
    assert_eq!(res["payload"]["stopping"], true);

    // The serve task winds down on its own.
    tokio::time::timeout(DEADLINE, daemon.handle)
        .await
        .expect("daemon did not stop")
        .unwrap();
}
