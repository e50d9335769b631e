//! Gateway wire protocol: JSON frames over a loopback websocket.
//!
//! Three frame shapes travel the wire:
//!
//! - Event: `{type:"event", event:<name>, payload?, seq:<u64>}`
//! - Request: `{type:"req", id, traceId?, method, params}`
//! - Response: `{type:"res", id, traceId?, ok, payload?|error?}`
//!
//! `traceId` is echoed verbatim on the response.

use serde::{Deserialize, Serialize};

/// Protocol revision sent by clients in `connect`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Event name of the pre-auth challenge the server sends on accept.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";

/// Websocket close code used when the auth token is rotated away.
pub const CLOSE_TOKEN_ROTATED: u16 = 1008;
pub const CLOSE_TOKEN_ROTATED_REASON: &str = "auth token rotated";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        seq: u64,
    },
    #[serde(rename = "res")]
    Res {
        id: String,
        #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

/// Frames clients send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "req")]
    Req {
        id: String,
        #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// Stable error codes of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    BadState,
    InvalidRequest,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::BadState => "bad_state",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
        }
    }
}

impl ServerFrame {
    pub fn ok(id: &str, trace_id: Option<&str>, payload: serde_json::Value) -> Self {
        ServerFrame::Res {
            id: id.to_string(),
            trace_id: trace_id.map(str::to_string),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, trace_id: Option<&str>, code: ErrorCode, message: &str) -> Self {
        Self::err_retryable(id, trace_id, code, message, None)
    }

    pub fn err_retryable(
        id: &str,
        trace_id: Option<&str>,
        code: ErrorCode,
        message: &str,
        retryable: Option<bool>,
    ) -> Self {
        ServerFrame::Res {
            id: id.to_string(),
            trace_id: trace_id.map(str::to_string),
            ok: false,
            payload: None,
            error: Some(WireError {
                code,
                message: format!("[{}] {message}", code.as_str()),
                retryable,
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connect params
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub protocol: u32,
    pub client: String,
    pub auth: ConnectAuth,
    #[serde(rename = "challengeNonce")]
    pub challenge_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    pub token: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Callback payload codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A channel-frontend callback reference: which action on which session.
/// Encoded as `kind:session:id`; round-trips exactly for ids that contain
/// no `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    pub kind: String,
    pub session_id: String,
    pub id: String,
}

pub fn encode_callback(payload: &CallbackPayload) -> String {
    format!("{}:{}:{}", payload.kind, payload.session_id, payload.id)
}

pub fn decode_callback(raw: &str) -> Option<CallbackPayload> {
    let mut parts = raw.splitn(3, ':');
    let kind = parts.next()?.to_string();
    let session_id = parts.next()?.to_string();
    let id = parts.next()?.to_string();
    if kind.is_empty() || session_id.is_empty() {
        return None;
    }
    Some(CallbackPayload {
        kind,
        session_id,
        id,
    })
}
