//! Patch sets: the persisted record of one mutation-tool call's file
//! changes, sufficient to restore the prior state after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Workspace-relative path.
    pub path: String,
    pub action: PatchAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
    /// Line diff for small text changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_text: Option<String>,
    /// Hex-encoded pre-mutation bytes (absent for added files).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSet {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<PatchEntry>,
}

pub fn blob_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

const DIFF_TEXT_LIMIT: usize = 4 * 1024;

/// Naive line diff for small UTF-8 contents; `None` for binary or large
/// files.
pub fn small_text_diff(before: Option<&[u8]>, after: Option<&[u8]>) -> Option<String> {
    let before = match before {
        Some(bytes) if bytes.len() <= DIFF_TEXT_LIMIT => std::str::from_utf8(bytes).ok()?,
        Some(_) => return None,
        None => "",
    };
    let after = match after {
        Some(bytes) if bytes.len() <= DIFF_TEXT_LIMIT => std::str::from_utf8(bytes).ok()?,
        Some(_) => return None,
        None => "",
    };

    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();
    let mut out = String::new();
    for line in &before_lines {
        if !after_lines.contains(line) {
            out.push_str(&format!("- {line}\n"));
        }
    }
    for line in &after_lines {
        if !before_lines.contains(line) {
            out.push_str(&format!("+ {line}\n"));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
