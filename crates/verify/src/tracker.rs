//! The file change tracker.
//!
//! Every mutation-tool call is bracketed by `track_start` (byte snapshot
//! of the paths it may touch) and `track_end` (diff + persisted patch
//! set). `rollback_last` restores the most recent patch set with an
//! all-or-nothing commit: every restore is staged to a temp file first,
//! then renamed into place, so a failure never leaves a partial restore.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;

use ov_domain::error::{Error, Result};

use crate::patchset::{blob_hash, small_text_diff, PatchAction, PatchEntry, PatchSet};

/// Outcome of [`FileChangeTracker::rollback_last`].
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub ok: bool,
    /// `no_patchset` or `restore_failed` when not ok.
    pub reason: Option<String>,
    pub restored_paths: Vec<String>,
}

struct Capture {
    rel_path: String,
    before: Option<Vec<u8>>,
}

struct PendingTrack {
    session_id: String,
    tool_name: String,
    captures: Vec<Capture>,
}

pub struct FileChangeTracker {
    workspace_root: PathBuf,
    snapshots_dir: PathBuf,
    pending: Mutex<HashMap<String, PendingTrack>>,
    /// Orders patch sets created within the same millisecond.
    seq: std::sync::atomic::AtomicU64,
}

impl FileChangeTracker {
    pub fn new(workspace_root: &Path, snapshots_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(snapshots_dir).map_err(Error::Io)?;
        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            snapshots_dir: snapshots_dir.to_path_buf(),
            pending: Mutex::new(HashMap::new()),
            seq: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Snapshot the current bytes of each path before a mutation tool
    /// runs. Paths escaping the workspace are rejected here, at capture
    /// time.
    pub fn track_start(
        &self,
        session_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        paths: &[String],
    ) -> Result<()> {
        let mut captures = Vec::with_capacity(paths.len());
        for raw in paths {
            let rel = sanitize_rel_path(raw)
                .ok_or_else(|| Error::Policy(format!("path escapes workspace: {raw}")))?;
            let abs = self.workspace_root.join(&rel);
            let before = match std::fs::read(&abs) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(Error::Io(e)),
            };
            captures.push(Capture {
                rel_path: rel,
                before,
            });
        }

        self.pending.lock().insert(
            tool_call_id.to_string(),
            PendingTrack {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                captures,
            },
        );
        Ok(())
    }

    /// Close out a tracked call. On success a patch set of the observed
    /// changes is produced and persisted; on failure the capture is
    /// discarded.
    pub fn track_end(&self, tool_call_id: &str, success: bool) -> Result<Option<PatchSet>> {
        let Some(pending) = self.pending.lock().remove(tool_call_id) else {
            return Ok(None);
        };
        if !success {
            return Ok(None);
        }

        let mut entries = Vec::new();
        for capture in &pending.captures {
            let abs = self.workspace_root.join(&capture.rel_path);
            let after = match std::fs::read(&abs) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(Error::Io(e)),
            };

            let action = match (&capture.before, &after) {
                (None, Some(_)) => PatchAction::Add,
                (Some(_), None) => PatchAction::Delete,
                (Some(b), Some(a)) if b != a => PatchAction::Modify,
                _ => continue,
            };

            entries.push(PatchEntry {
                path: capture.rel_path.clone(),
                action,
                before_hash: capture.before.as_deref().map(blob_hash),
                after_hash: after.as_deref().map(blob_hash),
                diff_text: small_text_diff(capture.before.as_deref(), after.as_deref()),
                before_blob: capture.before.as_ref().map(hex::encode),
            });
        }

        if entries.is_empty() {
            return Ok(None);
        }

        let patch_set = PatchSet {
            id: format!(
                "{:013}-{:06}-{}",
                Utc::now().timestamp_millis(),
                self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            session_id: pending.session_id.clone(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: pending.tool_name.clone(),
            created_at: Utc::now(),
            entries,
        };
        self.persist(&patch_set)?;
        Ok(Some(patch_set))
    }

    /// Patch sets for a session, oldest first.
    pub fn list_patch_sets(&self, session_id: &str) -> Result<Vec<PatchSet>> {
        let dir = self.snapshots_dir.join(session_id);
        let mut sets = Vec::new();
        if !dir.exists() {
            return Ok(sets);
        }
        for entry in std::fs::read_dir(&dir).map_err(Error::Io)? {
            let path = entry.map_err(Error::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snap") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            match serde_json::from_str::<PatchSet>(&raw) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed patch set");
                }
            }
        }
        sets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sets)
    }

    /// Restore the most recent patch set: delete added files, restore
    /// modified/deleted bytes. All-or-nothing; a failed restore returns
    /// `restore_failed` without touching any file.
    pub fn rollback_last(&self, session_id: &str) -> RollbackOutcome {
        let sets = match self.list_patch_sets(session_id) {
            Ok(sets) => sets,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list patch sets");
                return RollbackOutcome {
                    ok: false,
                    reason: Some("restore_failed".into()),
                    restored_paths: Vec::new(),
                };
            }
        };
        let Some(latest) = sets.last() else {
            return RollbackOutcome {
                ok: false,
                reason: Some("no_patchset".into()),
                restored_paths: Vec::new(),
            };
        };

        match self.apply_rollback(latest) {
            Ok(restored) => {
                // Retire the applied patch set.
                let path = self.patch_path(&latest.session_id, &latest.id);
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove applied patch set");
                }
                RollbackOutcome {
                    ok: true,
                    reason: None,
                    restored_paths: restored,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, session_id, "rollback failed");
                RollbackOutcome {
                    ok: false,
                    reason: Some("restore_failed".into()),
                    restored_paths: Vec::new(),
                }
            }
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    fn apply_rollback(&self, set: &PatchSet) -> Result<Vec<String>> {
        // Stage phase: write every restored content to a temp sibling.
        // Nothing in the workspace changes until all stages succeed.
        struct Staged {
            tmp: PathBuf,
            target: PathBuf,
        }
        let mut staged: Vec<Staged> = Vec::new();
        let mut deletions: Vec<PathBuf> = Vec::new();
        let cleanup = |staged: &[Staged]| {
            for s in staged {
                let _ = std::fs::remove_file(&s.tmp);
            }
        };

        for entry in &set.entries {
            let target = self.workspace_root.join(&entry.path);
            match entry.action {
                PatchAction::Add => {
                    deletions.push(target);
                }
                PatchAction::Modify | PatchAction::Delete => {
                    let blob = entry
                        .before_blob
                        .as_deref()
                        .ok_or_else(|| Error::Verification(format!("missing blob for {}", entry.path)))
                        .and_then(|hex_blob| {
                            hex::decode(hex_blob).map_err(|e| {
                                Error::Verification(format!("corrupt blob for {}: {e}", entry.path))
                            })
                        });
                    let blob = match blob {
                        Ok(blob) => blob,
                        Err(e) => {
                            cleanup(&staged);
                            return Err(e);
                        }
                    };
                    let tmp = target.with_extension(format!(
                        "{}.restore-tmp",
                        target
                            .extension()
                            .and_then(|e| e.to_str())
                            .unwrap_or("bin")
                    ));
                    let stage = (|| -> Result<()> {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent).map_err(Error::Io)?;
                        }
                        std::fs::write(&tmp, &blob).map_err(Error::Io)
                    })();
                    if let Err(e) = stage {
                        cleanup(&staged);
                        return Err(e);
                    }
                    staged.push(Staged { tmp, target });
                }
            }
        }

        // Commit phase: renames and deletions only.
        let mut restored = Vec::new();
        for s in &staged {
            std::fs::rename(&s.tmp, &s.target).map_err(Error::Io)?;
            restored.push(s.target.display().to_string());
        }
        for target in &deletions {
            match std::fs::remove_file(target) {
                Ok(()) => restored.push(target.display().to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(restored)
    }

    fn persist(&self, set: &PatchSet) -> Result<()> {
        let dir = self.snapshots_dir.join(&set.session_id);
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        let path = self.patch_path(&set.session_id, &set.id);
        let tmp = path.with_extension("snap.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(set).map_err(Error::Json)?)
            .map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }

    fn patch_path(&self, session_id: &str, id: &str) -> PathBuf {
        self.snapshots_dir.join(session_id).join(format!("{id}.snap"))
    }
}

/// Lexically validate a workspace-relative path: no absolute paths, no
/// parent traversal.
fn sanitize_rel_path(raw: &str) -> Option<String> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return None;
    }
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
