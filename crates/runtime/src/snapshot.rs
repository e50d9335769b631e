//! Per-session recovery snapshots for interrupt/resume.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ov_context::BudgetSnapshot;
use ov_cost::CostSnapshot;
use ov_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub session_id: String,
    pub turn: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostSnapshot>,
    pub saved_at: DateTime<Utc>,
}

/// One JSON document per session, written atomically.
pub struct SessionSnapshotStore {
    dir: PathBuf,
}

impl SessionSnapshotStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn save(&self, snapshot: &RecoverySnapshot) -> Result<()> {
        let path = self.path(&snapshot.session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot).map_err(Error::Json)?)
            .map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Option<RecoverySnapshot>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(Some(serde_json::from_str(&raw).map_err(Error::Json)?))
    }

    pub fn remove(&self, session_id: &str) {
        let _ = std::fs::remove_file(self.path(session_id));
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionSnapshotStore::new(dir.path()).unwrap();
        assert!(store.load("s1").unwrap().is_none());

        store
            .save(&RecoverySnapshot {
                session_id: "s1".into(),
                turn: 7,
                resume_hint: Some("resume after exec".into()),
                compaction_summary: None,
                budget: None,
                cost: None,
                saved_at: Utc::now(),
            })
            .unwrap();

        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.turn, 7);
        assert_eq!(loaded.resume_hint.as_deref(), Some("resume after exec"));

        store.remove("s1");
        assert!(store.load("s1").unwrap().is_none());
    }
}
