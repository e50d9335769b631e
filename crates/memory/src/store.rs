//! The memory store: JSONL-backed unit, edge, and insight logs.
//!
//! Every mutation appends a full record; the in-memory view is the
//! last-wins fold of the log. Global (cross-session) units live under
//! `global/`, and global-sync snapshots under `global-sync/`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use ov_domain::error::{Error, Result};

use crate::evolves::EvolvesEdge;
use crate::insight::Insight;
use crate::unit::{MemoryUnit, UnitStatus};

/// A compiled summary of ≥ N related units sharing a topic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Crystal {
    /// Deterministic per `(scope, topic)` so recompiles overwrite.
    pub id: String,
    /// Session id, or `global` for the promoted tier.
    pub scope: String,
    pub topic: String,
    pub summary: String,
    pub unit_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// On-disk metadata for the global tier.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GlobalMeta {
    pub last_decay_at: Option<DateTime<Utc>>,
}

pub struct MemoryStore {
    dir: PathBuf,
    units: Mutex<HashMap<String, MemoryUnit>>,
    edges: Mutex<HashMap<String, EvolvesEdge>>,
    insights: Mutex<HashMap<String, Insight>>,
    crystals: Mutex<HashMap<String, Crystal>>,
    global_units: Mutex<HashMap<String, MemoryUnit>>,
}

impl MemoryStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join("global")).map_err(Error::Io)?;
        std::fs::create_dir_all(dir.join("global-sync")).map_err(Error::Io)?;

        let units = fold_log::<MemoryUnit>(&dir.join("units.jsonl"), |u| u.id.clone())?;
        let edges = fold_log::<EvolvesEdge>(&dir.join("edges.jsonl"), |e| e.id.clone())?;
        let insights = fold_log::<Insight>(&dir.join("insights.jsonl"), |i| i.id.clone())?;
        let crystals = fold_log::<Crystal>(&dir.join("crystals.jsonl"), |c| c.id.clone())?;
        let global_units =
            fold_log::<MemoryUnit>(&dir.join("global").join("units.jsonl"), |u| u.id.clone())?;

        tracing::info!(
            dir = %dir.display(),
            units = units.len(),
            edges = edges.len(),
            "memory store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            units: Mutex::new(units),
            edges: Mutex::new(edges),
            insights: Mutex::new(insights),
            crystals: Mutex::new(crystals),
            global_units: Mutex::new(global_units),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Units ────────────────────────────────────────────────────────

    /// Write (insert or last-wins update) one unit.
    pub fn put_unit(&self, unit: &MemoryUnit) -> Result<()> {
        append_line(&self.dir.join("units.jsonl"), unit)?;
        self.units.lock().insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    pub fn unit(&self, id: &str) -> Option<MemoryUnit> {
        self.units.lock().get(id).cloned()
    }

    pub fn session_units(&self, session_id: &str) -> Vec<MemoryUnit> {
        let mut units: Vec<MemoryUnit> = self
            .units
            .lock()
            .values()
            .filter(|u| u.session_id == session_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn active_session_units(&self, session_id: &str) -> Vec<MemoryUnit> {
        self.session_units(session_id)
            .into_iter()
            .filter(|u| u.status == UnitStatus::Active)
            .collect()
    }

    /// The one active unit with this fingerprint in the session, if any.
    pub fn active_by_fingerprint(&self, session_id: &str, fingerprint: &str) -> Option<MemoryUnit> {
        self.units
            .lock()
            .values()
            .find(|u| {
                u.session_id == session_id
                    && u.fingerprint == fingerprint
                    && u.status == UnitStatus::Active
            })
            .cloned()
    }

    /// All units across sessions (for promotion scans).
    pub fn all_units(&self) -> Vec<MemoryUnit> {
        self.units.lock().values().cloned().collect()
    }

    /// Drop a session's units from the view and the log (tape rebuild).
    pub fn clear_session_units(&self, session_id: &str) -> Result<()> {
        let mut units = self.units.lock();
        units.retain(|_, u| u.session_id != session_id);
        let remaining: Vec<MemoryUnit> = units.values().cloned().collect();
        drop(units);
        rewrite_log(&self.dir.join("units.jsonl"), &remaining)
    }

    // ── Edges ────────────────────────────────────────────────────────

    pub fn put_edge(&self, edge: &EvolvesEdge) -> Result<()> {
        append_line(&self.dir.join("edges.jsonl"), edge)?;
        self.edges.lock().insert(edge.id.clone(), edge.clone());
        Ok(())
    }

    pub fn edge(&self, id: &str) -> Option<EvolvesEdge> {
        self.edges.lock().get(id).cloned()
    }

    pub fn session_edges(&self, session_id: &str) -> Vec<EvolvesEdge> {
        let mut edges: Vec<EvolvesEdge> = self
            .edges
            .lock()
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub fn edge_between(&self, source_unit_id: &str, target_unit_id: &str) -> Option<EvolvesEdge> {
        self.edges
            .lock()
            .values()
            .find(|e| e.source_unit_id == source_unit_id && e.target_unit_id == target_unit_id)
            .cloned()
    }

    // ── Insights ─────────────────────────────────────────────────────

    pub fn put_insight(&self, insight: &Insight) -> Result<()> {
        append_line(&self.dir.join("insights.jsonl"), insight)?;
        self.insights
            .lock()
            .insert(insight.id.clone(), insight.clone());
        Ok(())
    }

    pub fn insight(&self, id: &str) -> Option<Insight> {
        self.insights.lock().get(id).cloned()
    }

    pub fn session_insights(&self, session_id: &str) -> Vec<Insight> {
        let mut all: Vec<Insight> = self
            .insights
            .lock()
            .values()
            .filter(|i| i.session_id == session_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    // ── Crystals ─────────────────────────────────────────────────────

    pub fn put_crystal(&self, crystal: &Crystal) -> Result<()> {
        append_line(&self.dir.join("crystals.jsonl"), crystal)?;
        self.crystals
            .lock()
            .insert(crystal.id.clone(), crystal.clone());
        Ok(())
    }

    pub fn scope_crystals(&self, scope: &str) -> Vec<Crystal> {
        let mut all: Vec<Crystal> = self
            .crystals
            .lock()
            .values()
            .filter(|c| c.scope == scope)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.topic.cmp(&b.topic));
        all
    }

    // ── Global tier ──────────────────────────────────────────────────

    pub fn put_global_unit(&self, unit: &MemoryUnit) -> Result<()> {
        append_line(&self.dir.join("global").join("units.jsonl"), unit)?;
        self.global_units
            .lock()
            .insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    pub fn global_units(&self) -> Vec<MemoryUnit> {
        let mut units: Vec<MemoryUnit> = self.global_units.lock().values().cloned().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn replace_global_units(&self, units: Vec<MemoryUnit>) -> Result<()> {
        rewrite_log(&self.dir.join("global").join("units.jsonl"), &units)?;
        *self.global_units.lock() = units.into_iter().map(|u| (u.id.clone(), u)).collect();
        Ok(())
    }

    pub fn global_meta(&self) -> GlobalMeta {
        let path = self.dir.join("global").join("meta.json");
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn put_global_meta(&self, meta: &GlobalMeta) -> Result<()> {
        let path = self.dir.join("global").join("meta.json");
        atomic_write(&path, &serde_json::to_vec_pretty(meta).map_err(Error::Json)?)
    }

    /// Best-effort global-sync snapshot; last writer wins.
    pub fn write_global_sync_snapshot(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let path = self
            .dir
            .join("global-sync")
            .join(format!("snapshot-{}-{}.json", now.timestamp_millis(), suffix));
        let units = self.global_units();
        atomic_write(&path, &serde_json::to_vec_pretty(&units).map_err(Error::Json)?)?;
        Ok(path)
    }

    /// Write the working-memory markdown file atomically.
    pub fn write_working_md(&self, content: &str) -> Result<()> {
        atomic_write(&self.dir.join("working.md"), content.as_bytes())
    }
}

// ── File helpers ──────────────────────────────────────────────────────

fn fold_log<T: DeserializeOwned>(
    path: &Path,
    key: impl Fn(&T) -> String,
) -> Result<HashMap<String, T>> {
    let mut map = HashMap::new();
    if !path.exists() {
        return Ok(map);
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => {
                map.insert(key(&record), record);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed memory line");
            }
        }
    }
    Ok(map)
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let json = serde_json::to_string(record).map_err(Error::Json)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)?;
    file.write_all(json.as_bytes()).map_err(Error::Io)?;
    file.write_all(b"\n").map_err(Error::Io)?;
    Ok(())
}

fn rewrite_log<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record).map_err(Error::Json)?);
        buf.push('\n');
    }
    atomic_write(path, buf.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(Error::Io)?;
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}
