//! Heartbeat rules: a markdown file of `## <rule-id>` sections, each
//! optionally overriding its session with a `session: <id>` line. The
//! default session for a rule is `heartbeat:<rule-id>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRule {
    pub id: String,
    pub session_id: String,
}

impl HeartbeatRule {
    pub fn default_session(rule_id: &str) -> String {
        format!("heartbeat:{rule_id}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReloadDiff {
    pub rules: usize,
    pub added: Vec<String>,
    pub removed: Vec<HeartbeatRule>,
    /// Sessions whose default id is no longer referenced by any
    /// remaining rule; the caller closes these.
    pub sessions_to_close: Vec<String>,
}

pub struct HeartbeatSet {
    path: PathBuf,
    rules: Mutex<HashMap<String, HeartbeatRule>>,
}

impl HeartbeatSet {
    /// Load the rule file; a missing file is an empty rule set.
    pub fn load(path: &Path) -> Self {
        let rules = parse_rules(&std::fs::read_to_string(path).unwrap_or_default());
        tracing::info!(path = %path.display(), rules = rules.len(), "heartbeat rules loaded");
        Self {
            path: path.to_path_buf(),
            rules: Mutex::new(rules),
        }
    }

    pub fn rules(&self) -> Vec<HeartbeatRule> {
        let mut rules: Vec<HeartbeatRule> = self.rules.lock().values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// Re-parse the file and diff against the held rule set.
    ///
    /// A removed rule's default session (`heartbeat:<rule-id>`) is marked
    /// for closing unless some remaining rule still references that
    /// session id — explicitly shared sessions survive.
    pub fn reload(&self) -> ReloadDiff {
        let new_rules = parse_rules(&std::fs::read_to_string(&self.path).unwrap_or_default());
        let mut held = self.rules.lock();

        let added: Vec<String> = new_rules
            .keys()
            .filter(|id| !held.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<HeartbeatRule> = held
            .values()
            .filter(|rule| !new_rules.contains_key(&rule.id))
            .cloned()
            .collect();

        let mut sessions_to_close = Vec::new();
        for rule in &removed {
            let default_session = HeartbeatRule::default_session(&rule.id);
            let still_referenced = new_rules
                .values()
                .any(|r| r.session_id == default_session);
            if !still_referenced {
                sessions_to_close.push(default_session);
            }
        }
        sessions_to_close.sort();
        sessions_to_close.dedup();

        let diff = ReloadDiff {
            rules: new_rules.len(),
            added,
            removed,
            sessions_to_close,
        };
        *held = new_rules;
        diff
    }
}

fn parse_rules(content: &str) -> HashMap<String, HeartbeatRule> {
    let mut rules = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            let id = heading.trim().to_string();
            if !id.is_empty() {
                rules.insert(
                    id.clone(),
                    HeartbeatRule {
                        session_id: HeartbeatRule::default_session(&id),
                        id: id.clone(),
                    },
                );
                current = Some(id);
            }
        } else if let Some(session) = trimmed.strip_prefix("session:") {
            if let Some(rule_id) = &current {
                let session = session.trim();
                if !session.is_empty() {
                    if let Some(rule) = rules.get_mut(rule_id) {
                        rule.session_id = session.to_string();
                    }
                }
            }
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES_V1: &str = "\
# Heartbeats

## morning-digest
Runs every morning.

## repo-watch
session: heartbeat:morning-digest

## standalone
Checks the queue.
";

    fn write_rules(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("HEARTBEAT.md");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_rules_and_session_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rules(&dir, RULES_V1);
        let set = HeartbeatSet::load(&path);
        let rules = set.rules();
        assert_eq!(rules.len(), 3);
        let watch = rules.iter().find(|r| r.id == "repo-watch").unwrap();
        assert_eq!(watch.session_id, "heartbeat:morning-digest");
        let standalone = rules.iter().find(|r| r.id == "standalone").unwrap();
        assert_eq!(standalone.session_id, "heartbeat:standalone");
    }

    #[test]
    fn removed_rule_closes_unreferenced_default_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rules(&dir, RULES_V1);
        let set = HeartbeatSet::load(&path);

        // Drop "standalone" — nothing references heartbeat:standalone.
        std::fs::write(
            &path,
            "## morning-digest\n\n## repo-watch\nsession: heartbeat:morning-digest\n",
        )
        .unwrap();
        let diff = set.reload();
        assert_eq!(diff.rules, 2);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.sessions_to_close, vec!["heartbeat:standalone".to_string()]);
    }

    #[test]
    fn shared_session_survives_rule_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rules(&dir, RULES_V1);
        let set = HeartbeatSet::load(&path);

        // Drop "morning-digest"; "repo-watch" still shares its session.
        std::fs::write(
            &path,
            "## repo-watch\nsession: heartbeat:morning-digest\n\n## standalone\n",
        )
        .unwrap();
        let diff = set.reload();
        assert_eq!(diff.removed.len(), 1);
        assert!(diff.sessions_to_close.is_empty());
    }

    #[test]
    fn added_rules_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rules(&dir, "## one\n");
        let set = HeartbeatSet::load(&path);
        std::fs::write(&path, "## one\n\n## two\n").unwrap();
        let diff = set.reload();
        assert_eq!(diff.added, vec!["two".to_string()]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = HeartbeatSet::load(&dir.path().join("nope.md"));
        assert_eq!(set.rule_count(), 0);
    }
}
