//! Pid-file management.
//!
//! The daemon writes `overseer.pid.json` (pid + port + start time) and
//! holds an `fs2` exclusive lock on it for its lifetime, so a second
//! instance fails fast instead of fighting over the state directory.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// Write the pid file and acquire its exclusive lock. The returned
/// handle must stay alive for the daemon's lifetime.
pub fn write_pid_file(path: &Path, port: u16) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("opening pid file {}: {e}", path.display()))?;

    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another overseer daemon is running (pid file {} is locked)",
            path.display()
        )
    })?;

    let record = PidFile {
        pid: std::process::id(),
        port,
        started_at: Utc::now(),
    };
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&serde_json::to_vec_pretty(&record)?)?;
    file.flush()?;

    tracing::info!(path = %path.display(), pid = record.pid, "pid file written");
    Ok(file)
}

/// Rewrite the pid file with the actual bound port (ephemeral binds).
pub fn update_port(path: &Path, port: u16) -> anyhow::Result<()> {
    let mut record = read_pid_file(path)?;
    record.port = port;
    // The lock holder is this process; plain write keeps the lock valid.
    std::fs::write(path, serde_json::to_vec_pretty(&record)?)?;
    Ok(())
}

pub fn read_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading pid file {}: {e}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing pid file {}: {e}", path.display()))
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove pid file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.pid.json");

        let handle = write_pid_file(&path, 4460).unwrap();
        let record = read_pid_file(&path).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.port, 4460);

        // A second lock attempt fails while the first handle is alive.
        assert!(write_pid_file(&path, 4461).is_err());

        drop(handle);
        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn update_port_preserves_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.pid.json");
        let _handle = write_pid_file(&path, 0).unwrap();
        update_port(&path, 50123).unwrap();
        let record = read_pid_file(&path).unwrap();
        assert_eq!(record.port, 50123);
        assert_eq!(record.pid, std::process::id());
    }
}
