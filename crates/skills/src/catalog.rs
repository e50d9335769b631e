//! Skill catalog loading.
//!
//! The catalog is a directory of `<name>.json` contract documents
//! (produced by the external skill-content tooling). Scanning is
//! tolerant: a malformed document is skipped with a warning rather than
//! failing the whole load.

use std::collections::HashMap;
use std::path::Path;

use ov_domain::error::{Error, Result};

use crate::contract::SkillContract;

/// Scan `dir` for contract documents. A missing directory is an empty
/// catalog.
pub fn scan_contracts(dir: &Path) -> Result<HashMap<String, SkillContract>> {
    let mut contracts = HashMap::new();
    if !dir.exists() {
        tracing::info!(dir = %dir.display(), "no skill catalog directory");
        return Ok(contracts);
    }

    for entry in std::fs::read_dir(dir).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        match serde_json::from_str::<SkillContract>(&raw) {
            Ok(contract) => {
                if contract.name.trim().is_empty() {
                    tracing::warn!(path = %path.display(), "skipping contract with empty name");
                    continue;
                }
                contracts.insert(contract.name.clone(), contract);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed contract");
            }
        }
    }

    tracing::info!(
        dir = %dir.display(),
        skills = contracts.len(),
        "skill catalog loaded"
    );
    Ok(contracts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_contracts_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("build.json"),
            r#"{"name": "build", "tools": {"required": ["exec"]}, "outputs": ["artifact"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{nope").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a contract").unwrap();

        let contracts = scan_contracts(dir.path()).unwrap();
        assert_eq!(contracts.len(), 1);
        assert!(contracts["build"].tools.allows("exec"));
    }

    #[test]
    fn missing_dir_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let contracts = scan_contracts(&dir.path().join("nope")).unwrap();
        assert!(contracts.is_empty());
    }
}
