//! Auth token ownership: the current token lives in exactly one place
//! and changes only through [`TokenKeeper::rotate`].
//!
//! The token file is UTF-8, one line, newline-terminated, written
//! atomically (tmp + rename) and trimmed on read.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use ov_domain::error::{Error, Result};

/// Constant-time token comparison via SHA-256 digest. Hashing normalizes
/// lengths so `ct_eq` always compares 32 bytes.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

pub struct TokenKeeper {
    path: PathBuf,
    current: RwLock<String>,
}

impl TokenKeeper {
    /// Load the token from disk, generating and persisting a fresh one
    /// when the file is missing or empty.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let existing = std::fs::read_to_string(path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|token| !token.is_empty());

        let token = match existing {
            Some(token) => token,
            None => {
                let token = generate_token();
                write_token_file(path, &token)?;
                token
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(token),
        })
    }

    /// Constant-time check of a presented token.
    pub fn verify(&self, provided: &str) -> bool {
        token_eq(&self.current.read(), provided)
    }

    pub fn current(&self) -> String {
        self.current.read().clone()
    }

    /// Generate a new token, persist it atomically, and return
    /// `(old, new)`.
    pub fn rotate(&self) -> Result<(String, String)> {
        let new = generate_token();
        write_token_file(&self.path, &new)?;
        let mut current = self.current.write();
        let old = std::mem::replace(&mut *current, new.clone());
        Ok((old, new))
    }
}

fn generate_token() -> String {
    // Two v4 UUIDs: 256 bits of OS randomness, hex, no separators.
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let tmp = path.with_extension("token.tmp");
    std::fs::write(&tmp, format!("{token}\n")).map_err(Error::Io)?;
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}
