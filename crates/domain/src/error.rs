/// Shared error type used across all Overseer crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("ledger: {0}")]
    Ledger(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("memory: {0}")]
    Memory(String),

    #[error("verification: {0}")]
    Verification(String),

    #[error("gateway: {0}")]
    Gateway(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
