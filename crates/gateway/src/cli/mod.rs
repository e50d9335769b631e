pub mod client;
pub mod pid;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Overseer — orchestration runtime for long-lived coding-agent sessions.
#[derive(Debug, Parser)]
#[command(name = "overseer", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway daemon in the foreground.
    Start {
        /// Workspace root (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Ask the running daemon to stop.
    Stop {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Print daemon health and worker status.
    Status {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Rotate the auth token, revoking existing connections.
    RotateToken {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Run as a per-session worker (spawned by the daemon).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        session: String,
        #[arg(long)]
        workspace: PathBuf,
    },
}

pub fn resolve_workspace(workspace: Option<PathBuf>) -> PathBuf {
    workspace.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}
