use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use ov_domain::config::Config;
use ov_gateway::cli::{client, resolve_workspace, Cli, Command};
use ov_gateway::daemon;

/// Exit codes: 1 = argument/validation failure, 2 = daemon start
/// failure, 3 = daemon stop failure.
const EXIT_USAGE: i32 = 1;
const EXIT_START_FAILED: i32 = 2;
const EXIT_STOP_FAILED: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    match cli.command {
        Command::Start { workspace } => {
            let workspace = resolve_workspace(workspace);
            let config = match Config::load(&workspace) {
                Ok(mut config) => {
                    config.paths.workspace_root = workspace;
                    Arc::new(config)
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_USAGE);
                }
            };
            if let Err(e) = init_daemon_tracing(&config) {
                eprintln!("error: opening log file: {e}");
                std::process::exit(EXIT_START_FAILED);
            }
            match daemon::start_daemon(config).await {
                Ok(running) => {
                    println!("overseer listening on ws://{}/ws", running.addr);
                    println!("token file: {}", running.state.paths.token_path.display());
                    let _ = running.handle.await;
                }
                Err(e) => {
                    eprintln!("error: daemon start failed: {e}");
                    std::process::exit(EXIT_START_FAILED);
                }
            }
        }
        Command::Stop { workspace } => {
            init_tracing();
            let state_dir = state_dir_for(workspace);
            match client::call(&state_dir, "gateway.stop", json!({})).await {
                Ok(_) => println!("daemon stopping"),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_STOP_FAILED);
                }
            }
        }
        Command::Status { workspace } => {
            init_tracing();
            let state_dir = state_dir_for(workspace);
            match client::call(&state_dir, "status.deep", json!({})).await {
                Ok(payload) => {
                    println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default())
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_USAGE);
                }
            }
        }
        Command::RotateToken { workspace } => {
            init_tracing();
            let state_dir = state_dir_for(workspace);
            match client::call(&state_dir, "gateway.rotate-token", json!({})).await {
                Ok(payload) => {
                    println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default())
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_USAGE);
                }
            }
        }
        Command::Worker { session, workspace } => {
            init_worker_tracing();
            if let Err(e) = ov_gateway::worker::worker_main(&session, &workspace) {
                eprintln!("worker error: {e}");
                std::process::exit(EXIT_START_FAILED);
            }
        }
    }
}

fn state_dir_for(workspace: Option<std::path::PathBuf>) -> std::path::PathBuf {
    let workspace = resolve_workspace(workspace);
    match Config::load(&workspace) {
        Ok(mut config) => {
            config.paths.workspace_root = workspace;
            config.paths.state_dir()
        }
        Err(_) => workspace.join("state"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("overseer=info,ov_gateway=info,ov_runtime=info")),
        )
        .json()
        .init();
}

/// The daemon logs as JSON lines into `state/overseer.log`.
fn init_daemon_tracing(config: &Config) -> anyhow::Result<()> {
    let log_path = ov_gateway::DaemonPaths::new(&config.paths.state_dir()).log_path;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}

/// Worker stdout is the supervisor protocol; logs go to stderr.
fn init_worker_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
