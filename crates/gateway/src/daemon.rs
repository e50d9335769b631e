//! Daemon lifecycle: state directory, loopback-only bind, token + pid
//! files, the axum server, and the background idle sweep.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use ov_domain::config::{Config, WorkerBackendKind};
use ov_runtime::SessionRuntime;

use crate::auth::TokenKeeper;
use crate::backend::{EventEmitter, InProcessBackend, ProcessBackend, SessionBackend};
use crate::cli::pid;
use crate::conn::ConnectionRegistry;
use crate::heartbeat::HeartbeatSet;
use crate::seq::BroadcastSeq;
use crate::supervisor::SessionSupervisor;
use crate::ws;

/// Filenames under the daemon state directory.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub state_dir: PathBuf,
    pub pid_path: PathBuf,
    pub token_path: PathBuf,
    pub log_path: PathBuf,
    pub children_path: PathBuf,
}

impl DaemonPaths {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            pid_path: state_dir.join("overseer.pid.json"),
            token_path: state_dir.join("overseer.token"),
            log_path: state_dir.join("overseer.log"),
            children_path: state_dir.join("children.json"),
        }
    }
}

/// Shared state handed to every websocket handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub paths: Arc<DaemonPaths>,
    pub token: Arc<TokenKeeper>,
    pub seq: Arc<BroadcastSeq>,
    pub conns: Arc<ConnectionRegistry>,
    pub supervisor: Arc<SessionSupervisor>,
    pub heartbeat: Arc<HeartbeatSet>,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// A started daemon: bound address, shared state, and the serve task.
pub struct RunningDaemon {
    pub addr: SocketAddr,
    pub state: GatewayState,
    pub handle: tokio::task::JoinHandle<()>,
    /// Holds the pid-file advisory lock for the daemon's lifetime.
    _pid_lock: std::fs::File,
}

impl std::fmt::Debug for RunningDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningDaemon")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl RunningDaemon {
    /// Request shutdown and wait for the serve task.
    pub async fn stop(self) {
        self.state.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Only loopback hosts are ever accepted.
pub fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1")
}

/// Start the gateway daemon: ensure the state directory, refuse
/// non-loopback hosts, write the token and pid files, bind, and serve.
pub async fn start_daemon(config: Arc<Config>) -> anyhow::Result<RunningDaemon> {
    let gateway = &config.gateway;
    if !is_loopback_host(&gateway.host) {
        anyhow::bail!(
            "refusing to bind non-loopback host {:?}; use 127.0.0.1, localhost, or ::1",
            gateway.host
        );
    }

    let paths = Arc::new(DaemonPaths::new(&config.paths.state_dir()));
    std::fs::create_dir_all(&paths.state_dir)?;

    let token = Arc::new(TokenKeeper::load_or_generate(&paths.token_path)?);
    let pid_lock = pid::write_pid_file(&paths.pid_path, gateway.port)?;

    let seq = Arc::new(BroadcastSeq::new());
    let conns = Arc::new(ConnectionRegistry::new(seq.clone()));

    // Worker events come back as session-scoped broadcasts.
    let emitter: EventEmitter = {
        let conns = conns.clone();
        Arc::new(move |session_id, event, payload| {
            conns.session_event(session_id, event, Some(payload));
        })
    };

    let backend: Arc<dyn SessionBackend> = match gateway.backend {
        WorkerBackendKind::InProcess => {
            let runtime = SessionRuntime::bootstrap(config.clone())?;
            Arc::new(InProcessBackend::new(runtime, emitter))
        }
        WorkerBackendKind::Process => Arc::new(ProcessBackend::new(
            &config.paths.resolve(&config.paths.workspace_root),
            gateway.graceful_timeout_ms,
            emitter,
        )),
    };

    let supervisor = Arc::new(SessionSupervisor::new(
        gateway.clone(),
        &paths.children_path,
        backend,
    ));
    let heartbeat = Arc::new(HeartbeatSet::load(
        &config.paths.resolve(&gateway.heartbeat_path),
    ));

    let state = GatewayState {
        config: config.clone(),
        paths: paths.clone(),
        token,
        seq,
        conns,
        supervisor: supervisor.clone(),
        heartbeat,
        started_at: Utc::now(),
        cancel: CancellationToken::new(),
    };

    let listener =
        tokio::net::TcpListener::bind((gateway.host.as_str(), gateway.port)).await?;
    let addr = listener.local_addr()?;
    // An ephemeral port request means the pid file holds 0; fix it up.
    if gateway.port == 0 {
        pid::update_port(&paths.pid_path, addr.port())?;
    }

    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Idle sweep.
    {
        let supervisor = supervisor.clone();
        let cancel = state.cancel.clone();
        let interval_ms = gateway.session_idle_sweep_interval_ms.max(100);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        supervisor.idle_sweep().await;
                    }
                }
            }
        });
    }

    tracing::info!(
        addr = %addr,
        state_dir = %paths.state_dir.display(),
        backend = ?gateway.backend,
        "gateway daemon listening"
    );

    let serve_state = state.clone();
    let serve_paths = paths.clone();
    let handle = tokio::spawn(async move {
        let cancel = serve_state.cancel.clone();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "gateway server failed");
        }
        serve_state.supervisor.stop_all("daemon_stop").await;
        pid::remove_pid_file(&serve_paths.pid_path);
        tracing::info!("gateway daemon stopped");
    });

    Ok(RunningDaemon {
        addr,
        state,
        handle,
        _pid_lock: pid_lock,
    })
}
