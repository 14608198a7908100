use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::HttpAgentBackend;
use crate::config::BerthConfig;
use crate::hub::{HubDeps, SessionHub};
use crate::process::host::TokioProcessHost;
use crate::process::probe::HttpReadinessProbe;
use crate::rpc::http;
use crate::rpc::methods::RpcServerState;
use crate::rpc::unix::serve_unix_until_shutdown;
use crate::scheduler::TaskTicks;
use crate::startup::{bind_socket, is_daemon_running, remove_runtime_file, write_pid_file, DaemonPaths};
use crate::store::meta_db::MetaDb;
use crate::stream::connector::HttpStreamConnector;

pub async fn run_standalone() -> Result<()> {
    let paths = DaemonPaths::resolve()?;
    let config = load_config(&paths)?;
    run_with_paths(paths, config).await
}

/// A missing file means defaults, written out once so there is something to edit.
fn load_config(paths: &DaemonPaths) -> Result<BerthConfig> {
    if !paths.config_path.exists() {
        let config = BerthConfig::default();
        match config.save_to(&paths.config_path) {
            Ok(()) => info!(path = %paths.config_path.display(), "wrote default config"),
            Err(error) => warn!(%error, "could not write default config"),
        }
        return Ok(config);
    }
    BerthConfig::load_from(&paths.config_path)
        .with_context(|| format!("failed to load `{}`", paths.config_path.display()))
}

/// Build the hub over production collaborators and serve it.
pub async fn run_with_paths(paths: DaemonPaths, config: BerthConfig) -> Result<()> {
    let db = MetaDb::open(&paths.meta_db_path)?;
    let probe = HttpReadinessProbe::new(config.runtime.health_path.clone());
    let (hub, ticks) = SessionHub::new(HubDeps {
        config,
        host: Arc::new(TokioProcessHost::new()),
        probe: Arc::new(probe),
        ports: None,
        connector: Arc::new(HttpStreamConnector::new()),
        backend: Arc::new(HttpAgentBackend::new()),
        db,
    });
    serve_hub(paths, hub, ticks).await
}

/// Recover scheduled tasks, then serve RPC until `daemon.shutdown` or Ctrl-C.
/// Every process is terminated before this returns.
pub async fn serve_hub(paths: DaemonPaths, hub: Arc<SessionHub>, ticks: TaskTicks) -> Result<()> {
    if is_daemon_running(&paths.socket_path).await {
        bail!("a daemon is already listening on `{}`", paths.socket_path.display());
    }
    let listener = bind_socket(&paths.socket_path).await?;
    write_pid_file(&paths.pid_path)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    recover(&hub).await;
    let ticker = hub.spawn_tick_loop(ticks);
    let sweeper = spawn_health_sweep(Arc::clone(&hub), shutdown_tx.subscribe());

    let state = RpcServerState::new(Arc::clone(&hub)).with_shutdown_notifier(shutdown_tx.clone());
    let http_server = match hub.config().daemon.http_port {
        0 => None,
        port => Some(spawn_http(port, state.clone(), shutdown_tx.subscribe()).await?),
    };

    info!(socket_path = %paths.socket_path.display(), "berth daemon started");
    let result = serve_unix_until_shutdown(listener, state, shutdown_rx).await;

    ticker.abort();
    sweeper.abort();
    if let Some(server) = http_server {
        server.abort();
    }
    hub.shutdown().await;
    remove_runtime_file(&paths.pid_path);
    remove_runtime_file(&paths.socket_path);
    info!("berth daemon stopped");
    result.context("daemon rpc server exited with error")
}

/// A failed recovery never blocks startup.
async fn recover(hub: &SessionHub) {
    match hub.run_recovery().await {
        Ok(report) if report.is_complete() => {
            info!(recovered = report.recovered, total = report.total, "{}", report.summary());
        }
        Ok(report) => {
            let failed: Vec<&str> = report.failures.iter().map(|(id, _)| id.as_str()).collect();
            warn!(?failed, "{}", report.summary());
        }
        Err(error) => error!(error = %format!("{error:#}"), "scheduled task recovery failed"),
    }
}

fn spawn_health_sweep(hub: Arc<SessionHub>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    let period = Duration::from_secs(hub.config().daemon.health_sweep_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    let unhealthy = hub.health_sweep().await;
                    if unhealthy > 0 {
                        warn!(unhealthy, "health sweep found unhealthy processes");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn spawn_http(
    port: u16,
    state: RpcServerState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;
    info!(%address, "http listener ready");
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = http::serve(listener, state) => {
                if let Err(error) = result {
                    warn!(?error, "http server terminated unexpectedly");
                }
            }
            _ = shutdown.recv() => {}
        }
    }))
}
