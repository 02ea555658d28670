use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hivebot::connector::Connector;
use hivebot::exchange::mock::MockAdapter;
use hivebot::http::{self, AppState};
use hivebot::mirror::RemoteMirror;
use hivebot::reconciler::{self, Reconciler};
use hivebot::registry::Registry;
use hivebot::store::ConfigStore;
use hivebot::supervisor::Supervisor;

use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Environment-driven startup configuration (C13, §6). Parsed once, here.
struct HiveConfig {
    instance_id: String,
    api_port: u16,
    config_path: PathBuf,
    remote_mirror_dsn: Option<String>,
}

impl HiveConfig {
    fn from_env() -> Self {
        let api_port: u16 = std::env::var("HIVE_API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let instance_id = std::env::var("HIVE_INSTANCE_ID").unwrap_or_else(|_| format!("{hostname}-{api_port}"));

        let config_path = std::env::var("HIVE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hive_strategies.json"));

        let remote_mirror_dsn = std::env::var("HIVE_REMOTE_MIRROR_DSN").ok();

        Self {
            instance_id,
            api_port,
            config_path,
            remote_mirror_dsn,
        }
    }
}

fn main() -> std::process::ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_max_level(Level::INFO)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(%e, "failed to start async runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(Shutdown::Clean) => std::process::ExitCode::SUCCESS,
        Ok(Shutdown::Interrupted) => std::process::ExitCode::from(130),
        Err(e) => {
            error!(%e, "startup failed");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Exit code 0 on clean shutdown, 130 on SIGINT-driven interrupt (§6).
enum Shutdown {
    Clean,
    Interrupted,
}

async fn run() -> anyhow::Result<Shutdown> {
    let cfg = HiveConfig::from_env();
    info!(instance_id = %cfg.instance_id, api_port = cfg.api_port, "starting hivebot");

    let mirror = RemoteMirror::new(cfg.remote_mirror_dsn.clone());
    let store = Arc::new(
        ConfigStore::open(cfg.config_path.clone(), mirror.clone())
            .await
            .map_err(|e| anyhow::anyhow!("config store unavailable: {e}"))?,
    );

    // The real Exchange Adapter implementation is an external collaborator
    // (§4.3); this binary wires the in-memory mock so the service is
    // runnable end to end without exchange credentials.
    let adapter = Arc::new(MockAdapter::new());
    let connector = Arc::new(Connector::new(adapter));

    let registry = Arc::new(Registry::new(
        cfg.instance_id.clone(),
        store.clone(),
        connector.clone(),
        mirror.clone(),
    ));
    registry
        .restore_from_store()
        .await
        .map_err(|e| anyhow::anyhow!("failed to restore strategies: {e}"))?;

    let reconciler = Arc::new(Reconciler::new(
        cfg.instance_id.clone(),
        connector.clone(),
        registry.clone(),
        mirror.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reconciler_task = tokio::spawn(reconciler.clone().run_forever(reconciler::DEFAULT_INTERVAL));

    // Demultiplex adapter order/position events back to owning strategy
    // inboxes (§4.4); the reconciler drains whatever lands unattributed.
    const DEMUX_POLL_INTERVAL: Duration = Duration::from_millis(200);
    let demux_connector = connector.clone();
    let mut demux_shutdown = shutdown_rx.clone();
    let demux_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEMUX_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => demux_connector.pump_events().await,
                _ = demux_shutdown.changed() => {
                    if *demux_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let supervisor = Supervisor::new(cfg.instance_id.clone(), cfg.api_port, mirror.clone());
    let supervisor_shutdown = shutdown_rx.clone();
    let supervisor_task = tokio::spawn(async move { supervisor.run(supervisor_shutdown).await });

    let state = Arc::new(AppState {
        instance_id: cfg.instance_id.clone(),
        registry: registry.clone(),
        reconciler: reconciler.clone(),
        connector: connector.clone(),
        mirror: mirror.clone(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move { http::serve(state, addr, http_shutdown).await });

    let interrupted = wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    reconciler_task.abort();
    let _ = demux_task.await;
    let _ = supervisor_task.await;
    if let Ok(Err(e)) = http_task.await {
        error!(%e, "http server exited with error");
    }

    info!("shutdown complete");
    Ok(if interrupted { Shutdown::Interrupted } else { Shutdown::Clean })
}

/// Waits for SIGINT or SIGTERM. Returns `true` if the signal was SIGINT
/// (an operator-driven interrupt), `false` for SIGTERM (an orchestrator-
/// driven graceful stop).
async fn wait_for_shutdown_signal() -> bool {
    use tokio::signal;

    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => true,
        _ = terminate => false,
    }
}
