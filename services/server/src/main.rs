use mp_core::clock::SystemClock;
use mp_core::fleet::SysinfoSampler;
use mp_core::store::MemoryStore;
use mp_core::{Core, CoreConfig, CoreDeps};
use server::auth::GuestAuth;
use server::collab::{LoggingHistory, LoggingReports, OpenDirectory};
use server::metrics::SnapshotMetrics;
use server::state::AppState;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let friends_open = env::var("FRIENDS_OPEN").map(|v| v == "1").unwrap_or(false);
    let config = CoreConfig::from_env();

    let (host, port) = match bind_addr.rsplit_once(':') {
        Some((host, port)) => (
            host.to_owned(),
            port.parse::<u16>().expect("BIND_ADDR port must be numeric"),
        ),
        None => (bind_addr.clone(), 8080),
    };

    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(SnapshotMetrics::new());
    let directory = Arc::new(OpenDirectory::new(friends_open));
    let core = Core::new(CoreDeps {
        store: Arc::new(MemoryStore::new(clock.clone())),
        clock,
        metrics: metrics.clone(),
        auth: Arc::new(GuestAuth),
        directory: directory.clone(),
        reports: Arc::new(LoggingReports),
        history: Arc::new(LoggingHistory),
        sampler: Arc::new(SysinfoSampler::new()),
        config: config.clone(),
        host,
        port,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = core.start_background(shutdown_rx).await;

    let state = AppState::new(core.clone(), metrics, directory);
    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    // Stop accepting happened above; now drain the rest within the grace
    // window.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    core.shutdown().await;
    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("background tasks did not stop within the grace window");
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
