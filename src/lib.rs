//! HLS Relay - live camera streams as rolling HLS playlists.
//!
//! This is the main library crate. It wires the configuration, the stream
//! supervisor and the HTTP layer together.

pub mod capture;
pub mod commands;
pub mod encoder;
pub mod registry;
pub mod supervisor;
pub mod utils;

use anyhow::Context;
use commands::AppState;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{FfmpegBackend, StreamSupervisor, SupervisorOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::AppConfig;

/// How often pipelines that died on their own are collected
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Initialize the tracing subscriber
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hls_relay={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the relay until Ctrl-C or SIGTERM
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.log_level);

    tracing::info!("Starting HLS Relay v{}", env!("CARGO_PKG_VERSION"));

    if !utils::process::tool_available(&config.ffmpeg_bin) {
        tracing::warn!(
            "{:?} is not runnable; streams will fail to start",
            config.ffmpeg_bin
        );
    }

    let backend = Arc::new(FfmpegBackend::from_config(&config));
    let store = registry::RegistryStore::new(&config.registry_path);
    let (supervisor, report) =
        StreamSupervisor::start(SupervisorOptions::from_config(&config), store, backend).await?;
    for (id, reason) in &report.skipped {
        tracing::warn!("Stream {} not started: {}", id, reason);
    }

    let supervisor = Arc::new(supervisor);
    let reaper = spawn_reaper(supervisor.clone());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, commands::router(AppState::new(supervisor.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    reaper.abort();

    tracing::info!("Stopping all streams");
    let report = supervisor.shutdown_all().await;
    for (id, error) in &report.failures {
        tracing::warn!("Stream {} did not shut down cleanly: {}", id, error);
    }

    Ok(())
}

/// Periodically drop pipelines whose worker ended on its own
fn spawn_reaper(supervisor: Arc<StreamSupervisor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            for (id, exit) in supervisor.reap_finished().await {
                tracing::debug!("Reaped stream {}: {}", id, exit);
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
