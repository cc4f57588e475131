//! vmgate server entry point.
//!
//! Initialises tracing, loads configuration from `VMGATE_*` environment
//! variables, warms the VM directory, starts its supervised refresher and
//! serves the HTTP surface until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vmgate_common::GatewayConfig;
use vmgate_server::audit::CsvAuditLog;
use vmgate_server::command_runner::TokioCommandRunner;
use vmgate_server::directory::scheduler::{RestartPolicy, spawn_refresher};
use vmgate_server::gcloud::GcloudCli;
use vmgate_server::http::router;
use vmgate_server::state::AppState;

// ===================================================================
// Entry point
// ===================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialise tracing with RUST_LOG env filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vmgate starting");

    // 2. Load configuration from VMGATE_* env vars.
    let config: GatewayConfig = envy::prefixed("VMGATE_")
        .from_env()
        .context("failed to load config from VMGATE_* env vars")?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        allowed_vms = config.allowed_vms.len(),
        snapshot = %config.snapshot_path.display(),
        audit_dir = %config.audit_dir.display(),
        max_age_secs = config.cache_max_age_secs,
        "configuration loaded",
    );

    // 3. Wire the components.
    let cli = Arc::new(GcloudCli::from_config(&config, Arc::new(TokioCommandRunner)));
    let audit = Arc::new(CsvAuditLog::new(config.audit_dir.clone()));
    let state = Arc::new(AppState::new(&config, cli, audit));

    // 4. Warm the directory before accepting traffic.
    state.directory.initialize().await;
    let refresher = spawn_refresher(Arc::clone(&state.directory), RestartPolicy::default());

    // ===================================================================
    // Serve
    // ===================================================================

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let served = axum::serve(
        listener,
        router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error");

    state.directory.shutdown(refresher).await;
    tracing::info!("vmgate shut down");
    served
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("received shutdown signal");
}
