//! Dockyard webhook receiver binary.
//!
//! Usage: `dockyard [CONFIG_FILE]`. Without an argument `dockyard.toml` in the
//! working directory is read if present; `DOCKYARD_*` variables override it.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dockyard::{api, ProjectRegistry, RegistrySource, ServiceConfig, SystemRunner};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::load()?,
    };

    let log_file = open_log_file(&config.paths.log_file)?;
    init_tracing(log_file)?;

    info!("Dockyard webhook receiver starting");
    info!(
        listen = %config.server.listen_addr,
        hosting_dir = %config.paths.hosting_dir.display(),
        projects_dir = %config.paths.projects_dir.display(),
        lock_dir = %config.paths.lock_dir.display(),
        mode = ?config.webhook.mode,
        "configuration loaded"
    );
    if config.uses_placeholder_secret() {
        warn!("webhook secret is the built-in placeholder; set DOCKYARD_WEBHOOK__SECRET");
    }

    let registry = ProjectRegistry::load(RegistrySource::new(
        &config.paths.projects_dir,
        &config.paths.hosting_dir,
        &config.webhook.default_branch,
    ))?;

    let listen_addr = config.server.listen_addr;
    let state = Arc::new(api::AppState::new(
        config,
        Arc::new(registry),
        Arc::new(SystemRunner),
    ));
    let app = api::router(Arc::clone(&state));

    let cancel = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "webhook receiver listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    // Deployments are never interrupted; let in-flight ones finish and unlock.
    state.tasks.close();
    if !state.tasks.is_empty() {
        info!(
            in_flight = state.tasks.len(),
            "waiting for running deployments to finish"
        );
    }
    state.tasks.wait().await;

    info!("Dockyard shutdown complete");
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_tracing(log_file: File) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env().add_directive("dockyard=info".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(log_file)))
        .try_init()?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
