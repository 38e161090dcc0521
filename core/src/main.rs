/// BadgeSync daemon - main entry point
use badgesync_core::http_api::{start_control_api, ControlApi};
use badgesync_core::{Config, NotificationSession};
use std::env;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let session = NotificationSession::with_http(&config);
    info!("🚀 Starting BadgeSync daemon");
    info!("   Session ID: {}", session.id);
    info!("   Server: {}", config.server_url);

    let control = ControlApi::new(session.clone());
    session.set_navigation_ref(control.navigator());

    let api_handle = {
        let addr = config.api_addr;
        tokio::spawn(async move {
            if let Err(e) = start_control_api(control, addr).await {
                error!("Control API stopped: {}", e);
            }
        })
    };

    let poller_handle = if config.enable_polling {
        let session = session.clone();
        Some(tokio::spawn(async move { session.run_poller().await }))
    } else {
        None
    };

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    session.shutdown().await;
    api_handle.abort();
    if let Some(handle) = poller_handle {
        // The poller notices shutdown on its next tick; don't wait a full interval
        handle.abort();
    }

    info!("BadgeSync stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
