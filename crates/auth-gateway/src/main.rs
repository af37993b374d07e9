//! Auth Gateway
//!
//! Standalone service-token daemon: keeps the gateway's service token renewed
//! until shutdown.

use anyhow::Context;
use auth_gateway::{AuthGateway, GatewayConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Auth Gateway");

    let config = GatewayConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        server = config.server.as_deref().unwrap_or("<unset>"),
        client_id = config.client_id.as_deref().unwrap_or("<unset>"),
        attr_id = %config.attr_id,
        auto_renew_token = config.auto_renew_token,
        "Configuration loaded successfully"
    );

    let gateway = AuthGateway::new(config).context("Failed to build auth gateway")?;

    let cancel = CancellationToken::new();
    let Some(renewal) = gateway.spawn_renewal(cancel.clone()) else {
        warn!("Service token renewal not running, nothing to do");
        return Ok(());
    };

    shutdown_signal().await;

    cancel.cancel();
    if let Err(e) = renewal.await {
        error!("Renewal task failed: {}", e);
    }

    info!("Auth Gateway shutdown complete");

    Ok(())
}

/// `RUST_LOG` filter (default `auth_gateway=info`); JSON output when
/// `AUTH_GATEWAY_LOG_JSON=true`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "auth_gateway=info".into());
    let json = std::env::var("AUTH_GATEWAY_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, shutting down..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, shutting down...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
