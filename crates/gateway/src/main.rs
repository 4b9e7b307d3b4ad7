//! Gateway service entry point.
//!
//! Key/value sync gateway with real-time change fan-out over WebSocket.

use anyhow::{Context, Result};
use gateway::{create_router, AppState, FanoutHub, GatewayConfig, GatewayService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use store_client::HttpStoreClient;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {:?}", config.metrics_port);
    info!("  STORE_URL: {}", config.store_url);
    info!("  STORE_TIMEOUT: {:?}", config.store_timeout);
    info!("  STORE_RETRIES: {}", config.store_retries);
    info!("  BACKLOG_CAPACITY: {}", config.backlog_capacity);
    info!("  SUBSCRIBER_BUFFER: {}", config.subscriber_buffer);
    info!("  DELIVERY_TIMEOUT: {:?}", config.delivery_timeout);

    // Start Prometheus metrics server
    if let Some(metrics_port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics_port))
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", metrics_port);
    }

    let store = Arc::new(HttpStoreClient::new(config.store_client())?);
    info!("Store client targeting {}", store.base_url());

    let hub = Arc::new(FanoutHub::new(config.backlog_capacity, config.subscriber_buffer));
    let service = Arc::new(GatewayService::new(store, hub.clone()));

    // Create application state
    let http_port = config.http_port;
    let state = Arc::new(AppState { service, config });

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {:?}", e);
        return Err(e.into());
    }

    info!(
        "Gateway stopped at sequence {} with {} subscribers",
        hub.current_sequence(),
        hub.registry().len()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
