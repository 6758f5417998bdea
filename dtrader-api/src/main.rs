//! dtrader-crypto bridge server
//!
//! Holds one upstream connection to Gate.io and relays its traffic to local
//! WebSocket clients.

mod config;
mod routes;

use axum::{
    http::{header, Method},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

use dtrader_core::EventChannel;
use dtrader_gateio::TungsteniteConnector;
use dtrader_services::Coordinator;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dtrader_api=debug")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Starting dtrader-crypto v{} ({} Gate.io endpoints, namespace {})",
        env!("CARGO_PKG_VERSION"),
        config.coordinator.upstream.urls.len(),
        config.coordinator.upstream.namespace
    );

    let coordinator = Coordinator::new(
        config.coordinator.clone(),
        EventChannel::new(),
        Arc::new(TungsteniteConnector),
    );
    coordinator.start();

    let state = AppState {
        coordinator: Arc::clone(&coordinator),
    };

    // Configure CORS for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // Build router
    let app = Router::new()
        .nest("/api", routes::api_routes())
        .merge(routes::ws_routes())
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(Arc::clone(&coordinator)))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, after the coordinator has stopped
async fn shutdown(coordinator: Arc<Coordinator>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    coordinator.stop().await;
}
