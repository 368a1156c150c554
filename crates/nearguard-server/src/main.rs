//! # nearguard-server
//!
//! HTTP server for the nearguard beacon proximity tracker.
//!
//! This binary provides:
//! - REST API for the tracker's modes, alert commands and battery reads
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, against a simulated beacon
//! cargo run --package nearguard-server --features mock-bluetooth
//!
//! # Production (on the BlueZ host)
//! NEARGUARD_CONFIG=/etc/nearguard/config.toml ./nearguard-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nearguard_core::{Config, LogNotifier, ModeController, Transport};
use nearguard_server::api::create_router;
use nearguard_server::logging;
use nearguard_server::state::AppState;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Environment variable pointing at the configuration file.
const CONFIG_PATH_ENV: &str = "NEARGUARD_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    logging::init(config.server.production)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        production = config.server.production,
        "Starting nearguard-server"
    );

    let transport = build_transport().await?;
    let controller = ModeController::from_config(&config, transport, Box::new(LogNotifier));
    let (handle, tracker) = nearguard_core::spawn(controller);

    let bind_address = config.server.bind_address.clone();
    let state = AppState::new(handle, config);
    let app = create_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last controller handle; the tracker winds down once
    // it is dropped.
    if let Err(err) = tracker.await {
        warn!(%err, "Tracker task ended abnormally");
    }
    info!("nearguard-server stopped");
    Ok(())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn build_transport() -> anyhow::Result<Arc<dyn Transport>> {
    let transport = nearguard_core::BluezTransport::new()
        .await
        .context("Bluetooth adapter unavailable")?;
    Ok(Arc::new(transport))
}

#[cfg(not(all(feature = "bluetooth", not(feature = "mock-bluetooth"))))]
#[allow(clippy::unused_async)]
async fn build_transport() -> anyhow::Result<Arc<dyn Transport>> {
    use std::time::Duration;

    // A beacon drifting out of range and back, one reading per second.
    const WALK: [i16; 12] = [-55, -60, -68, -75, -85, -95, -102, -105, -103, -90, -72, -60];

    warn!("Using the simulated beacon");
    let mock = nearguard_core::MockTransport::new();
    // Runs for the life of the process.
    drop(mock.simulate(WALK.to_vec(), Duration::from_secs(1)));
    Ok(Arc::new(mock))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "Cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
