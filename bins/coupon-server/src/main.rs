//! coupon-server: hands out single-use promo codes over HTTP.
//!
//! Serves the claim API at `/api/claim` plus admin endpoints for adding
//! codes. Each visitor is throttled by IP hash and session cookie; claimed
//! codes are recycled by a background sweeper or on exhaustion, depending
//! on `COUPON_RECYCLE_POLICY`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

mod config;
mod routes;

use config::Config;
use coupon_core::coordinator::ClaimCoordinator;
use coupon_node_lib::CouponNode;

/// Shared application state passed to every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Claim coordinator; owns the claim lock and the store handle.
    pub coordinator: Arc<ClaimCoordinator>,
    /// Server configuration.
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load server configuration")?;

    info!(
        db = %config.node.db_path().display(),
        bind = %config.bind_addr,
        cooldown_secs = config.node.cooldown_secs,
        policy = %config.node.policy,
        trust_proxy = config.trust_proxy,
        "Starting coupon-server"
    );
    if config.test_routes {
        warn!("test routes enabled: DELETE /api/cooldowns is exposed");
    }

    let node = CouponNode::open(config.node.clone()).with_context(|| {
        format!(
            "Failed to open code database at {}",
            config.node.db_path().display()
        )
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = node.spawn_sweeper(shutdown_rx);

    let state = AppState {
        coordinator: node.coordinator(),
        config: Arc::new(config.clone()),
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("Listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            warn!("sweeper task ended abnormally: {e}");
        }
    }

    info!("coupon-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
