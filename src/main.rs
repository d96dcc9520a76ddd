use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use holohub_sync::{build_router, config::ServerConfig, db, heartbeat::StatusSweeper, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holohub_sync=debug,server=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("=== HoloHub fleet sync server starting ===");

    let config = ServerConfig::from_env()?;

    // Database
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database ready");

    let threshold = config.offline_threshold();
    tracing::info!(
        "Heartbeat interval {}s, offline after {}s",
        config.heartbeat_interval_secs,
        threshold.as_secs()
    );

    let state = Arc::new(AppState::new(pool.clone(), config.clone()));

    // Online/offline transitions for the dashboard
    StatusSweeper::new(pool, state.event_tx.clone(), threshold)
        .spawn(Duration::from_secs(config.status_sweep_secs.max(1)));

    // Build router
    let app = build_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
