use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use holohub_sync::agent::{
    client::HttpDeviceApi,
    config::{AgentCli, AgentConfig},
    display::{DisplayBackend, ExternalViewerDisplay, SimulatedDisplay},
    Agent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holohub_sync=debug,agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::load(AgentCli::parse())?;
    tracing::info!(
        "=== HoloHub agent starting ({}, {}) ===",
        config.display_type,
        if config.simulation_mode { "simulation" } else { "production" }
    );

    let backend: Box<dyn DisplayBackend> = match (&config.viewer_command, config.simulation_mode) {
        (Some(command), false) => Box::new(ExternalViewerDisplay::new(command, config.display_type)?),
        _ => Box::new(SimulatedDisplay::default()),
    };
    let api = HttpDeviceApi::new(&config.api_base_url, config.api_timeout())?;
    let mut agent = Agent::new(config, api, backend).await?;

    if let Err(e) = agent.run(shutdown_signal()).await {
        // Parked: don't exit, or a supervisor would restart us into the same fault.
        tracing::error!("Agent stopped: {}. Waiting for an operator.", e);
        shutdown_signal().await;
    }
    tracing::info!("Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
