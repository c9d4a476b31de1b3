//! # Tether Server
//!
//! Bridges WebSocket sessions onto a single MQTT broker connection.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads ./tether.toml if present)
//! tether
//!
//! # Run with a specific config file
//! TETHER_CONFIG=/path/to/tether.toml tether
//!
//! # Override individual settings
//! TETHER_PORT=8080 TETHER_AUTH__SECRET=change-me tether
//! ```

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
