//! `HavenChat` Gateway -- development realtime server.
//!
//! An axum server that issues socket tokens over HTTP and serves the `/peer`
//! and `/private-chat` WebSocket namespaces. State is in memory only, which
//! is what client development and integration testing need.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9300
//! cargo run --bin havenchat-gateway
//!
//! # Run on custom address
//! cargo run --bin havenchat-gateway -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! HAVENCHAT_GATEWAY_ADDR=127.0.0.1:8080 cargo run --bin havenchat-gateway
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use havenchat_gateway::config::{GatewayCliArgs, GatewayConfig};
use havenchat_gateway::gateway::{self, GatewayState};
use havenchat_gateway::store::HistoryStore;

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match GatewayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting havenchat gateway");

    let history = HistoryStore::with_max_log_size(config.max_history_per_room);
    let state = Arc::new(GatewayState::with_config(
        Duration::from_secs(config.token_ttl_secs),
        history,
    ));

    match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
