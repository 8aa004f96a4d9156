//! message-relay: an in-memory message and key relay server
//!
//! Clients connect over TCP and use a line-oriented text protocol to:
//! - Store and list per-user messages (subject + body)
//! - Store and fetch a per-user key
//! - Reset all state
//!
//! Features:
//! - Single-threaded epoll/kqueue event loop
//! - Payloads reassembled across reads without blocking other clients
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;
mod storage;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        "Starting message-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
