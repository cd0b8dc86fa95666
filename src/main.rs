//! chat-relay: a broadcast chat relay over TCP
//!
//! Clients speak a length-framed protocol: a 4-byte decimal header
//! followed by that many body bytes. Every frame a client sends is
//! broadcast to all connected clients, including the sender, and the
//! most recent messages are replayed to each new connection.
//!
//! Features:
//! - One shared room across any number of listening ports
//! - Bounded in-memory history replayed to late joiners
//! - Selectable runtime backend (tokio executor or mio event loop)
//! - Configuration via CLI arguments or TOML file

mod config;
mod history;
mod protocol;
mod room;
mod runtime;
mod server;

use config::{Config, RuntimeType};
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
        ports = ?config.ports,
        runtime = ?config.runtime,
        history_capacity = config.history_capacity,
        "Starting chat-relay server"
    );

    match config.runtime {
        RuntimeType::Tokio => run_tokio(config),
        RuntimeType::Mio => run_mio(config),
    }
}

/// Run on the multi-threaded async executor
fn run_tokio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let server = server::Server::new(config);
    rt.block_on(server.run())
}

/// Run on the single-threaded readiness loop
fn run_mio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    runtime::run(config)?;
    Ok(())
}
