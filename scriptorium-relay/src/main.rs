//! Scriptorium signal relay: a standalone WebSocket server that forwards
//! session signals between peers.
//!
//! Configured from `SCRIPTORIUM_RELAY_*` environment variables; the first
//! argument, if given, overrides the bind address. Logging follows
//! `RUST_LOG`.

use log::info;
use scriptorium_collab::{RelayConfig, SignalRelay};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let mut config = RelayConfig::from_env();
    // First argument overrides the bind address
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    info!("Starting Scriptorium signal relay...");
    let relay = SignalRelay::new(config);

    tokio::select! {
        result = relay.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats();
            info!(
                "Shutting down: {} connection(s) served, {} signal(s) routed, {} dropped",
                stats.total_connections, stats.routed, stats.dropped
            );
            Ok(())
        }
    }
}
