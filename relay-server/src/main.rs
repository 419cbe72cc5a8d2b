//! SyncWatch - Session Relay
//!
//! WebSocket session registry and signaling relay with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode

mod config;
mod dashboard;
mod metrics;
mod registry;
mod server;

use parking_lot::RwLock;
use std::sync::Arc;
use syncwatch_core::checkpoint::FileCheckpointStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    let config = config::RelayConfig::from_env();
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone()));
    let registry = Arc::new(registry::SessionRegistry::new(store));

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(config, registry, metrics).await
    } else {
        // Run with plain logging
        server::run_with_logging(config, registry, metrics).await
    }
}
