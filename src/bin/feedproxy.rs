//! feedproxy runtime
//!
//! Scans the repository directory for received containers and forwards them
//! to file-system destinations until CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin feedproxy
//!
//! Configuration is read from the environment (see `ProxyRepoConfig::from_env`).
//! Logging defaults to `info`; override with RUST_LOG.

use dotenv::dotenv;
use feedproxy::repo::destinations::FileForwardDestinations;
use feedproxy::ProxyRepoConfig;
use feedproxy::ProxyRepo;
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 feedproxy v{}", env!("CARGO_PKG_VERSION"));

    let config = ProxyRepoConfig::from_env();
    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        return Err(e.into());
    }
    config.log_summary();

    let destinations = Arc::new(FileForwardDestinations::new(&config.forward_dir));
    let failure_destinations = Arc::new(FileForwardDestinations::new(&config.failed_forward_dir));

    let mut repo = ProxyRepo::open(config, destinations, failure_destinations)?;
    repo.start()?;

    info!("🔄 Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    repo.stop().await;
    info!("✅ feedproxy stopped");
    Ok(())
}
