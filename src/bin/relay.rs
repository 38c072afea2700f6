//! Host-side forwarding relay
//!
//! Binds the operator-supplied static route table and relays bytes until
//! process exit. Routes come from `RELAY_ROUTES` (inline) or
//! `RELAY_ROUTES_FILE`; there is no runtime add/remove.

use anyhow::Result;
use enclave_relay::config::RelayConfig;
use enclave_relay::relay::Relay;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;
    info!(routes = config.routes.len(), "Starting forwarding relay");

    let relay = Relay::bind(config.routes).await?;
    relay.serve().await?;
    Ok(())
}
