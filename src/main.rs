//! Enclave attestation server
//!
//! The in-enclave process: generates the ephemeral signing keypair at
//! startup and serves the local attestation endpoint.
//!
//! # Modes
//!
//! - **vsock** (production): auto-selected inside an enclave, or forced
//!   with `USE_VSOCK=1`. Reachable only through the host relay.
//! - **TCP** (development): default outside an enclave, port `PORT`.

use anyhow::Result;
use enclave_relay::config::ServerConfig;
use enclave_relay::enclave::EnclaveServer;
use enclave_relay::rpc::RpcHandler;
use enclave_relay::server::{serve_tcp, serve_vsock, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
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

    info!("Starting enclave attestation server...");

    let config = ServerConfig::from_env()?;

    // Key generation failure is startup-blocking: a server without a
    // usable entropy source must not come up.
    let enclave = Arc::new(EnclaveServer::new()?);
    let in_enclave = !enclave.is_local_mode();

    let state = Arc::new(AppState {
        rpc_handler: RpcHandler::new(Arc::clone(&enclave)),
    });

    if in_enclave || config.force_vsock {
        info!(
            port = config.vsock_port,
            enclave_detected = in_enclave,
            "Running vsock server"
        );
        serve_vsock(state, config.vsock_port).await?;
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.tcp_port));
        let listener = TcpListener::bind(addr).await?;
        serve_tcp(state, listener).await?;
    }

    Ok(())
}
