//! Registration submission client
//!
//! Drives one registration attempt against the relying-party registry:
//! optional trusted-measurement update, optional retire of a stale
//! registration, then fetch-and-register of a fresh attestation.
//!
//! Exit codes distinguish failure classes for operator tooling:
//! `2` environment not ready (missing artifact, unreachable endpoint or
//! proxy, missing credentials), `3` attestation rejected by the relying
//! party, `1` anything else.

use anyhow::Result;
use enclave_relay::config::SubmitConfig;
use enclave_relay::error::EnclaveError;
use enclave_relay::ledger::LedgerRegistry;
use enclave_relay::measurements::MeasurementSet;
use enclave_relay::registry::{RegistrationId, RegistryClient};
use enclave_relay::workflow::RegistrationFlow;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!(class = ?e.class(), error = %e, "Registration run failed");
        std::process::exit(e.exit_code());
    }
    Ok(())
}

async fn run() -> std::result::Result<(), EnclaveError> {
    let config = SubmitConfig::from_env()?;

    // Resolve all preconditions before the first fee-costing call.
    let update_set = config
        .measurements_file
        .as_ref()
        .map(MeasurementSet::from_artifact)
        .transpose()?;
    let retire_id = config.retire_id.as_deref().map(RegistrationId::new);

    let registry = LedgerRegistry::new(config.ledger.clone());
    registry.check_proxy().await?;

    let registry: Arc<dyn RegistryClient> = Arc::new(registry);
    let mut flow = RegistrationFlow::new(
        registry,
        config.attestation_endpoint.clone(),
        config.capability.clone(),
        config.timeout,
    );

    let id = flow
        .run(update_set.as_ref(), retire_id.as_ref())
        .await?;
    info!(registration_id = %id, "Registration complete");
    println!("{}", id);
    Ok(())
}
