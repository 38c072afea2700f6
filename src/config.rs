//! Runtime configuration
//!
//! Configuration is loaded from the environment at startup; there is no
//! runtime reconfiguration surface. A missing required variable is an
//! environment error naming the variable, so "environment not ready"
//! fails before any fee-costing call is made.
//!
//! ## Environment Variables
//!
//! | Variable | Used by | Description | Default |
//! |----------|---------|-------------|---------|
//! | `VSOCK_PORT` | enclave-server | vsock port for the endpoint | `4000` |
//! | `PORT` | enclave-server | TCP port in development mode | `4000` |
//! | `USE_VSOCK` | enclave-server | force vsock outside an enclave | unset |
//! | `RELAY_ROUTES` | host-relay | `;`-separated `listen=connect` routes | — |
//! | `RELAY_ROUTES_FILE` | host-relay | file with one route per line | — |
//! | `ATTESTATION_ENDPOINT` | register-enclave | enclave endpoint `host:port` | — |
//! | `LEDGER_PROXY_ADDR` | register-enclave | ledger proxy `host:port` | — |
//! | `PACKAGE_ID` | register-enclave | registry contract package | — |
//! | `REGISTRY_ID` | register-enclave | trusted-configuration object | — |
//! | `CAP_ID` | register-enclave | capability object id | — |
//! | `MEASUREMENTS_FILE` | register-enclave | PCR artifact; enables update | unset |
//! | `RETIRE_ID` | register-enclave | stale registration to retire | unset |
//! | `GAS_BUDGET` | register-enclave | fee budget per call | `10000000` |
//! | `SUBMIT_TIMEOUT_SECS` | register-enclave | per-call deadline | `30` |

use crate::error::{EnclaveError, Result};
use crate::ledger::{LedgerConfig, DEFAULT_GAS_BUDGET};
use crate::registry::CapabilityToken;
use crate::relay::{parse_routes, Route};
use std::path::PathBuf;
use std::time::Duration;

fn required(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| EnclaveError::Config(format!("{} is not set", name)))
        .and_then(|v| {
            if v.trim().is_empty() {
                Err(EnclaveError::Config(format!("{} is empty", name)))
            } else {
                Ok(v)
            }
        })
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EnclaveError::Config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Configuration for the enclave-server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub vsock_port: u32,
    pub tcp_port: u16,
    pub force_vsock: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            vsock_port: parsed("VSOCK_PORT", 4000)?,
            tcp_port: parsed("PORT", 4000)?,
            force_vsock: std::env::var("USE_VSOCK").is_ok(),
        })
    }
}

/// Configuration for the host-relay binary.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub routes: Vec<Route>,
}

impl RelayConfig {
    /// Loads the static route table from `RELAY_ROUTES` (inline,
    /// `;`-separated) or `RELAY_ROUTES_FILE` (one route per line).
    pub fn from_env() -> Result<Self> {
        if let Ok(inline) = std::env::var("RELAY_ROUTES") {
            let routes = inline
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<Route>>>()?;
            return Ok(Self { routes });
        }

        let path = PathBuf::from(required("RELAY_ROUTES_FILE").map_err(|_| {
            EnclaveError::Config("neither RELAY_ROUTES nor RELAY_ROUTES_FILE is set".to_string())
        })?);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            EnclaveError::Config(format!("cannot read route file {}: {}", path.display(), e))
        })?;
        Ok(Self {
            routes: parse_routes(&text)?,
        })
    }
}

/// Configuration for the register-enclave binary.
#[derive(Debug)]
pub struct SubmitConfig {
    /// Enclave attestation endpoint, `host:port` (through the relay)
    pub attestation_endpoint: String,
    /// Ledger proxy and contract addresses
    pub ledger: LedgerConfig,
    /// Capability for the registry resources
    pub capability: CapabilityToken,
    /// PCR artifact path; present means "update trusted measurements"
    pub measurements_file: Option<PathBuf>,
    /// Stale registration to retire before registering
    pub retire_id: Option<String>,
    /// Per-call deadline
    pub timeout: Duration,
}

impl SubmitConfig {
    pub fn from_env() -> Result<Self> {
        let timeout = Duration::from_secs(parsed("SUBMIT_TIMEOUT_SECS", 30u64)?);
        Ok(Self {
            attestation_endpoint: required("ATTESTATION_ENDPOINT")?,
            ledger: LedgerConfig {
                proxy_addr: required("LEDGER_PROXY_ADDR")?,
                package_id: required("PACKAGE_ID")?,
                registry_id: required("REGISTRY_ID")?,
                gas_budget: parsed("GAS_BUDGET", DEFAULT_GAS_BUDGET)?,
                timeout,
            },
            capability: CapabilityToken::new(required("CAP_ID")?),
            measurements_file: std::env::var("MEASUREMENTS_FILE").ok().map(PathBuf::from),
            retire_id: std::env::var("RETIRE_ID").ok(),
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests touch process-global state; each test uses its own
    // variable names via the helpers directly.

    #[test]
    fn test_required_missing_names_variable() {
        std::env::remove_var("ENCLAVE_RELAY_TEST_MISSING");
        let err = required("ENCLAVE_RELAY_TEST_MISSING").unwrap_err();
        assert!(err.to_string().contains("ENCLAVE_RELAY_TEST_MISSING"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_parsed_default_and_invalid() {
        std::env::remove_var("ENCLAVE_RELAY_TEST_PORT");
        assert_eq!(parsed("ENCLAVE_RELAY_TEST_PORT", 4000u32).unwrap(), 4000);

        std::env::set_var("ENCLAVE_RELAY_TEST_PORT_BAD", "not-a-number");
        let err = parsed::<u32>("ENCLAVE_RELAY_TEST_PORT_BAD", 0).unwrap_err();
        assert!(err.to_string().contains("ENCLAVE_RELAY_TEST_PORT_BAD"));
        std::env::remove_var("ENCLAVE_RELAY_TEST_PORT_BAD");
    }
}
