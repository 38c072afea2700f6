//! Ledger-backed registry client
//!
//! Drives the relying-party registry contract through the host-side
//! ledger-CLI proxy: a small HTTP service on the parent instance that
//! shells out to the chain CLI, since the enclave itself has no wallet
//! and no direct network path. The proxy contract is
//! `POST /ledger/call` with the move-call description and a
//! `{success, stdout, stderr, returncode}` envelope back, plus
//! `GET /ledger/object/<id>` for state read-back and `GET /health`.
//!
//! All three privileged operations pass the capability object explicitly;
//! the contract enforces it, this client just carries it.

use crate::attestation::AttestationDocument;
use crate::error::{EnclaveError, Result};
use crate::http::HttpChannel;
use crate::measurements::MeasurementSet;
use crate::registry::{CapabilityToken, RegistrationId, RegistrationRecord, RegistryClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

/// Contract module holding the registry.
const REGISTRY_MODULE: &str = "enclave_registry";

/// Object type marker for minted registrations in transaction output.
const ENCLAVE_TYPE_MARKER: &str = "::enclave_registry::Enclave";

/// Default fee budget per call.
pub const DEFAULT_GAS_BUDGET: u64 = 10_000_000;

/// Configuration for the ledger proxy connection and contract addresses.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Proxy authority, `host:port`
    pub proxy_addr: String,
    /// Published package id of the registry contract
    pub package_id: String,
    /// Shared registry object (the trusted-configuration resource)
    pub registry_id: String,
    /// Fee budget per call
    pub gas_budget: u64,
    /// Per-call deadline
    pub timeout: Duration,
}

// No Debug: args carry the capability object id.
#[derive(Serialize)]
struct CallRequest {
    package_id: String,
    module: String,
    function: String,
    args: Vec<String>,
    gas_budget: String,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    success: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    returncode: i32,
}

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    success: bool,
    #[serde(default)]
    object: Option<ObjectContent>,
}

#[derive(Debug, Deserialize)]
struct ObjectContent {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    public_key: String,
    #[serde(default)]
    pcr0: String,
    #[serde(default)]
    pcr1: String,
    #[serde(default)]
    pcr2: String,
    #[serde(default)]
    registered_at_ms: u64,
}

/// Registry client backed by the on-chain contract via the host proxy.
pub struct LedgerRegistry {
    channel: HttpChannel,
    config: LedgerConfig,
}

impl LedgerRegistry {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            channel: HttpChannel::new(config.proxy_addr.clone(), config.timeout),
            config,
        }
    }

    /// Checks the proxy is up before spending fees on calls.
    pub async fn check_proxy(&self) -> Result<()> {
        let (status, _) = self.channel.get("/health").await?;
        if status != 200 {
            return Err(EnclaveError::Ledger(format!(
                "ledger proxy at {} unhealthy: HTTP {}",
                self.channel.authority(),
                status
            )));
        }
        Ok(())
    }

    /// Executes one move call through the proxy and returns its stdout.
    async fn call(&self, function: &str, args: Vec<String>) -> Result<String> {
        let request = CallRequest {
            package_id: self.config.package_id.clone(),
            module: REGISTRY_MODULE.to_string(),
            function: function.to_string(),
            args,
            gas_budget: self.config.gas_budget.to_string(),
        };

        info!(function, "Submitting ledger call");
        let (status, body) = self.channel.post_json("/ledger/call", &request).await?;
        if status != 200 {
            return Err(EnclaveError::Ledger(format!(
                "ledger proxy returned HTTP {} for {}",
                status, function
            )));
        }

        let response: CallResponse = serde_json::from_slice(&body).map_err(|e| {
            EnclaveError::Ledger(format!("malformed proxy response for {}: {}", function, e))
        })?;

        if !response.success {
            // The CLI ran and the contract (or its preflight) said no:
            // that is a rejection to surface, not a retry candidate.
            error!(
                function,
                returncode = response.returncode,
                stderr = %response.stderr,
                "Ledger call rejected"
            );
            return Err(EnclaveError::Validation(format!(
                "{} rejected (exit {}): {}",
                function,
                response.returncode,
                summarize(&response.stderr, &response.stdout)
            )));
        }

        Ok(response.stdout)
    }

    async fn fetch_object(&self, id: &str) -> Result<Option<ObjectContent>> {
        let path = format!("/ledger/object/{}", id);
        let (status, body) = self.channel.get(&path).await?;
        if status == 404 {
            return Ok(None);
        }
        if status != 200 {
            return Err(EnclaveError::Ledger(format!(
                "object query for {} returned HTTP {}",
                id, status
            )));
        }
        let response: ObjectResponse = serde_json::from_slice(&body).map_err(|e| {
            EnclaveError::Ledger(format!("malformed object response for {}: {}", id, e))
        })?;
        if !response.success {
            return Ok(None);
        }
        Ok(response.object)
    }
}

#[async_trait]
impl RegistryClient for LedgerRegistry {
    async fn update_measurements(
        &self,
        capability: &CapabilityToken,
        set: &MeasurementSet,
    ) -> Result<()> {
        self.call(
            "update_pcrs",
            vec![
                self.config.registry_id.clone(),
                capability.expose().to_string(),
                hex::encode(set.pcr0()),
                hex::encode(set.pcr1()),
                hex::encode(set.pcr2()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn register(
        &self,
        capability: &CapabilityToken,
        document: &AttestationDocument,
    ) -> Result<RegistrationId> {
        let document_hex = hex::encode(serde_json::to_vec(document)?);
        let stdout = self
            .call(
                "register_enclave",
                vec![
                    self.config.registry_id.clone(),
                    capability.expose().to_string(),
                    document_hex,
                ],
            )
            .await?;

        extract_created_object(&stdout, ENCLAVE_TYPE_MARKER)
            .map(RegistrationId::new)
            .ok_or_else(|| {
                EnclaveError::Ledger(
                    "register_enclave succeeded but no registration object in output".to_string(),
                )
            })
    }

    async fn retire(&self, capability: &CapabilityToken, id: &RegistrationId) -> Result<()> {
        let result = self
            .call(
                "destroy_enclave",
                vec![
                    id.as_str().to_string(),
                    self.config.registry_id.clone(),
                    capability.expose().to_string(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Retire is idempotent: an id the chain no longer knows is
            // already the desired end state.
            Err(EnclaveError::Validation(msg)) if is_already_gone(&msg) => {
                warn!(registration_id = %id, "Retire of already-gone registration");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn registration(&self, id: &RegistrationId) -> Result<Option<RegistrationRecord>> {
        let object = match self.fetch_object(id.as_str()).await? {
            Some(object) => object,
            None => return Ok(None),
        };

        let decode = |name: &str, s: &str| -> Result<Vec<u8>> {
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| EnclaveError::Ledger(format!("object field {}: {}", name, e)))
        };
        let measurements = MeasurementSet::new(
            &decode("pcr0", &object.pcr0)?,
            &decode("pcr1", &object.pcr1)?,
            &decode("pcr2", &object.pcr2)?,
        )?;

        Ok(Some(RegistrationRecord {
            id: id.clone(),
            public_key: decode("public_key", &object.public_key)?,
            measurements,
            registered_at_ms: object.registered_at_ms,
            active: object.active,
        }))
    }

    async fn trusted_measurements(&self) -> Result<Option<MeasurementSet>> {
        let object = match self.fetch_object(&self.config.registry_id).await? {
            Some(object) => object,
            None => return Ok(None),
        };
        if object.pcr0.is_empty() {
            return Ok(None);
        }
        let decode = |name: &str, s: &str| -> Result<Vec<u8>> {
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| EnclaveError::Ledger(format!("registry field {}: {}", name, e)))
        };
        Ok(Some(MeasurementSet::new(
            &decode("pcr0", &object.pcr0)?,
            &decode("pcr1", &object.pcr1)?,
            &decode("pcr2", &object.pcr2)?,
        )?))
    }
}

fn summarize(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let mut summary: String = text.trim().chars().take(500).collect();
    if summary.is_empty() {
        summary.push_str("(no output)");
    }
    summary
}

fn is_already_gone(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("deleted")
        || lower.contains("notexists")
}

/// Extracts the id of a created object of the given type from CLI
/// transaction output: an `ObjectID:` line followed within a few lines by
/// the matching `ObjectType:`.
fn extract_created_object(output: &str, type_marker: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !(line.contains("ObjectID:") && line.contains("0x")) {
            continue;
        }
        let start = line.find("0x")?;
        let id_part = &line[start..];
        let object_id = match id_part.find(char::is_whitespace) {
            Some(end) => &id_part[..end],
            None => id_part.trim(),
        };

        for next_line in lines.iter().skip(i + 1).take(4) {
            if next_line.contains("ObjectType:") && next_line.contains(type_marker) {
                return Some(object_id.to_string());
            }
            if next_line.contains("ObjectID:") {
                break;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_OUTPUT: &str = "\
Transaction executed successfully\n\
Created Objects:\n\
 | ObjectID: 0x1f2e3d4c5b6a79880102030405060708090a0b0c0d0e0f101112131415161718 \n\
 | Sender: 0xaaaa\n\
 | ObjectType: 0xpkg::enclave_registry::Enclave \n\
 | ObjectID: 0xffff000000000000000000000000000000000000000000000000000000000000 \n\
 | ObjectType: 0x2::coin::Coin<0x2::sui::SUI> \n";

    #[test]
    fn test_extract_created_object() {
        let id = extract_created_object(SAMPLE_OUTPUT, ENCLAVE_TYPE_MARKER).unwrap();
        assert_eq!(
            id,
            "0x1f2e3d4c5b6a79880102030405060708090a0b0c0d0e0f101112131415161718"
        );
    }

    #[test]
    fn test_extract_ignores_other_types() {
        assert!(extract_created_object(SAMPLE_OUTPUT, "::other::Thing").is_none());
        assert!(extract_created_object("no objects here", ENCLAVE_TYPE_MARKER).is_none());
    }

    #[test]
    fn test_already_gone_detection() {
        assert!(is_already_gone("Error: object 0xabc NotExists"));
        assert!(is_already_gone("object was deleted at version 3"));
        assert!(!is_already_gone("insufficient gas"));
    }

    #[test]
    fn test_call_request_shape() {
        let request = CallRequest {
            package_id: "0xpkg".into(),
            module: REGISTRY_MODULE.into(),
            function: "update_pcrs".into(),
            args: vec!["0xreg".into(), "0xcap".into()],
            gas_budget: DEFAULT_GAS_BUDGET.to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"module\":\"enclave_registry\""));
        assert!(json.contains("\"gas_budget\":\"10000000\""));
    }
}
