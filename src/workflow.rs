//! Registration workflow
//!
//! The submission client's state machine:
//!
//! ```text
//! INIT -> (optional) MEASUREMENTS_UPDATED -> ATTESTED -> REGISTERED
//! ```
//!
//! with an independent retire side path for decommissioning a prior
//! registration. The state is an explicit tagged value carried by the
//! flow, not a sequence of side effects: after a partial failure the flow
//! is re-run from the last completed state rather than from scratch.
//!
//! The flow is intentionally single-writer: every transition takes
//! `&mut self`, and one process drives one flow. Concurrent registration
//! attempts for the same enclave identity would race retire/register
//! ordering at the relying party and must be serialized by the operator.

use crate::attestation::AttestationDocument;
use crate::error::{EnclaveError, Result};
use crate::http::HttpChannel;
use crate::measurements::MeasurementSet;
use crate::registry::{CapabilityToken, RegistrationId, RegistryClient};
use crate::retry::{self, Backoff};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default deadline for each network call in the flow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the registration attempt currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationState {
    Init,
    MeasurementsUpdated,
    Attested(AttestationDocument),
    Registered(RegistrationId),
}

impl RegistrationState {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Init => "INIT",
            RegistrationState::MeasurementsUpdated => "MEASUREMENTS_UPDATED",
            RegistrationState::Attested(_) => "ATTESTED",
            RegistrationState::Registered(_) => "REGISTERED",
        }
    }
}

/// Drives one registration attempt against the relying party.
pub struct RegistrationFlow {
    registry: Arc<dyn RegistryClient>,
    endpoint: HttpChannel,
    capability: CapabilityToken,
    timeout: Duration,
    state: RegistrationState,
}

impl RegistrationFlow {
    /// Creates a flow in `INIT` talking to the enclave attestation
    /// endpoint at `endpoint_addr` (usually a relay-forwarded host port).
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        endpoint_addr: impl Into<String>,
        capability: CapabilityToken,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            endpoint: HttpChannel::new(endpoint_addr, timeout),
            capability,
            timeout,
            state: RegistrationState::Init,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    fn expect_state(&self, wanted: &[&'static str], operation: &str) -> Result<()> {
        if wanted.contains(&self.state.name()) {
            Ok(())
        } else {
            Err(EnclaveError::Config(format!(
                "{} requires state {}, flow is in {}",
                operation,
                wanted.join(" or "),
                self.state.name()
            )))
        }
    }

    /// Wraps a registry call in the flow deadline. On timeout nothing is
    /// assumed about the submission: the ledger may have applied it, so
    /// the caller re-queries before retrying.
    async fn deadline<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            EnclaveError::Transient(format!(
                "{} timed out after {:?}; re-query registry state before retrying",
                operation, self.timeout
            ))
        })?
    }

    /// Pushes the measurement set for the new build as the trusted
    /// configuration. `INIT -> MEASUREMENTS_UPDATED`. Already-existing
    /// registrations are unaffected.
    pub async fn update_trusted_measurements(&mut self, set: &MeasurementSet) -> Result<()> {
        self.expect_state(&["INIT"], "update_trusted_measurements")?;
        self.deadline(
            "update_trusted_measurements",
            self.registry.update_measurements(&self.capability, set),
        )
        .await?;
        info!("Trusted measurements updated");
        self.state = RegistrationState::MeasurementsUpdated;
        Ok(())
    }

    /// Fetches the attestation document from the enclave endpoint.
    /// `INIT|MEASUREMENTS_UPDATED -> ATTESTED`.
    ///
    /// An unreachable endpoint, an empty body, or a document that fails
    /// local verification halts the attempt before any register call: no
    /// partial or garbage document ever reaches the relying party.
    pub async fn fetch_attestation(&mut self) -> Result<&AttestationDocument> {
        self.expect_state(&["INIT", "MEASUREMENTS_UPDATED"], "fetch_attestation")?;

        let endpoint = self.endpoint.clone();
        let (status, body) = retry::with_backoff("fetch attestation", Backoff::default(), || {
            let endpoint = endpoint.clone();
            async move { endpoint.get("/attestation").await }
        })
        .await?;

        if status != 200 {
            return Err(EnclaveError::Endpoint(format!(
                "attestation endpoint returned HTTP {}",
                status
            )));
        }
        if body.is_empty() {
            return Err(EnclaveError::Endpoint(
                "attestation endpoint returned an empty document".to_string(),
            ));
        }

        let document: AttestationDocument = serde_json::from_slice(&body).map_err(|e| {
            EnclaveError::Endpoint(format!("malformed attestation document: {}", e))
        })?;
        document.verify_binding()?;

        info!(
            public_key = hex::encode(&document.public_key),
            timestamp_ms = document.timestamp_ms,
            "Attestation fetched and locally verified"
        );
        self.state = RegistrationState::Attested(document);
        match &self.state {
            RegistrationState::Attested(doc) => Ok(doc),
            _ => unreachable!(),
        }
    }

    /// Submits the fetched document. `ATTESTED -> REGISTERED`.
    ///
    /// A validation rejection is surfaced as-is and never blindly
    /// retried: it means either a real integrity problem or stale local
    /// state, and the caller must re-derive the trusted configuration
    /// before deciding.
    pub async fn register(&mut self) -> Result<RegistrationId> {
        self.expect_state(&["ATTESTED"], "register")?;
        let document = match &self.state {
            RegistrationState::Attested(doc) => doc.clone(),
            _ => unreachable!(),
        };

        let id = self
            .deadline("register", self.registry.register(&self.capability, &document))
            .await?;
        info!(registration_id = %id, "Enclave registered");
        self.state = RegistrationState::Registered(id.clone());
        Ok(id)
    }

    /// Retires a prior registration. Side path, valid from any state;
    /// idempotent against ids that are already gone.
    pub async fn retire(&mut self, id: &RegistrationId) -> Result<()> {
        self.deadline("retire", self.registry.retire(&self.capability, id))
            .await?;
        info!(registration_id = %id, "Registration retired");
        Ok(())
    }

    /// Runs the full flow per the orchestration policy: optional trusted
    /// measurement update first, then retire of the stale registration,
    /// then fetch and register the replacement.
    ///
    /// Retire-then-register is deliberately not atomic. A failure in the
    /// window leaves zero active registrations; re-running this flow
    /// registers the replacement without consuming anything but fees.
    pub async fn run(
        &mut self,
        update: Option<&MeasurementSet>,
        retire_first: Option<&RegistrationId>,
    ) -> Result<RegistrationId> {
        if let Some(set) = update {
            self.update_trusted_measurements(set).await?;
        }
        if let Some(old_id) = retire_first {
            // Retire before register so two keys are never simultaneously
            // valid for the same logical enclave identity.
            if let Some(record) = self.deadline(
                "registration lookup",
                self.registry.registration(old_id),
            )
            .await?
            {
                if !record.active {
                    warn!(registration_id = %old_id, "Stale registration already retired");
                }
            }
            self.retire(old_id).await?;
        }
        self.fetch_attestation().await?;
        self.register().await
    }
}
