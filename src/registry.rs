//! Relying-party registry abstraction
//!
//! The registry holds the currently trusted measurement set and the live
//! enclave registrations. Mutation is capability-gated: every privileged
//! call takes the capability token explicitly, no ambient authority.
//!
//! [`RegistryClient`] is the seam between the submission client and
//! whatever ledger backs the registry. [`MemoryRegistry`] implements the
//! full validation rules in process and backs local mode and tests; the
//! on-chain backend lives in [`crate::ledger`].

use crate::attestation::AttestationDocument;
use crate::enclave::now_ms;
use crate::error::{EnclaveError, Result};
use crate::measurements::MeasurementSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Unforgeable credential authorizing privileged registry mutation.
///
/// Redacted from `Debug` output: the token travels only as an explicit
/// argument to privileged operations, never through logs.
#[derive(Clone)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw credential, for handing to the backing ledger.
    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CapabilityToken(..)")
    }
}

/// Identifier of one registration record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationId(String);

impl RegistrationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One registered enclave key, as held by the relying party.
///
/// Records are retired, never deleted; validity was evaluated at
/// registration time and is not re-evaluated when the trusted
/// configuration later changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub id: RegistrationId,
    pub public_key: Vec<u8>,
    pub measurements: MeasurementSet,
    pub registered_at_ms: u64,
    pub active: bool,
}

/// Client-side view of the relying-party registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Replaces the trusted measurement set. Requires the capability for
    /// the trusted-configuration resource. Existing registrations are
    /// unaffected.
    async fn update_measurements(
        &self,
        capability: &CapabilityToken,
        set: &MeasurementSet,
    ) -> Result<()>;

    /// Validates an attestation document and mints a new registration.
    async fn register(
        &self,
        capability: &CapabilityToken,
        document: &AttestationDocument,
    ) -> Result<RegistrationId>;

    /// Marks a registration retired. Idempotent: retiring a missing or
    /// already-retired id succeeds and touches nothing else.
    async fn retire(&self, capability: &CapabilityToken, id: &RegistrationId) -> Result<()>;

    /// Reads back one registration, used to re-derive state after a
    /// timeout before deciding whether to retry.
    async fn registration(&self, id: &RegistrationId) -> Result<Option<RegistrationRecord>>;

    /// Reads back the currently trusted measurement set.
    async fn trusted_measurements(&self) -> Result<Option<MeasurementSet>>;
}

/// Default freshness window for submitted documents.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Allowed forward clock skew on document timestamps.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

struct RegistryState {
    trusted: Option<MeasurementSet>,
    records: HashMap<RegistrationId, RegistrationRecord>,
    next_seq: u64,
}

/// In-process registry enforcing the full validation rules.
///
/// Used for local mode and tests; mirrors the checks the on-chain
/// registry performs so the protocol is exercised end-to-end without a
/// ledger.
pub struct MemoryRegistry {
    admin: CapabilityToken,
    freshness_window: Duration,
    clock_skew: Duration,
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new(admin: CapabilityToken) -> Self {
        Self::with_freshness(admin, DEFAULT_FRESHNESS_WINDOW, DEFAULT_CLOCK_SKEW)
    }

    pub fn with_freshness(
        admin: CapabilityToken,
        freshness_window: Duration,
        clock_skew: Duration,
    ) -> Self {
        Self {
            admin,
            freshness_window,
            clock_skew,
            state: Mutex::new(RegistryState {
                trusted: None,
                records: HashMap::new(),
                next_seq: 1,
            }),
        }
    }

    /// Number of active (non-retired) registrations.
    pub fn active_registrations(&self) -> usize {
        let state = self.state.lock().expect("registry lock poisoned");
        state.records.values().filter(|r| r.active).count()
    }

    /// Total registrations ever minted, retired included.
    pub fn total_registrations(&self) -> usize {
        let state = self.state.lock().expect("registry lock poisoned");
        state.records.len()
    }

    fn check_capability(&self, capability: &CapabilityToken) -> Result<()> {
        // Constant-time compare; a capability miss must not leak prefix
        // length through timing.
        ring::constant_time::verify_slices_are_equal(
            capability.expose().as_bytes(),
            self.admin.expose().as_bytes(),
        )
        .map_err(|_| {
            EnclaveError::Capability("token does not hold this resource".to_string())
        })
    }

    fn check_freshness(&self, timestamp_ms: u64) -> Result<()> {
        let now = now_ms()?;
        let window_ms = self.freshness_window.as_millis() as u64;
        let skew_ms = self.clock_skew.as_millis() as u64;

        if timestamp_ms + window_ms < now {
            return Err(EnclaveError::Validation(format!(
                "attestation is stale: issued {} ms ago, window {} ms",
                now - timestamp_ms,
                window_ms
            )));
        }
        if timestamp_ms > now + skew_ms {
            return Err(EnclaveError::Validation(format!(
                "attestation timestamp {} ms in the future exceeds allowed skew",
                timestamp_ms - now
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn update_measurements(
        &self,
        capability: &CapabilityToken,
        set: &MeasurementSet,
    ) -> Result<()> {
        self.check_capability(capability)?;
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.trusted = Some(set.clone());
        info!("Trusted measurements updated");
        Ok(())
    }

    async fn register(
        &self,
        capability: &CapabilityToken,
        document: &AttestationDocument,
    ) -> Result<RegistrationId> {
        self.check_capability(capability)?;

        document.verify_binding()?;
        self.check_freshness(document.timestamp_ms)?;

        let mut state = self.state.lock().expect("registry lock poisoned");
        let trusted = state.trusted.as_ref().ok_or_else(|| {
            EnclaveError::Validation("no trusted measurement set configured".to_string())
        })?;
        if &document.measurements != trusted {
            return Err(EnclaveError::Validation(
                "document measurements do not match trusted configuration".to_string(),
            ));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let id = RegistrationId::new(format!("0x{:064x}", seq));
        let record = RegistrationRecord {
            id: id.clone(),
            public_key: document.public_key.clone(),
            measurements: document.measurements.clone(),
            registered_at_ms: now_ms()?,
            active: true,
        };
        state.records.insert(id.clone(), record);

        info!(registration_id = %id, "Registration minted");
        Ok(id)
    }

    async fn retire(&self, capability: &CapabilityToken, id: &RegistrationId) -> Result<()> {
        self.check_capability(capability)?;
        let mut state = self.state.lock().expect("registry lock poisoned");
        match state.records.get_mut(id) {
            Some(record) if record.active => {
                record.active = false;
                info!(registration_id = %id, "Registration retired");
            }
            Some(_) => {
                warn!(registration_id = %id, "Retire of already-retired registration");
            }
            None => {
                warn!(registration_id = %id, "Retire of unknown registration");
            }
        }
        Ok(())
    }

    async fn registration(&self, id: &RegistrationId) -> Result<Option<RegistrationRecord>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state.records.get(id).cloned())
    }

    async fn trusted_measurements(&self) -> Result<Option<MeasurementSet>> {
        let state = self.state.lock().expect("registry lock poisoned");
        Ok(state.trusted.clone())
    }
}
