//! Enclave server implementation with NSM integration
//!
//! This module holds the in-enclave state: the ephemeral signing keypair
//! generated at process start and the NSM session used to read PCR values
//! and request attestation documents. The private key lives only in
//! process memory and is never exported.

use crate::attestation::AttestationDocument;
use crate::error::{EnclaveError, Result};
use crate::measurements::MeasurementSet;
use crate::retry::{self, Backoff};
use aws_nitro_enclaves_nsm_api::api::{ErrorCode, Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use serde_bytes::ByteBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// The main enclave server struct.
///
/// Single-writer at construction, then read-only: the key and measurement
/// set are fixed for the process lifetime, so any number of concurrent
/// readers may request attestations.
pub struct EnclaveServer {
    /// Measurements read from the NSM (zeroed in local mode)
    measurements: MeasurementSet,
    /// ECDSA signing key pair, generated at startup
    signing_key: EcdsaKeyPair,
    /// Whether running in local (non-enclave) mode
    is_local_mode: bool,
    /// NSM file descriptor (None in local mode)
    nsm_fd: Option<i32>,
}

impl EnclaveServer {
    /// Creates a new enclave server.
    ///
    /// In production (inside a Nitro enclave) this opens an NSM session,
    /// reads PCR0-PCR2, and generates a fresh signing keypair. In local
    /// mode (for development) the NSM is skipped and measurements are
    /// zeroed.
    ///
    /// Key generation failure is fatal: a process without a usable entropy
    /// source must not come up.
    pub fn new() -> Result<Self> {
        let nsm_result = nsm_init();

        let (nsm_fd, is_local_mode, measurements) = match nsm_result {
            fd if fd >= 0 => {
                info!("NSM initialized successfully, running in enclave mode");
                let measurements = Self::read_measurements(fd)?;
                info!(
                    pcr0 = hex::encode(measurements.pcr0()),
                    pcr1 = hex::encode(measurements.pcr1()),
                    pcr2 = hex::encode(measurements.pcr2()),
                    "Retrieved PCR values"
                );
                (Some(fd), false, measurements)
            }
            _ => {
                warn!("Failed to initialize NSM, running in local mode");
                (None, true, MeasurementSet::zeroed())
            }
        };

        let rng = SystemRandom::new();
        let pkcs8_bytes = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|e| EnclaveError::Crypto(format!("Failed to generate key: {}", e)))?;
        let signing_key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8_bytes.as_ref(), &rng)
                .map_err(|e| EnclaveError::Crypto(format!("Failed to parse key: {}", e)))?;

        info!(
            public_key = hex::encode(signing_key.public_key().as_ref()),
            is_local_mode,
            "Enclave server initialized"
        );

        Ok(Self {
            measurements,
            signing_key,
            is_local_mode,
            nsm_fd,
        })
    }

    /// Reads PCR0-PCR2 from an open NSM session.
    fn read_measurements(fd: i32) -> Result<MeasurementSet> {
        let pcr0 = Self::get_pcr_value(fd, 0)?;
        let pcr1 = Self::get_pcr_value(fd, 1)?;
        let pcr2 = Self::get_pcr_value(fd, 2)?;
        MeasurementSet::new(&pcr0, &pcr1, &pcr2)
    }

    /// Gets a single PCR value from the NSM.
    fn get_pcr_value(fd: i32, index: u16) -> Result<Vec<u8>> {
        let request = Request::DescribePCR { index };
        let response = nsm_process_request(fd, request);

        match response {
            Response::DescribePCR { lock: _, data } => Ok(data),
            Response::Error(err) => Err(nsm_error(format!("Failed to describe PCR{}", index), err)),
            _ => Err(EnclaveError::Nsm("Unexpected NSM response".to_string())),
        }
    }

    /// Returns the public key of the signing key.
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key.public_key().as_ref().to_vec()
    }

    /// Returns the public key as a hex string.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Returns the measurements for the running image.
    pub fn measurements(&self) -> &MeasurementSet {
        &self.measurements
    }

    /// Generates an attestation document binding the public key to the
    /// current measurements.
    ///
    /// Idempotent: the key and measurements are fixed for the process
    /// lifetime, so every call reflects the same binding (the issuance
    /// timestamp moves). A momentarily busy NSM is retried with bounded
    /// backoff before surfacing a fatal error. Mutates no external state.
    pub async fn get_attestation(&self) -> Result<AttestationDocument> {
        let server = self;
        let platform_document = retry::with_backoff("nsm attestation", Backoff::default(), move || {
            async move { server.request_platform_document() }
        })
        .await?;

        AttestationDocument::issue(
            &self.signing_key,
            &self.measurements,
            now_ms()?,
            platform_document,
        )
    }

    /// Requests the raw platform document from the NSM.
    ///
    /// In local mode there is no hardware document; the binding signature
    /// carries the attestation alone.
    fn request_platform_document(&self) -> Result<Vec<u8>> {
        if self.is_local_mode {
            return Ok(Vec::new());
        }

        let fd = self
            .nsm_fd
            .ok_or_else(|| EnclaveError::Nsm("NSM not initialized".to_string()))?;

        let request = Request::Attestation {
            user_data: None,
            nonce: None,
            public_key: Some(ByteBuf::from(self.public_key())),
        };

        match nsm_process_request(fd, request) {
            Response::Attestation { document } => Ok(document),
            Response::Error(err) => Err(nsm_error("Failed to get attestation".to_string(), err)),
            _ => Err(EnclaveError::Attestation(
                "Unexpected NSM response".to_string(),
            )),
        }
    }

    /// Signs a message with the enclave's signing key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        self.signing_key
            .sign(&rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|e| EnclaveError::Crypto(format!("Failed to sign: {}", e)))
    }

    /// Returns whether running in local mode.
    pub fn is_local_mode(&self) -> bool {
        self.is_local_mode
    }
}

impl Drop for EnclaveServer {
    fn drop(&mut self) {
        if let Some(fd) = self.nsm_fd {
            nsm_exit(fd);
        }
    }
}

/// Maps an NSM error code onto the retry taxonomy: an internal error is
/// worth a bounded retry, everything else is a hard failure.
fn nsm_error(context: String, err: ErrorCode) -> EnclaveError {
    match err {
        ErrorCode::InternalError => EnclaveError::Transient(format!("{}: {:?}", context, err)),
        _ => EnclaveError::Nsm(format!("{}: {:?}", context, err)),
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| EnclaveError::Crypto(format!("system clock before epoch: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_mode_server() {
        let server = EnclaveServer::new().expect("Failed to create server");
        assert!(server.is_local_mode());
        assert_eq!(server.measurements(), &MeasurementSet::zeroed());
        assert!(!server.public_key().is_empty());
    }

    #[tokio::test]
    async fn test_signing() {
        let server = EnclaveServer::new().expect("Failed to create server");
        let signature = server.sign(b"hello world").expect("Failed to sign");
        assert!(!signature.is_empty());
    }

    #[tokio::test]
    async fn test_attestation_binds_key_and_measurements() {
        let server = EnclaveServer::new().expect("Failed to create server");
        let doc = server.get_attestation().await.expect("Failed to attest");
        assert_eq!(doc.public_key, server.public_key());
        assert_eq!(&doc.measurements, server.measurements());
        doc.verify_binding().expect("binding must verify");
    }

    #[tokio::test]
    async fn test_attestation_is_idempotent_for_key_and_measurements() {
        let server = EnclaveServer::new().expect("Failed to create server");
        let a = server.get_attestation().await.unwrap();
        let b = server.get_attestation().await.unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.measurements, b.measurements);
    }
}
