//! Attestation document wire format
//!
//! An attestation document binds a freshly generated public key to the
//! measurement set of the enclave that produced it. Inside a real enclave
//! the NSM emits a CBOR/COSE platform document carried opaquely in
//! `platform_document`; in every mode the enclave additionally signs the
//! canonical binding payload with the key being attested, so any tampering
//! with the embedded key, measurements, or timestamp breaks verification.

use crate::error::{EnclaveError, Result};
use crate::measurements::MeasurementSet;
use ring::signature::{EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use serde::{Deserialize, Serialize};

/// Domain-separation prefix for the binding payload.
const BINDING_CONTEXT: &[u8] = b"enclave-relay/attestation/v1";

/// A signed statement binding a public key to a measured software state.
///
/// Produced once per request by the enclave; consumed by the relying party
/// during registration; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationDocument {
    /// Measurements of the enclave image that produced this document.
    pub measurements: MeasurementSet,
    /// The fresh public key being attested (SEC1-encoded P-256 point).
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// Issuance time, milliseconds since the Unix epoch. Bounds replay.
    pub timestamp_ms: u64,
    /// Raw hardware document (CBOR COSE_Sign1) when produced inside an
    /// enclave; empty in local mode.
    #[serde(with = "hex_bytes")]
    pub platform_document: Vec<u8>,
    /// ECDSA P-256 signature over the binding payload by `public_key`.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl AttestationDocument {
    /// Issues a document binding `keypair`'s public half to `measurements`.
    pub fn issue(
        keypair: &EcdsaKeyPair,
        measurements: &MeasurementSet,
        timestamp_ms: u64,
        platform_document: Vec<u8>,
    ) -> Result<Self> {
        let public_key = keypair.public_key().as_ref().to_vec();
        let payload = binding_payload(measurements, &public_key, timestamp_ms);
        let rng = ring::rand::SystemRandom::new();
        let signature = keypair
            .sign(&rng, &payload)
            .map_err(|e| EnclaveError::Crypto(format!("failed to sign binding payload: {}", e)))?
            .as_ref()
            .to_vec();

        Ok(Self {
            measurements: measurements.clone(),
            public_key,
            timestamp_ms,
            platform_document,
            signature,
        })
    }

    /// Verifies the binding signature against the embedded public key.
    ///
    /// Any change to the key, the measurements, or the timestamp after
    /// issuance makes this fail.
    pub fn verify_binding(&self) -> Result<()> {
        if self.public_key.is_empty() {
            return Err(EnclaveError::Validation("empty public key".to_string()));
        }
        if self.signature.is_empty() {
            return Err(EnclaveError::Validation("empty binding signature".to_string()));
        }
        let payload = binding_payload(&self.measurements, &self.public_key, self.timestamp_ms);
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &self.public_key)
            .verify(&payload, &self.signature)
            .map_err(|_| {
                EnclaveError::Validation(
                    "binding signature does not match embedded public key".to_string(),
                )
            })
    }
}

/// Canonical byte payload the enclave signs: context, PCRs, public key,
/// timestamp, with fixed-width framing so fields cannot shift into one
/// another.
pub fn binding_payload(
    measurements: &MeasurementSet,
    public_key: &[u8],
    timestamp_ms: u64,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(
        BINDING_CONTEXT.len() + 144 + 4 + public_key.len() + 8,
    );
    payload.extend_from_slice(BINDING_CONTEXT);
    payload.extend_from_slice(&measurements.to_bytes());
    payload.extend_from_slice(&(public_key.len() as u32).to_be_bytes());
    payload.extend_from_slice(public_key);
    payload.extend_from_slice(&timestamp_ms.to_be_bytes());
    payload
}

/// Hex-string serde for byte fields, the wire form the attestation
/// endpoint speaks.
pub(crate) mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)
    }
}
