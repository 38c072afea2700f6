//! Measurement set (PCR values) for an enclave image
//!
//! A measurement set is the PCR0/PCR1/PCR2 trio produced by the enclave
//! image build: boot image, kernel/application, and signer identity. Each
//! value is a 48-byte SHA-384 extend-chain output. The set is immutable for
//! a given build and compared by exact byte equality.

use crate::error::{EnclaveError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

/// Width of a single PCR value in bytes (SHA-384).
pub const PCR_LEN: usize = 48;

/// The PCR0-PCR2 trio measured for one enclave image.
#[derive(Clone, PartialEq, Eq)]
pub struct MeasurementSet {
    pcr0: [u8; PCR_LEN],
    pcr1: [u8; PCR_LEN],
    pcr2: [u8; PCR_LEN],
}

impl MeasurementSet {
    /// Builds a measurement set from three raw PCR values.
    ///
    /// Each slice must be exactly [`PCR_LEN`] bytes.
    pub fn new(pcr0: &[u8], pcr1: &[u8], pcr2: &[u8]) -> Result<Self> {
        Ok(Self {
            pcr0: fixed("PCR0", pcr0)?,
            pcr1: fixed("PCR1", pcr1)?,
            pcr2: fixed("PCR2", pcr2)?,
        })
    }

    /// The all-zero measurement set reported outside a real enclave.
    pub fn zeroed() -> Self {
        Self {
            pcr0: [0u8; PCR_LEN],
            pcr1: [0u8; PCR_LEN],
            pcr2: [0u8; PCR_LEN],
        }
    }

    pub fn pcr0(&self) -> &[u8] {
        &self.pcr0
    }

    pub fn pcr1(&self) -> &[u8] {
        &self.pcr1
    }

    pub fn pcr2(&self) -> &[u8] {
        &self.pcr2
    }

    /// Concatenated PCR bytes, used when deriving signing payloads.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PCR_LEN * 3);
        out.extend_from_slice(&self.pcr0);
        out.extend_from_slice(&self.pcr1);
        out.extend_from_slice(&self.pcr2);
        out
    }

    /// Loads the build-produced measurement artifact.
    ///
    /// The artifact is plain text with one `PCR<n>=<hex>` pair per line
    /// (case-insensitive keys, `#` comments and blank lines ignored). A
    /// missing file or missing/malformed value is an environment error
    /// naming the offending key.
    pub fn from_artifact(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EnclaveError::Measurement(format!(
                "cannot read measurement artifact {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_artifact_str(&text)
    }

    /// Parses artifact text; see [`MeasurementSet::from_artifact`].
    pub fn from_artifact_str(text: &str) -> Result<Self> {
        let mut pcrs: [Option<[u8; PCR_LEN]>; 3] = [None, None, None];

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                EnclaveError::Measurement(format!(
                    "artifact line {}: expected KEY=VALUE, got {:?}",
                    lineno + 1,
                    line
                ))
            })?;
            let key = key.trim().to_ascii_uppercase();
            let index = match key.as_str() {
                "PCR0" => 0,
                "PCR1" => 1,
                "PCR2" => 2,
                // Build tooling also emits PCR3/PCR4/PCR8; only 0-2 matter here.
                _ => continue,
            };
            let value = value.trim().trim_start_matches("0x");
            let bytes = hex::decode(value).map_err(|e| {
                EnclaveError::Measurement(format!("{}: invalid hex: {}", key, e))
            })?;
            pcrs[index] = Some(fixed(&key, &bytes)?);
        }

        match pcrs {
            [Some(pcr0), Some(pcr1), Some(pcr2)] => Ok(Self { pcr0, pcr1, pcr2 }),
            _ => {
                let missing: Vec<&str> = pcrs
                    .iter()
                    .zip(["PCR0", "PCR1", "PCR2"])
                    .filter_map(|(slot, name)| slot.is_none().then_some(name))
                    .collect();
                Err(EnclaveError::Measurement(format!(
                    "artifact missing {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

fn fixed(name: &str, bytes: &[u8]) -> Result<[u8; PCR_LEN]> {
    <[u8; PCR_LEN]>::try_from(bytes).map_err(|_| {
        EnclaveError::Measurement(format!(
            "{}: expected {} bytes, got {}",
            name,
            PCR_LEN,
            bytes.len()
        ))
    })
}

impl fmt::Debug for MeasurementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementSet")
            .field("pcr0", &hex::encode(self.pcr0))
            .field("pcr1", &hex::encode(self.pcr1))
            .field("pcr2", &hex::encode(self.pcr2))
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct MeasurementSetWire {
    pcr0: String,
    pcr1: String,
    pcr2: String,
}

impl Serialize for MeasurementSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        MeasurementSetWire {
            pcr0: hex::encode(self.pcr0),
            pcr1: hex::encode(self.pcr1),
            pcr2: hex::encode(self.pcr2),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MeasurementSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = MeasurementSetWire::deserialize(deserializer)?;
        let decode = |name: &str, s: &str| -> std::result::Result<Vec<u8>, D::Error> {
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| D::Error::custom(format!("{}: {}", name, e)))
        };
        MeasurementSet::new(
            &decode("pcr0", &wire.pcr0)?,
            &decode("pcr1", &wire.pcr1)?,
            &decode("pcr2", &wire.pcr2)?,
        )
        .map_err(D::Error::custom)
    }
}
