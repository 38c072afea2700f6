//! Error types for the enclave relay
//!
//! Every error carries a class (environment, transient, validation, relay)
//! so callers can tell "environment not ready" apart from "attestation
//! rejected" and so retry logic only ever touches transient failures.

use thiserror::Error;

/// Errors that can occur across the enclave server, relay, and
/// submission client.
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("NSM error: {0}")]
    Nsm(String),

    #[error("attestation error: {0}")]
    Attestation(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("measurement artifact error: {0}")]
    Measurement(String),

    #[error("attestation endpoint error: {0}")]
    Endpoint(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("capability rejected: {0}")]
    Capability(String),

    #[error("validation rejected: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("relay error: {0}")]
    Relay(String),
}

/// Failure classes from the error-handling design.
///
/// Environment and validation failures halt the current run; transient
/// failures are absorbed by bounded retry at the owning call site; relay
/// failures are local to a single forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Environment,
    Transient,
    Validation,
    Relay,
}

impl EnclaveError {
    /// Classifies this error for propagation and retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            EnclaveError::Transient(_) => ErrorClass::Transient,
            EnclaveError::Validation(_) | EnclaveError::Capability(_) => ErrorClass::Validation,
            EnclaveError::Relay(_) => ErrorClass::Relay,
            EnclaveError::Nsm(_)
            | EnclaveError::Attestation(_)
            | EnclaveError::Crypto(_)
            | EnclaveError::Io(_)
            | EnclaveError::Serialization(_)
            | EnclaveError::Rpc(_)
            | EnclaveError::Config(_)
            | EnclaveError::Measurement(_)
            | EnclaveError::Endpoint(_)
            | EnclaveError::Ledger(_) => ErrorClass::Environment,
        }
    }

    /// True when a bounded retry at the call site may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Process exit code for operator tooling.
    ///
    /// Environment failures exit 2, validation rejections exit 3, so a
    /// wrapper script can distinguish "prerequisites missing" from
    /// "attestation rejected" without parsing logs.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Environment => 2,
            ErrorClass::Validation => 3,
            ErrorClass::Transient | ErrorClass::Relay => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EnclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(
            EnclaveError::Config("missing".into()).class(),
            ErrorClass::Environment
        );
        assert_eq!(
            EnclaveError::Transient("busy".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            EnclaveError::Validation("pcr mismatch".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            EnclaveError::Capability("not a holder".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            EnclaveError::Relay("upstream refused".into()).class(),
            ErrorClass::Relay
        );
    }

    #[test]
    fn test_exit_codes_distinguish_env_from_validation() {
        assert_eq!(EnclaveError::Measurement("no artifact".into()).exit_code(), 2);
        assert_eq!(EnclaveError::Endpoint("unreachable".into()).exit_code(), 2);
        assert_eq!(EnclaveError::Validation("stale".into()).exit_code(), 3);
        assert_ne!(
            EnclaveError::Measurement("x".into()).exit_code(),
            EnclaveError::Validation("y".into()).exit_code()
        );
    }

    #[test]
    fn test_only_transient_retries() {
        assert!(EnclaveError::Transient("hiccup".into()).is_transient());
        assert!(!EnclaveError::Validation("bad sig".into()).is_transient());
        assert!(!EnclaveError::Nsm("broken".into()).is_transient());
    }
}
