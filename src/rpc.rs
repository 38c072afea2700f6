//! JSON-RPC handler for the enclave server
//!
//! This module provides the JSON-RPC interface of the attestation
//! endpoint. Method names use the "att" namespace prefix.
//!
//! ## Supported Methods
//!
//! - `att_publicKey`: Returns the enclave's public signing key
//! - `att_measurements`: Returns the PCR0-PCR2 measurement set
//! - `att_attestation`: Returns an attestation document for the signer key
//! - `att_sign`: Signs a message, wrapped in an intent-scoped envelope

use crate::enclave::{now_ms, EnclaveServer};
use crate::error::{EnclaveError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

/// JSON-RPC error structure
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// RPC error codes
const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;

/// Intent scope for enclave-signed payloads. The scope byte is part of
/// the signed message, so a signature produced for one purpose cannot be
/// replayed for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentScope {
    SignedMessage,
    Registration,
}

/// A payload the enclave is about to sign: scope, issuance time, data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMessage<T> {
    pub intent: IntentScope,
    pub timestamp_ms: u64,
    pub data: T,
}

/// An intent message plus the enclave signature over its canonical JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedResponse<T> {
    pub response: IntentMessage<T>,
    /// Hex-encoded ECDSA P-256 signature
    pub signature: String,
}

/// Signs `data` under `scope` with the enclave key.
pub fn to_signed_response<T: Serialize>(
    enclave: &EnclaveServer,
    data: T,
    scope: IntentScope,
) -> Result<SignedResponse<T>> {
    let response = IntentMessage {
        intent: scope,
        timestamp_ms: now_ms()?,
        data,
    };
    let payload = serde_json::to_vec(&response)?;
    let signature = enclave.sign(&payload)?;
    Ok(SignedResponse {
        response,
        signature: hex::encode(signature),
    })
}

/// Parameters for the sign method
#[derive(Debug, Deserialize)]
pub struct SignParams {
    /// Hex-encoded message to sign (with or without 0x prefix)
    pub message: String,
}

/// RPC handler for the enclave
pub struct RpcHandler {
    enclave: Arc<EnclaveServer>,
}

impl RpcHandler {
    /// Creates a new RPC handler
    pub fn new(enclave: Arc<EnclaveServer>) -> Self {
        Self { enclave }
    }

    /// Handles an incoming JSON-RPC request
    pub async fn handle(&self, request_body: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<RpcRequest>(request_body) {
            Ok(request) => self.process_request(request).await,
            Err(e) => RpcResponse {
                jsonrpc: "2.0".to_string(),
                result: None,
                error: Some(RpcError {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {}", e),
                }),
                id: serde_json::Value::Null,
            },
        };

        serde_json::to_vec(&response).unwrap_or_else(|_| {
            br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#
                .to_vec()
        })
    }

    /// Processes a parsed RPC request
    async fn process_request(&self, request: RpcRequest) -> RpcResponse {
        debug!(method = %request.method, "Processing RPC request");

        if request.jsonrpc != "2.0" {
            return RpcResponse {
                jsonrpc: "2.0".to_string(),
                result: None,
                error: Some(RpcError {
                    code: INVALID_REQUEST,
                    message: "Invalid JSON-RPC version".to_string(),
                }),
                id: request.id,
            };
        }

        let result = match request.method.as_str() {
            "att_publicKey" => self.handle_public_key(),
            "att_measurements" => self.handle_measurements(),
            "att_attestation" => self.handle_attestation().await,
            "att_sign" => self.handle_sign(request.params),

            _ => Err(EnclaveError::Rpc(format!(
                "Method not found: {}",
                request.method
            ))),
        };

        match result {
            Ok(value) => RpcResponse {
                jsonrpc: "2.0".to_string(),
                result: Some(value),
                error: None,
                id: request.id,
            },
            Err(e) => {
                let code = match &e {
                    EnclaveError::Rpc(msg) if msg.starts_with("Method not found") => {
                        METHOD_NOT_FOUND
                    }
                    _ => INTERNAL_ERROR,
                };
                RpcResponse {
                    jsonrpc: "2.0".to_string(),
                    result: None,
                    error: Some(RpcError {
                        code,
                        message: e.to_string(),
                    }),
                    id: request.id,
                }
            }
        }
    }

    /// Handles "att_publicKey" - returns hex-encoded public key
    fn handle_public_key(&self) -> Result<serde_json::Value> {
        let public_key = format!("0x{}", self.enclave.public_key_hex());
        Ok(serde_json::Value::String(public_key))
    }

    /// Handles "att_measurements" - returns the PCR trio
    fn handle_measurements(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.enclave.measurements())?)
    }

    /// Handles "att_attestation" - returns the attestation document
    async fn handle_attestation(&self) -> Result<serde_json::Value> {
        let document = self.enclave.get_attestation().await?;
        Ok(serde_json::to_value(&document)?)
    }

    /// Handles "att_sign" - signs a message under the signed-message scope
    fn handle_sign(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: SignParams = parse_params(params)?;
        let message_hex = params.message.strip_prefix("0x").unwrap_or(&params.message);
        let message = hex::decode(message_hex)
            .map_err(|e| EnclaveError::Rpc(format!("Invalid hex message: {}", e)))?;

        let signed = to_signed_response(
            &self.enclave,
            format!("0x{}", hex::encode(&message)),
            IntentScope::SignedMessage,
        )?;
        Ok(serde_json::to_value(&signed)?)
    }
}

/// Helper to parse RPC params
fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T> {
    params
        .and_then(|p| {
            if p.is_array() {
                p.as_array().and_then(|arr| arr.first().cloned())
            } else {
                Some(p)
            }
        })
        .ok_or_else(|| EnclaveError::Rpc("Missing params".to_string()))
        .and_then(|p| {
            serde_json::from_value(p)
                .map_err(|e| EnclaveError::Rpc(format!("Invalid params: {}", e)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationDocument;
    use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};

    fn create_handler() -> RpcHandler {
        let enclave = Arc::new(EnclaveServer::new().expect("Failed to create enclave"));
        RpcHandler::new(enclave)
    }

    #[tokio::test]
    async fn test_public_key() {
        let handler = create_handler();
        let request = br#"{"jsonrpc":"2.0","method":"att_publicKey","id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert!(parsed.error.is_none());
        let key = parsed.result.unwrap();
        assert!(key.as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_measurements() {
        let handler = create_handler();
        let request = br#"{"jsonrpc":"2.0","method":"att_measurements","id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert!(parsed.error.is_none());
        let result = parsed.result.unwrap();
        assert!(result.get("pcr0").is_some());
        assert!(result.get("pcr2").is_some());
    }

    #[tokio::test]
    async fn test_attestation_document_verifies() {
        let handler = create_handler();
        let request = br#"{"jsonrpc":"2.0","method":"att_attestation","id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert!(parsed.error.is_none());
        let document: AttestationDocument =
            serde_json::from_value(parsed.result.unwrap()).unwrap();
        document.verify_binding().unwrap();
    }

    #[tokio::test]
    async fn test_sign_envelope_verifies() {
        let enclave = Arc::new(EnclaveServer::new().unwrap());
        let handler = RpcHandler::new(Arc::clone(&enclave));
        let request =
            br#"{"jsonrpc":"2.0","method":"att_sign","params":[{"message":"0x68656c6c6f"}],"id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert!(parsed.error.is_none());

        let signed: SignedResponse<String> =
            serde_json::from_value(parsed.result.unwrap()).unwrap();
        assert_eq!(signed.response.intent, IntentScope::SignedMessage);
        assert_eq!(signed.response.data, "0x68656c6c6f");

        // The signature covers the canonical JSON of the intent message.
        let payload = serde_json::to_vec(&signed.response).unwrap();
        let signature = hex::decode(&signed.signature).unwrap();
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, enclave.public_key())
            .verify(&payload, &signature)
            .unwrap();
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let handler = create_handler();
        let request = br#"{"jsonrpc":"2.0","method":"unknown","id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert!(parsed.error.is_some());
        assert_eq!(parsed.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_version_rejected() {
        let handler = create_handler();
        let request = br#"{"jsonrpc":"1.0","method":"att_publicKey","id":1}"#;
        let response = handler.handle(request).await;
        let parsed: RpcResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(parsed.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_parse_params() {
        // Object form
        let params = Some(serde_json::json!({"message": "0xff"}));
        let parsed: SignParams = parse_params(params).unwrap();
        assert_eq!(parsed.message, "0xff");

        // Array form (common in JSON-RPC)
        let params = Some(serde_json::json!([{"message": "0x00"}]));
        let parsed: SignParams = parse_params(params).unwrap();
        assert_eq!(parsed.message, "0x00");
    }
}
