//! Minimal HTTP/1.1 client channel
//!
//! One connection per request over plain TCP, used by the submission
//! client to reach the enclave's attestation endpoint (through the
//! host-side relay) and the ledger-CLI proxy. The whole
//! connect/handshake/request/response cycle runs under a single deadline.

use crate::error::{EnclaveError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::Builder;
use hyper::header;
use hyper::Method;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error};

/// An HTTP/1.1 channel to one authority (`host:port`).
#[derive(Debug, Clone)]
pub struct HttpChannel {
    authority: String,
    timeout: Duration,
}

impl HttpChannel {
    pub fn new(authority: impl Into<String>, timeout: Duration) -> Self {
        Self {
            authority: authority.into(),
            timeout,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// GET `path`, returning status and body.
    pub async fn get(&self, path: &str) -> Result<(u16, Bytes)> {
        self.request(Method::GET, path, Bytes::new(), None).await
    }

    /// POST `body` as JSON to `path`, returning status and body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(u16, Bytes)> {
        let payload = serde_json::to_vec(body)?;
        self.request(
            Method::POST,
            path,
            Bytes::from(payload),
            Some("application/json"),
        )
        .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(u16, Bytes)> {
        tokio::time::timeout(self.timeout, self.request_inner(method, path, body, content_type))
            .await
            .map_err(|_| {
                EnclaveError::Transient(format!(
                    "request to {}{} timed out after {:?}",
                    self.authority, path, self.timeout
                ))
            })?
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(u16, Bytes)> {
        // An unreachable endpoint is a missing prerequisite, not a retry
        // candidate; failures after connect are transient.
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            EnclaveError::Endpoint(format!("cannot connect to {}: {}", self.authority, e))
        })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = Builder::new().handshake(io).await.map_err(|e| {
            EnclaveError::Transient(format!("HTTP handshake with {} failed: {}", self.authority, e))
        })?;

        let authority = self.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                error!(authority = %authority, error = %e, "Connection handler error");
            }
        });

        let mut request = hyper::Request::builder()
            .method(method.clone())
            .uri(path)
            .header(header::HOST, self.authority.as_str());
        if let Some(ct) = content_type {
            request = request.header(header::CONTENT_TYPE, ct);
        }
        let request = request
            .body(Full::new(body))
            .map_err(|e| EnclaveError::Rpc(format!("failed to build request: {}", e)))?;

        let response = sender.send_request(request).await.map_err(|e| {
            EnclaveError::Transient(format!(
                "{} {}{} failed: {}",
                method, self.authority, path, e
            ))
        })?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                EnclaveError::Transient(format!("failed to read response body: {}", e))
            })?
            .to_bytes();

        debug!(
            authority = %self.authority,
            path,
            status,
            body_len = body.len(),
            "HTTP exchange complete"
        );
        Ok((status, body))
    }
}
