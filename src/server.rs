//! Attestation endpoint serving
//!
//! Serves the local attestation endpoint over HTTP/1.1:
//!
//! - `GET /attestation` - the attestation document, JSON with hex fields
//! - `GET /health` - liveness, no semantic payload
//! - `POST /rpc` - JSON-RPC handler (see [`crate::rpc`])
//!
//! In production the listener is a vsock port reachable only through the
//! host relay; in development it is plain TCP.

use crate::error::Result;
use crate::rpc::RpcHandler;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared state for the serving loops.
pub struct AppState {
    pub rpc_handler: RpcHandler,
}

async fn handle_http_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/attestation") => {
            // GET /attestation is sugar for the att_attestation RPC so
            // relying parties need no JSON-RPC plumbing.
            let rpc = br#"{"jsonrpc":"2.0","method":"att_attestation","id":0}"#;
            let body = state.rpc_handler.handle(rpc).await;
            match extract_rpc_result(&body) {
                Some(result) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(result)))
                    .unwrap(),
                None => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
            }
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"ok"}"#)))
            .unwrap(),
        (&Method::POST, "/rpc") | (&Method::POST, "/") => match req.collect().await {
            Ok(body) => {
                let body_bytes = body.to_bytes();
                let response_bytes = state.rpc_handler.handle(&body_bytes).await;
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(response_bytes)))
                    .unwrap()
            }
            Err(e) => {
                error!("Failed to read request body: {}", e);
                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Full::new(Bytes::from(format!(r#"{{"error":"{}"}}"#, e))))
                    .unwrap()
            }
        },
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from(r#"{"error":"Not found"}"#)))
            .unwrap(),
    };

    Ok(response)
}

/// Pulls the `result` member out of a serialized JSON-RPC response.
fn extract_rpc_result(body: &[u8]) -> Option<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let result = value.get("result")?;
    serde_json::to_vec(result).ok()
}

/// Serves the endpoint on an already-bound TCP listener.
pub async fn serve_tcp(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    info!(address = %listener.local_addr()?, "HTTP server listening");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http_request(Arc::clone(&state), req));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(remote_addr = %remote_addr, error = %e, "Connection error");
            }
        });
    }
}

/// Serves the endpoint on a vsock port (any CID).
#[cfg(target_os = "linux")]
pub async fn serve_vsock(state: Arc<AppState>, port: u32) -> Result<()> {
    use tokio_vsock::{VsockAddr, VsockListener};

    let addr = VsockAddr::new(nix::libc::VMADDR_CID_ANY, port);
    let mut listener = VsockListener::bind(addr)?;
    info!(cid = "ANY", port, "vsock server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http_request(Arc::clone(&state), req));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(addr = ?addr, error = %e, "Connection error");
            }
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn serve_vsock(_state: Arc<AppState>, _port: u32) -> Result<()> {
    Err(crate::error::EnclaveError::Config(
        "vsock is only supported on Linux".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationDocument;
    use crate::enclave::EnclaveServer;
    use crate::http::HttpChannel;
    use std::time::Duration;

    async fn spawn_server() -> String {
        let enclave = Arc::new(EnclaveServer::new().unwrap());
        let state = Arc::new(AppState {
            rpc_handler: RpcHandler::new(enclave),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(state, listener));
        addr.to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let authority = spawn_server().await;
        let channel = HttpChannel::new(authority, Duration::from_secs(5));
        let (status, body) = channel.get("/health").await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_get_attestation() {
        let authority = spawn_server().await;
        let channel = HttpChannel::new(authority, Duration::from_secs(5));
        let (status, body) = channel.get("/attestation").await.unwrap();
        assert_eq!(status, 200);
        let document: AttestationDocument = serde_json::from_slice(&body).unwrap();
        document.verify_binding().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_404() {
        let authority = spawn_server().await;
        let channel = HttpChannel::new(authority, Duration::from_secs(5));
        let (status, _) = channel.get("/nope").await.unwrap();
        assert_eq!(status, 404);
    }
}
