//! Host-side forwarding relay
//!
//! A fixed table of byte-for-byte bridges between the isolated guest and
//! the host network: each route listens on one side (host TCP or guest
//! VSOCK) and connects the other. The relay never interprets payload; it
//! is the only network path in or out of the enclave, so a port with no
//! route is implicitly denied.
//!
//! Routes are established once at startup and live until process exit.
//! There is deliberately no runtime add/remove: the enclave's reachable
//! surface is fixed at launch and auditable from the route list alone.

use crate::error::{EnclaveError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// CID of the parent instance as seen from inside an enclave.
pub const VSOCK_CID_HOST: u32 = 3;

/// Wildcard CID for listening sockets.
pub const VSOCK_CID_ANY: u32 = u32::MAX;

/// One leg of a forwarding route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP address, `host:port`. Hostnames resolve at connect time.
    Tcp(String),
    /// VSOCK address. `cid` is the peer context id when connecting, or
    /// [`VSOCK_CID_ANY`] when listening.
    Vsock { cid: u32, port: u32 },
}

impl FromStr for Endpoint {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        let (proto, rest) = s
            .split_once(':')
            .ok_or_else(|| EnclaveError::Config(format!("endpoint {:?}: expected proto:addr", s)))?;
        match proto {
            "tcp" => {
                let (_, port) = rest.rsplit_once(':').ok_or_else(|| {
                    EnclaveError::Config(format!("tcp endpoint {:?}: expected host:port", rest))
                })?;
                port.parse::<u16>().map_err(|_| {
                    EnclaveError::Config(format!("tcp endpoint {:?}: invalid port", rest))
                })?;
                Ok(Endpoint::Tcp(rest.to_string()))
            }
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(|| {
                    EnclaveError::Config(format!("vsock endpoint {:?}: expected cid:port", rest))
                })?;
                let cid = match cid {
                    "any" => VSOCK_CID_ANY,
                    _ => cid.parse::<u32>().map_err(|_| {
                        EnclaveError::Config(format!("vsock endpoint {:?}: invalid cid", rest))
                    })?,
                };
                let port = port.parse::<u32>().map_err(|_| {
                    EnclaveError::Config(format!("vsock endpoint {:?}: invalid port", rest))
                })?;
                Ok(Endpoint::Vsock { cid, port })
            }
            other => Err(EnclaveError::Config(format!(
                "endpoint {:?}: unknown protocol {:?}",
                s, other
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Vsock { cid: u32::MAX, port } => write!(f, "vsock:any:{}", port),
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

/// A static forwarding route: listen on one endpoint, connect the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub listen: Endpoint,
    pub connect: Endpoint,
}

impl FromStr for Route {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        let (listen, connect) = s
            .split_once('=')
            .ok_or_else(|| EnclaveError::Config(format!("route {:?}: expected listen=connect", s)))?;
        Ok(Route {
            listen: listen.trim().parse()?,
            connect: connect.trim().parse()?,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.listen, self.connect)
    }
}

/// Parses an operator-supplied route list: one `listen=connect` route per
/// line, `#` comments and blank lines ignored.
pub fn parse_routes(text: &str) -> Result<Vec<Route>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Route::from_str)
        .collect()
}

trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

#[derive(Debug)]
enum RouteListener {
    Tcp(TcpListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl RouteListener {
    async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    EnclaveError::Config(format!("cannot bind {}: {}", endpoint, e))
                })?;
                Ok(RouteListener::Tcp(listener))
            }
            #[cfg(target_os = "linux")]
            Endpoint::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                let listener = tokio_vsock::VsockListener::bind(addr).map_err(|e| {
                    EnclaveError::Config(format!("cannot bind {}: {}", endpoint, e))
                })?;
                Ok(RouteListener::Vsock(listener))
            }
            #[cfg(not(target_os = "linux"))]
            Endpoint::Vsock { .. } => Err(EnclaveError::Config(format!(
                "cannot bind {}: vsock requires linux",
                endpoint
            ))),
        }
    }

    async fn accept(&mut self) -> std::io::Result<(BoxedStream, String)> {
        match self {
            RouteListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(target_os = "linux")]
            RouteListener::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), format!("{:?}", peer)))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            RouteListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(target_os = "linux")]
            RouteListener::Vsock(_) => None,
        }
    }
}

async fn connect_upstream(endpoint: &Endpoint) -> Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await.map_err(|e| {
                EnclaveError::Relay(format!("upstream connect {} failed: {}", endpoint, e))
            })?;
            Ok(Box::new(stream))
        }
        #[cfg(target_os = "linux")]
        Endpoint::Vsock { cid, port } => {
            let addr = tokio_vsock::VsockAddr::new(*cid, *port);
            let stream = tokio_vsock::VsockStream::connect(addr).await.map_err(|e| {
                EnclaveError::Relay(format!("upstream connect {} failed: {}", endpoint, e))
            })?;
            Ok(Box::new(stream))
        }
        #[cfg(not(target_os = "linux"))]
        Endpoint::Vsock { .. } => Err(EnclaveError::Relay(format!(
            "upstream connect {} failed: vsock requires linux",
            endpoint
        ))),
    }
}

/// The relay process: every configured route bound and accepting.
#[derive(Debug)]
pub struct Relay {
    entries: Vec<(Route, RouteListener)>,
}

impl Relay {
    /// Binds every route's listen side up front.
    ///
    /// Any bind failure aborts startup: a relay that silently came up
    /// with half its routes would turn an implicit-deny surface into a
    /// guessing game.
    pub async fn bind(routes: Vec<Route>) -> Result<Self> {
        if routes.is_empty() {
            return Err(EnclaveError::Config(
                "no forwarding routes configured".to_string(),
            ));
        }
        let mut entries = Vec::with_capacity(routes.len());
        for route in routes {
            let listener = RouteListener::bind(&route.listen).await?;
            info!(route = %route, "Route bound");
            entries.push((route, listener));
        }
        Ok(Self { entries })
    }

    /// Actual listen addresses, in route order. `None` for vsock
    /// listeners. Lets callers (and tests) use port 0 binds.
    pub fn listen_addrs(&self) -> Vec<Option<SocketAddr>> {
        self.entries
            .iter()
            .map(|(_, listener)| listener.local_addr())
            .collect()
    }

    /// Accepts connections on all routes until process exit.
    ///
    /// Each accepted connection runs in its own task; a failed upstream
    /// connect closes that one connection and nothing else.
    pub async fn serve(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.entries.len());
        for (route, listener) in self.entries {
            handles.push(tokio::spawn(serve_route(route, listener)));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| EnclaveError::Relay(format!("route task panicked: {}", e)))?;
        }
        Ok(())
    }
}

async fn serve_route(route: Route, mut listener: RouteListener) {
    info!(route = %route, "Relaying");
    loop {
        let (downstream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                // Accept failures are about the listener, not a
                // connection; bail out of this route and leave the
                // others running.
                error!(route = %route, error = %e, "Accept failed, route stopped");
                return;
            }
        };
        let route = route.clone();
        tokio::spawn(async move {
            handle_connection(route, peer, downstream).await;
        });
    }
}

async fn handle_connection(route: Route, peer: String, mut downstream: BoxedStream) {
    let mut upstream = match connect_upstream(&route.connect).await {
        Ok(stream) => stream,
        Err(e) => {
            // Local to this connection: close and log, no retry. The
            // connecting side owns reconnect policy.
            warn!(route = %route, peer = %peer, error = %e, "Dropping connection");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((to_upstream, to_downstream)) => {
            info!(
                route = %route,
                peer = %peer,
                bytes_in = to_upstream,
                bytes_out = to_downstream,
                "Connection closed"
            );
        }
        Err(e) => {
            warn!(route = %route, peer = %peer, error = %e, "Connection aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_route() {
        let route: Route = "tcp:127.0.0.1:9101=vsock:16:9101".parse().unwrap();
        assert_eq!(route.listen, Endpoint::Tcp("127.0.0.1:9101".to_string()));
        assert_eq!(route.connect, Endpoint::Vsock { cid: 16, port: 9101 });
    }

    #[test]
    fn test_parse_vsock_listen_any() {
        let route: Route = "vsock:any:8443=tcp:api.example.gov:443".parse().unwrap();
        assert_eq!(
            route.listen,
            Endpoint::Vsock {
                cid: VSOCK_CID_ANY,
                port: 8443
            }
        );
        assert_eq!(route.connect, Endpoint::Tcp("api.example.gov:443".to_string()));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in [
            "tcp:127.0.0.1:9101=vsock:16:9101",
            "vsock:any:8443=tcp:api.example.gov:443",
            "vsock:3:9000=tcp:10.0.0.7:9000",
        ] {
            let route: Route = s.parse().unwrap();
            assert_eq!(route.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("tcp:127.0.0.1:9101".parse::<Route>().is_err());
        assert!("udp:1.2.3.4:5=tcp:6.7.8.9:10".parse::<Route>().is_err());
        assert!("tcp:1.2.3.4:notaport=tcp:6.7.8.9:10".parse::<Route>().is_err());
        assert!("vsock:nope:5=tcp:6.7.8.9:10".parse::<Route>().is_err());
        assert!("tcp:noport=tcp:6.7.8.9:10".parse::<Route>().is_err());
    }

    #[test]
    fn test_parse_routes_list() {
        let text = "\n# enclave API out to host\ntcp:127.0.0.1:9101=vsock:16:9101\n\nvsock:any:8443=tcp:api.example.gov:443\n";
        let routes = parse_routes(text).unwrap();
        assert_eq!(routes.len(), 2);
    }

    #[tokio::test]
    async fn test_bind_rejects_empty_table() {
        let err = Relay::bind(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Config(_)));
    }

    #[tokio::test]
    async fn test_bind_fails_fast_on_unbindable_listener() {
        // Occupy a port, then configure a route on the same address: the
        // relay must refuse to start, not come up partially.
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let routes = vec![format!("tcp:{}=tcp:127.0.0.1:9", addr).parse().unwrap()];
        let err = Relay::bind(routes).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
