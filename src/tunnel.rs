//! HTTP CONNECT tunneling to discovered workloads
//!
//! A CONNECT request names its target in the request line (`box.example.com:22`).
//! The target is resolved against tunnel routes (qualified with the tunnel
//! scheme), a TCP connection to the backend is opened, and the two sockets are
//! spliced together without interpreting the bytes.

use crate::config::TunnelRouteConfig;
use crate::routes::{Endpoint, Qualifier, RoutingKey, SharedRouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Value of the proxy identification header sent with every tunnel response
pub const PROXY_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Header identifying this proxy on CONNECT responses
pub const PROXY_AGENT_HEADER: &str = "proxy-agent";

/// Bytes moved by a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Resolves and serves CONNECT requests
pub struct TunnelHandler {
    table: SharedRouteTable,
    scheme: String,
    default_port: u16,
    connect_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(
        table: SharedRouteTable,
        tunnel: &TunnelRouteConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            table,
            scheme: tunnel.scheme.to_ascii_lowercase(),
            default_port: tunnel.port,
            connect_timeout,
        }
    }

    /// Routing key for a CONNECT target: its host, qualified with the tunnel
    /// scheme and the requested port (the tunnel port when none is given).
    pub fn routing_key(&self, target: &Authority) -> RoutingKey {
        let port = target.port_u16().unwrap_or(self.default_port);
        RoutingKey::qualified(target.host(), Qualifier::new(&self.scheme, port))
    }

    pub fn resolve(&self, target: &Authority) -> Option<Endpoint> {
        self.table.get(&self.routing_key(target))
    }

    /// Serve a CONNECT request.
    ///
    /// - unknown target: `400 Bad Request`, connection closed
    /// - backend dial fails: `504 Gateway Timeout`, connection closed
    /// - otherwise: `200 Connection Established`, then the upgraded client
    ///   connection is spliced to the backend in a background task
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(target) = req.uri().authority().cloned() else {
            debug!(uri = %req.uri(), "CONNECT without authority target");
            return tunnel_response(StatusCode::BAD_REQUEST);
        };

        let Some(endpoint) = self.resolve(&target) else {
            debug!(target = %target, key = %self.routing_key(&target), "No tunnel route");
            return tunnel_response(StatusCode::BAD_REQUEST);
        };

        let backend = match dial(&endpoint, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    target = %target,
                    backend = %endpoint,
                    error = %e,
                    "Tunnel backend unreachable"
                );
                return tunnel_response(StatusCode::GATEWAY_TIMEOUT);
            }
        };

        info!(target = %target, backend = %endpoint, "Tunnel established");

        tokio::spawn(async move {
            // Bytes the client sent right after the CONNECT head are buffered
            // inside the upgraded connection and come out of its first reads.
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    let mut backend = backend;
                    match relay(&mut client, &mut backend).await {
                        Ok(stats) => debug!(
                            target = %target,
                            client_to_backend = stats.client_to_backend,
                            backend_to_client = stats.backend_to_client,
                            "Tunnel closed"
                        ),
                        Err(e) => debug!(target = %target, error = %e, "Tunnel closed with error"),
                    }
                }
                Err(e) => warn!(target = %target, error = %e, "Failed to upgrade CONNECT request"),
            }
        });

        tunnel_response(StatusCode::OK)
    }
}

/// Open a TCP connection to a backend, bounded by `timeout`
pub async fn dial(endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.authority()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Build a CONNECT status response carrying the proxy identification header.
/// Failures also close the client connection.
pub fn tunnel_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(status)
        .header(PROXY_AGENT_HEADER, HeaderValue::from_static(PROXY_AGENT));

    if status == StatusCode::OK {
        builder = builder.extension(ReasonPhrase::from_static(b"Connection Established"));
    } else {
        builder = builder.header(CONNECTION, HeaderValue::from_static("close"));
    }

    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Full-duplex relay between a client and a backend connection.
///
/// Both directions are copied concurrently. EOF on one side is propagated as a
/// write shutdown to the other, and the relay returns once both directions are
/// done or either fails. Both write halves are then shut down; callers drop
/// both sockets.
pub async fn relay<C, B>(client: &mut C, backend: &mut B) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::io::copy_bidirectional(client, backend).await;

    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;

    result.map(|(client_to_backend, backend_to_client)| RelayStats {
        client_to_backend,
        backend_to_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteTable;
    use tokio::io::{duplex, AsyncReadExt};

    fn handler(table: SharedRouteTable) -> TunnelHandler {
        TunnelHandler::new(table, &TunnelRouteConfig::default(), Duration::from_secs(1))
    }

    #[test]
    fn test_routing_key_uses_target_port() {
        let h = handler(RouteTable::shared());
        let key = h.routing_key(&"Box.Example.com:22".parse().unwrap());
        assert_eq!(
            key,
            RoutingKey::qualified("box.example.com", Qualifier::new("ssh", 22))
        );

        let key = h.routing_key(&"box.example.com:443".parse().unwrap());
        assert_eq!(key.qualifier(), Some(&Qualifier::new("ssh", 443)));
    }

    #[test]
    fn test_routing_key_defaults_to_tunnel_port() {
        let h = handler(RouteTable::shared());
        let key = h.routing_key(&"box".parse().unwrap());
        assert_eq!(key.qualifier(), Some(&Qualifier::new("ssh", 22)));
    }

    #[test]
    fn test_resolve_only_matches_tunnel_routes() {
        let table = RouteTable::shared();
        table.put(RoutingKey::host("box"), Endpoint::new("10.0.0.2", 8080));
        let h = handler(table.clone());
        assert_eq!(h.resolve(&"box:22".parse().unwrap()), None);

        table.put(
            RoutingKey::qualified("box", Qualifier::new("ssh", 22)),
            Endpoint::new("10.0.0.2", 22),
        );
        assert_eq!(
            h.resolve(&"box:22".parse().unwrap()),
            Some(Endpoint::new("10.0.0.2", 22))
        );
    }

    #[test]
    fn test_tunnel_responses() {
        let ok = tunnel_response(StatusCode::OK);
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers().get(PROXY_AGENT_HEADER).unwrap(), PROXY_AGENT);
        assert_eq!(
            ok.extensions().get::<ReasonPhrase>().map(|r| r.as_bytes()),
            Some(&b"Connection Established"[..])
        );
        assert!(ok.headers().get(CONNECTION).is_none());

        let bad = tunnel_response(StatusCode::BAD_REQUEST);
        assert_eq!(bad.headers().get(CONNECTION).unwrap(), "close");
        assert_eq!(bad.headers().get(PROXY_AGENT_HEADER).unwrap(), PROXY_AGENT);

        let timeout = tunnel_response(StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dial(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let (mut client, mut client_side) = duplex(64);
        let (mut backend, mut backend_side) = duplex(64);

        let relay_task =
            tokio::spawn(async move { relay(&mut client_side, &mut backend_side).await });

        client.write_all(b"SSH-2.0-client\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-client\r\n");

        backend.write_all(b"SSH-2.0-server\r\n").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-server\r\n");

        // Client hangs up: the backend sees EOF and closes in turn
        drop(client);
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(backend);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 16);
        assert_eq!(stats.backend_to_client, 16);
    }

    #[tokio::test]
    async fn test_relay_delivers_final_bytes_before_teardown() {
        let (mut client, mut client_side) = duplex(1024);
        let (mut backend, mut backend_side) = duplex(1024);

        let relay_task =
            tokio::spawn(async move { relay(&mut client_side, &mut backend_side).await });

        // Backend sends a final message and closes
        backend.write_all(b"bye").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        drop(client);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.backend_to_client, 3);
        assert_eq!(stats.client_to_backend, 0);
    }

    #[tokio::test]
    async fn test_relay_simultaneous_bulk_transfer() {
        const PAYLOAD_LEN: usize = 256 * 1024;

        // Small pipes so neither side can buffer a whole payload
        let (client, mut client_side) = duplex(4096);
        let (mut backend, mut backend_side) = duplex(4096);

        let relay_task =
            tokio::spawn(async move { relay(&mut client_side, &mut backend_side).await });

        // Client writes and reads at the same time
        let client_task = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(client);
            let writer = async {
                wr.write_all(&vec![b'c'; PAYLOAD_LEN]).await.unwrap();
                wr.shutdown().await.unwrap();
            };
            let reader = async {
                let mut buf = Vec::new();
                rd.read_to_end(&mut buf).await.unwrap();
                buf
            };
            let ((), received) = tokio::join!(writer, reader);
            received
        });

        // Backend writes its whole reply before reading anything
        let backend_task = tokio::spawn(async move {
            backend.write_all(&vec![b'b'; PAYLOAD_LEN]).await.unwrap();
            backend.shutdown().await.unwrap();
            let mut buf = Vec::new();
            backend.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (to_client, to_backend) = tokio::time::timeout(Duration::from_secs(10), async {
            (client_task.await.unwrap(), backend_task.await.unwrap())
        })
        .await
        .expect("relay stalled on simultaneous bulk transfer");

        assert_eq!(to_client.len(), PAYLOAD_LEN);
        assert!(to_client.iter().all(|b| *b == b'b'));
        assert_eq!(to_backend.len(), PAYLOAD_LEN);
        assert!(to_backend.iter().all(|b| *b == b'c'));

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, PAYLOAD_LEN as u64);
        assert_eq!(stats.backend_to_client, PAYLOAD_LEN as u64);
    }
}
