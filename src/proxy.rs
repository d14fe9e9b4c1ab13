use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::routes::{Endpoint, RoutingKey, SharedRouteTable};
use crate::tunnel::{self, TunnelHandler};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header for request ID tracing
const X_REQUEST_ID: &str = "x-request-id";
/// Client IP as seen by the proxy
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Host the client originally asked for
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Scheme of the inbound connection
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Upper bound on a backend's upgrade response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Resolves inbound requests against the route table and forwards them.
///
/// Plain requests go through the pooled HTTP client, protocol upgrades are
/// relayed over a dedicated backend connection and CONNECT requests are handed
/// to the [`TunnelHandler`].
pub struct HttpDispatcher {
    table: SharedRouteTable,
    pool: ConnectionPool,
    tunnel: TunnelHandler,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(table: SharedRouteTable, config: &Config) -> Self {
        let server = &config.server;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
            connect_timeout: server.connect_timeout(),
        });
        let tunnel = TunnelHandler::new(
            Arc::clone(&table),
            &config.routing.tunnel,
            server.connect_timeout(),
        );

        Self {
            table,
            pool,
            tunnel,
            connect_timeout: server.connect_timeout(),
            request_timeout: server.request_timeout(),
        }
    }

    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    pub async fn dispatch(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if req.method() == Method::CONNECT {
            debug!(client = %client_addr, target = %req.uri(), "CONNECT request");
            return Ok(self.tunnel.handle(req).await);
        }

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let hostname = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                return Ok(json_error_response(
                    ProxyErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                ));
            }
        };

        let endpoint = match self.table.get(&RoutingKey::host(&hostname)) {
            Some(endpoint) => endpoint,
            None => {
                debug!(hostname, request_id, "No route for host");
                return Ok(json_error_response(
                    ProxyErrorCode::UnknownHost,
                    "Unknown or unconfigured host",
                ));
            }
        };

        // X-Forwarded-* are overwritten, never appended: this proxy is the
        // first trusted hop.
        let original_host = request_host(&req).map(str::to_owned);
        let headers = req.headers_mut();

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        debug!(
            hostname,
            method = %req.method(),
            uri = %req.uri(),
            backend = %endpoint,
            request_id,
            "Forwarding request"
        );

        if is_upgrade_request(&req) {
            return Ok(self.handle_upgrade(req, endpoint, hostname, request_id).await);
        }

        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req, &endpoint))
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => {
                warn!(hostname, backend = %endpoint, error = %e, "Backend unreachable");
                Ok(json_error_response(
                    ProxyErrorCode::BackendUnreachable,
                    "Failed to connect to backend",
                ))
            }
            Ok(Err(e)) => {
                error!(hostname, backend = %endpoint, error = %e, "Failed to forward request");
                Ok(json_error_response(
                    ProxyErrorCode::BackendError,
                    "Backend connection failed",
                ))
            }
            Err(_) => {
                warn!(
                    hostname,
                    backend = %endpoint,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    /// Relay an HTTP upgrade (usually WebSocket) to the backend.
    ///
    /// The request head is replayed on a fresh backend connection. A `101`
    /// answer is passed back to the client and both connections are then
    /// spliced; any other answer is returned as a normal response.
    async fn handle_upgrade(
        &self,
        req: Request<Incoming>,
        endpoint: Endpoint,
        hostname: String,
        request_id: String,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req);

        let mut backend = match tunnel::dial(&endpoint, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    hostname,
                    backend = %endpoint,
                    error = %e,
                    "Failed to connect to backend for upgrade"
                );
                return json_error_response(
                    ProxyErrorCode::BackendUnreachable,
                    "Failed to connect to backend",
                );
            }
        };

        if let Err(e) = backend.write_all(&raw_request).await {
            error!(hostname, error = %e, "Failed to send upgrade request to backend");
            return json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Failed to send upgrade request",
            );
        }

        let head_read = read_response_head(&mut backend);
        let (head, leftover) = match tokio::time::timeout(self.request_timeout, head_read).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                error!(hostname, error = %e, "Failed to read upgrade response from backend");
                return json_error_response(
                    ProxyErrorCode::UpgradeFailed,
                    "Invalid upgrade response from backend",
                );
            }
            Err(_) => {
                warn!(hostname, "Backend did not answer upgrade request in time");
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    "Upgrade request timed out",
                );
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&head) else {
            error!(hostname, "Failed to parse backend upgrade response");
            return json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from backend",
            );
        };

        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            // Framing is recomputed by hyper
            let name_lower = name.to_ascii_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(hostname, status = %status, "Backend rejected upgrade request");
            return response
                .body(Full::new(Bytes::from(leftover)).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| {
                    json_error_response(
                        ProxyErrorCode::UpgradeFailed,
                        "Invalid upgrade response from backend",
                    )
                });
        }

        let response = match response
            .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        {
            Ok(response) => response,
            Err(e) => {
                error!(hostname, error = %e, "Failed to build upgrade response");
                return json_error_response(ProxyErrorCode::InternalError, "Internal proxy error");
            }
        };

        info!(hostname, request_id, upgrade_type, "Upgrade accepted by backend");

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    // Frames the backend sent right after its response head
                    if !leftover.is_empty() {
                        if let Err(e) = client.write_all(&leftover).await {
                            debug!(
                                hostname,
                                request_id,
                                error = %e,
                                "Client closed before relay started"
                            );
                            return;
                        }
                    }
                    match tunnel::relay(&mut client, &mut backend).await {
                        Ok(stats) => debug!(
                            hostname,
                            request_id,
                            client_to_backend = stats.client_to_backend,
                            backend_to_client = stats.backend_to_client,
                            "Upgraded connection closed"
                        ),
                        Err(e) => debug!(
                            hostname,
                            request_id,
                            error = %e,
                            "Upgraded connection closed with error"
                        ),
                    }
                }
                Err(e) => {
                    error!(hostname, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// HTTP/1.1 and HTTP/2 front end listening for client connections
pub struct ProxyServer {
    dispatcher: Arc<HttpDispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        table: SharedRouteTable,
        config: &Config,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(HttpDispatcher::new(table, config)),
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    /// Enable TLS termination for inbound connections
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.dispatcher.pool_stats()
    }

    /// Accept connections on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tls_acceptor = self.tls_acceptor.clone();
                            tokio::spawn(accept_connection(stream, addr, dispatcher, tls_acceptor));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Bind the inbound listener. Failing here is fatal to the process.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind proxy listener on {}: {}", addr, e))
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<HttpDispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
) {
    let _ = stream.set_nodelay(true);

    if let Some(acceptor) = tls_acceptor {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                if let Err(e) = handle_connection(tls_stream, addr, dispatcher, true).await {
                    debug!(addr = %addr, error = %e, "TLS connection error");
                }
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "TLS handshake failed");
            }
        }
    } else if let Err(e) = handle_connection(stream, addr, dispatcher, false).await {
        debug!(addr = %addr, error = %e, "Connection error");
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    dispatcher: Arc<HttpDispatcher>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.dispatch(req, addr, is_tls).await }
    });

    // HTTP/1.1 connections may still upgrade (WebSocket, CONNECT)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Host the client asked for: the Host header, or the URI authority for
/// HTTP/2 requests that only carry `:authority`.
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Routing hostname of a request: port stripped, lowercased, validated
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = request_host(req)?;

    let hostname = host.split(':').next()?.trim_end_matches('.');
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps junk out of logs and keys
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Check if a request asks for a protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
}

/// Raw HTTP/1.1 request head replayed to the backend, headers unchanged
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(authority) = req.uri().authority() {
            request.extend_from_slice(format!("host: {}\r\n", authority).as_bytes());
        }
    }

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Read a response head up to and including the blank line. Bytes read past
/// the head are returned separately.
async fn read_response_head<R>(stream: &mut R) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed connection before completing response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backend response head too large",
            ));
        }
    }
}

/// Parse a raw response head into status and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header(hyper::header::HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_extract_hostname_strips_port_and_case() {
        assert_eq!(
            extract_hostname(&request_with_host("Blog.Example.com:8443")).as_deref(),
            Some("blog.example.com")
        );
        assert_eq!(
            extract_hostname(&request_with_host("blog.example.com.")).as_deref(),
            Some("blog.example.com")
        );
    }

    #[test]
    fn test_extract_hostname_rejects_invalid() {
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host("a/b")), None);
        assert_eq!(extract_hostname(&request_with_host("")), None);
        assert_eq!(extract_hostname(&request_with_host(&"a".repeat(254))), None);

        let no_host = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_hostname(&no_host), None);
    }

    #[test]
    fn test_extract_hostname_falls_back_to_authority() {
        let req = Request::builder()
            .uri("https://api.example.com:8443/v1")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_is_upgrade_request() {
        let ws = Request::builder()
            .uri("/socket")
            .header(hyper::header::CONNECTION, "keep-alive, Upgrade")
            .header(hyper::header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&ws));
        assert_eq!(get_upgrade_type(&ws).as_deref(), Some("websocket"));

        let no_upgrade_header = Request::builder()
            .header(hyper::header::CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&no_upgrade_header));

        let plain = Request::builder().body(()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_build_upgrade_request_keeps_headers() {
        let req = Request::builder()
            .uri("/chat?room=1")
            .header(hyper::header::HOST, "chat.example.com")
            .header(hyper::header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req)).unwrap();

        assert!(raw.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("host: chat.example.com\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
        assert_eq!(raw.matches("host:").count(), 1);
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
        assert!(parse_upgrade_response(b"HTTP/1.1 abc\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_bind_fails_on_occupied_address() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind proxy listener"));

        drop(held);
        assert!(bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_response_head_splits_leftover() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        writer
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi")
            .await
            .unwrap();

        let (head, rest) = read_response_head(&mut reader).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        writer.write_all(b"HTTP/1.1 101").await.unwrap();
        drop(writer);

        let err = read_response_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
