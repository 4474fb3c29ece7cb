use crate::config::ProxyConfig;
use crate::endpoint::Endpoint;
use crate::error::{json_error_close, json_error_response, ForwardError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::SharedRegistry;
use crate::router::{Rejection, Router, RoutingDecision};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head we accept from a backend
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Largest body we relay when a backend refuses an upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Timeouts and header policy applied when forwarding
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub request_timeout: Duration,
    pub upgrade_timeout: Duration,
    pub upgrade_max_lifetime: Option<Duration>,
    pub change_origin: bool,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for ForwardSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            upgrade_timeout: config.upgrade_timeout(),
            upgrade_max_lifetime: config.upgrade_max_lifetime(),
            change_origin: config.change_origin,
        }
    }
}

/// State shared by every request task
struct ProxyContext {
    router: Router,
    pool: ConnectionPool,
    settings: ForwardSettings,
}

/// The subdomain reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn with_config(
        bind_addr: SocketAddr,
        registry: SharedRegistry,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        settings: ForwardSettings,
    ) -> Self {
        let context = ProxyContext {
            router: Router::new(registry),
            pool: ConnectionPool::new(pool_config),
            settings,
        };
        Self {
            bind_addr,
            shutdown_rx,
            context: Arc::new(context),
        }
    }

    /// Bind the configured address. Fails when the port is taken or not permitted.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy on {}: {}", self.bind_addr, e))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
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

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
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

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let upgrade = is_upgrade_request(&req);
    let decision = if upgrade {
        context.router.route_upgrade(&req)
    } else {
        context.router.route(&req)
    };

    let endpoint = match decision {
        RoutingDecision::Forward(endpoint) => endpoint,
        RoutingDecision::Reject(rejection) => {
            return Ok(reject(rejection, upgrade, &req, &request_id));
        }
    };

    set_forwarding_headers(&mut req, client_addr, &request_id);

    let service = endpoint.service_name().to_string();
    let result = if upgrade {
        forward_upgrade(req, &endpoint, &context.settings, &request_id).await
    } else {
        forward(req, &endpoint, &context, &request_id).await
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            // Details stay in the logs; the caller gets a generic message
            error!(service = %service, request_id = %request_id, upgrade, error = %e, "Forwarding failed");
            let message = match &e {
                ForwardError::NoPort(_) => "Service has no known port",
                ForwardError::Timeout(_) => "Backend did not respond in time",
                _ => "Failed to connect to backend",
            };
            if upgrade {
                Ok(json_error_close(e.code(), message))
            } else {
                Ok(json_error_response(e.code(), message))
            }
        }
    }
}

fn reject(
    rejection: Rejection,
    upgrade: bool,
    req: &Request<Incoming>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (code, message) = match rejection {
        Rejection::InvalidHost => (ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header"),
        Rejection::NotFound => (ProxyErrorCode::UnknownService, "Unknown service"),
    };
    debug!(
        host = ?req.headers().get(hyper::header::HOST),
        request_id,
        upgrade,
        ?rejection,
        "Rejecting request"
    );
    if upgrade {
        json_error_close(code, message)
    } else {
        json_error_response(code, message)
    }
}

/// Set request id and X-Forwarded-* headers.
///
/// Client-supplied X-Forwarded-* values are overwritten, not appended to:
/// this proxy is assumed to be the first trusted hop.
fn set_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, request_id: &str) {
    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Forward a plain HTTP request and stream the backend response back
async fn forward(
    req: Request<Incoming>,
    endpoint: &Endpoint,
    context: &ProxyContext,
    request_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    let authority = endpoint
        .authority()
        .ok_or_else(|| ForwardError::NoPort(endpoint.service_name().to_string()))?;

    debug!(
        service = endpoint.service_name(),
        target = %authority,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Forwarding request"
    );

    let timeout = context.settings.request_timeout;
    let response = tokio::time::timeout(
        timeout,
        context
            .pool
            .send_request(req, &authority, context.settings.change_origin),
    )
    .await
    .map_err(|_| {
        warn!(
            service = endpoint.service_name(),
            timeout_secs = timeout.as_secs(),
            request_id,
            "Request timed out"
        );
        ForwardError::Timeout(timeout)
    })??;

    Ok(response)
}

/// Check if a request is a WebSocket (or other protocol) upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Perform the upgrade handshake against the backend and, on success,
/// relay bytes between the two connections in a background task.
async fn forward_upgrade(
    req: Request<Incoming>,
    endpoint: &Endpoint,
    settings: &ForwardSettings,
    request_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    let service = endpoint.service_name().to_string();
    let backend_addr = endpoint
        .socket_addr()
        .ok_or_else(|| ForwardError::NoPort(service.clone()))?;
    let authority = backend_addr.to_string();

    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(service = %service, request_id, upgrade_type = %upgrade_type, target = %authority, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &authority, settings.change_origin);
    let timeout = settings.upgrade_timeout;
    let deadline = tokio::time::Instant::now() + timeout;

    let mut backend_stream = tokio::time::timeout_at(deadline, TcpStream::connect(backend_addr))
        .await
        .map_err(|_| ForwardError::Timeout(timeout))?
        .map_err(|source| ForwardError::Connect {
            addr: authority.clone(),
            source,
        })?;
    let _ = backend_stream.set_nodelay(true);

    let (head, leftover) =
        tokio::time::timeout_at(deadline, handshake(&mut backend_stream, &raw_request))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

    let (status, response_headers) =
        parse_upgrade_response(&head).ok_or(ForwardError::InvalidUpgradeResponse)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service = %service, status = %status, request_id, "Backend rejected upgrade request");
        let body = tokio::time::timeout_at(
            deadline,
            read_rejection_body(&mut backend_stream, status, &response_headers, leftover),
        )
        .await
        .map_err(|_| ForwardError::Timeout(timeout))??;

        let mut response = Response::builder()
            .status(status)
            .header(hyper::header::CONNECTION, "close");
        for (name, value) in &response_headers {
            if is_framing_header(name) || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(
                Full::new(Bytes::from(body))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .map_err(|_| ForwardError::InvalidUpgradeResponse);
    }

    info!(service = %service, request_id, upgrade_type = %upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        if is_framing_header(name) {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|_| ForwardError::InvalidUpgradeResponse)?;

    let max_lifetime = settings.upgrade_max_lifetime;
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(service = %service, request_id = %request_id, "Client upgrade complete, starting relay");
                relay(upgraded, backend_stream, leftover, max_lifetime, &service, &request_id).await;
            }
            Err(e) => {
                error!(service = %service, request_id = %request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Headers hyper computes itself for the client-facing response
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Relay bytes both ways until either side closes.
///
/// Dropping both streams on return closes whichever leg is still open.
async fn relay(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    max_lifetime: Option<Duration>,
    service: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    // Frames the backend sent right behind its 101 head
    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(service, request_id, error = %e, "Client closed before relay started");
            return;
        }
    }

    let copy = tokio::io::copy_bidirectional(&mut client_io, &mut backend);
    let result = match max_lifetime {
        Some(limit) => match tokio::time::timeout(limit, copy).await {
            Ok(result) => result,
            Err(_) => {
                info!(service, request_id, max_lifetime_secs = limit.as_secs(), "Upgraded connection reached max lifetime, closing");
                return;
            }
        },
        None => copy.await,
    };

    match result {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                service,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(service, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP/1.1 upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, authority: &str, change_origin: bool) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    let mut has_host = false;
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            if change_origin {
                continue;
            }
            has_host = true;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if !has_host {
        request.push_str(&format!("Host: {}\r\n", authority));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

async fn handshake<S>(stream: &mut S, raw_request: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(raw_request).await?;
    read_response_head(stream).await
}

/// Read from the backend until the end of the response head.
///
/// Returns the head and any bytes that arrived after it.
async fn read_response_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ForwardError::Handshake(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(ForwardError::InvalidUpgradeResponse);
        }
    }
}

/// Read the body of a non-101 upgrade response, framed the way the backend
/// declared it: chunked, `Content-Length`, or until the backend closes.
async fn read_rejection_body<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &[(String, String)],
    mut buf: Vec<u8>,
) -> Result<Vec<u8>, ForwardError>
where
    S: AsyncRead + Unpin,
{
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Vec::new());
    }

    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    };

    let chunked = header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        loop {
            match decode_chunked(&buf) {
                Chunked::Complete(body) => return Ok(body),
                Chunked::Invalid => return Err(ForwardError::InvalidUpgradeResponse),
                Chunked::Incomplete => {
                    if !read_more(stream, &mut buf).await? {
                        return Err(truncated_body());
                    }
                }
            }
        }
    }

    if let Some(length) = header("content-length") {
        let length: usize = length
            .trim()
            .parse()
            .map_err(|_| ForwardError::InvalidUpgradeResponse)?;
        if length > MAX_REJECTION_BODY {
            return Err(ForwardError::InvalidUpgradeResponse);
        }
        while buf.len() < length {
            if !read_more(stream, &mut buf).await? {
                return Err(truncated_body());
            }
        }
        buf.truncate(length);
        return Ok(buf);
    }

    while read_more(stream, &mut buf).await? {}
    Ok(buf)
}

/// Append one read to `buf`. Returns false once the backend has closed.
async fn read_more<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<bool, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    if buf.len() > MAX_REJECTION_BODY + MAX_UPGRADE_HEAD {
        return Err(ForwardError::InvalidUpgradeResponse);
    }
    Ok(true)
}

fn truncated_body() -> ForwardError {
    ForwardError::Handshake(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "backend closed connection mid-body",
    ))
}

#[derive(Debug, PartialEq)]
enum Chunked {
    Complete(Vec<u8>),
    Incomplete,
    Invalid,
}

/// Decode a complete chunked body from `buf`, trailers included
fn decode_chunked(buf: &[u8]) -> Chunked {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(&buf[pos..]) {
            Some(i) => pos + i,
            None => return Chunked::Incomplete,
        };
        let size = std::str::from_utf8(&buf[pos..line_end])
            .ok()
            .and_then(|line| line.split(';').next())
            .and_then(|size| usize::from_str_radix(size.trim(), 16).ok());
        let size = match size {
            Some(size) if size <= MAX_REJECTION_BODY => size,
            _ => return Chunked::Invalid,
        };
        pos = line_end + 2;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                match find_crlf(&buf[pos..]) {
                    Some(0) => return Chunked::Complete(body),
                    Some(i) => pos += i + 2,
                    None => return Chunked::Incomplete,
                }
            }
        }

        if buf.len() < pos + size + 2 {
            return Chunked::Incomplete;
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Chunked::Invalid;
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if body.len() > MAX_REJECTION_BODY {
            return Chunked::Invalid;
        }
        pos += size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Index just past the `\r\n\r\n` that ends a response head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the backend's response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
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

    fn ws_request(host: &str) -> Request<()> {
        Request::builder()
            .method("GET")
            .uri("/ws?room=1")
            .header("host", host)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&ws_request("app1.localhost")));

        let plain = Request::builder()
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&plain));

        let missing_upgrade = Request::builder()
            .header("connection", "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&missing_upgrade));
    }

    #[test]
    fn test_build_upgrade_request_change_origin() {
        let raw = build_upgrade_request(&ws_request("app1.localhost"), "10.0.0.5:3000", true);
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("GET /ws?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.5:3000\r\n"));
        assert!(!text.contains("app1.localhost"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(text.matches("ost: ").count(), 1);
    }

    #[test]
    fn test_build_upgrade_request_keeps_host() {
        let raw = build_upgrade_request(&ws_request("app1.localhost"), "10.0.0.5:3000", false);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("host: app1.localhost\r\n"));
        assert!(!text.contains("10.0.0.5"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[2], ("Sec-WebSocket-Accept".to_string(), "abc".to_string()));

        assert!(parse_upgrade_response(b"garbage\r\n\r\n").is_none());
        assert!(parse_upgrade_response(b"HTTP/1.1 abc OK\r\n\r\n").is_none());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 OK\r\n\r\nxyz"), Some(19));
        assert_eq!(find_head_end(b"HTTP/1.1 101 OK\r\n"), None);
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi")
                .await
                .unwrap();
        });

        let (head, leftover) = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        // The frame may arrive in a later read; whatever came with the head is kept
        assert!(leftover.is_empty() || leftover.starts_with(b"\x81"));
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let err = read_response_head(&mut client).await.unwrap_err();
        assert!(matches!(err, ForwardError::Handshake(_)));
    }

    #[test]
    fn test_decode_chunked() {
        assert_eq!(
            decode_chunked(b"9\r\nforbidden\r\n0\r\n\r\n"),
            Chunked::Complete(b"forbidden".to_vec())
        );
        assert_eq!(
            decode_chunked(b"4;ext=1\r\nforb\r\n5\r\nidden\r\n0\r\nX-Trailer: 1\r\n\r\n"),
            Chunked::Complete(b"forbidden".to_vec())
        );
        assert_eq!(decode_chunked(b"9\r\nforb"), Chunked::Incomplete);
        assert_eq!(decode_chunked(b"0\r\n"), Chunked::Incomplete);
        assert_eq!(decode_chunked(b"zz\r\nabc\r\n"), Chunked::Invalid);
        assert_eq!(decode_chunked(b"3\r\nabcXY0\r\n\r\n"), Chunked::Invalid);
    }

    #[tokio::test]
    async fn test_rejection_body_waits_for_content_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"forb").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.write_all(b"idden and more").await.unwrap();
        });

        let headers = vec![("Content-Length".to_string(), "9".to_string())];
        let body = read_rejection_body(&mut client, StatusCode::FORBIDDEN, &headers, Vec::new())
            .await
            .unwrap();
        assert_eq!(body, b"forbidden");
    }

    #[tokio::test]
    async fn test_rejection_body_reads_to_eof_without_framing() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"idden").await.unwrap();
        });

        let body = read_rejection_body(&mut client, StatusCode::FORBIDDEN, &[], b"forb".to_vec())
            .await
            .unwrap();
        assert_eq!(body, b"forbidden");
    }

    #[tokio::test]
    async fn test_rejection_body_truncated() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);

        let headers = vec![("content-length".to_string(), "9".to_string())];
        let err = read_rejection_body(&mut client, StatusCode::FORBIDDEN, &headers, b"forb".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Handshake(_)));

        let (mut client, _server) = tokio::io::duplex(64);
        let body = read_rejection_body(&mut client, StatusCode::NO_CONTENT, &headers, Vec::new())
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut req = Request::builder()
            .uri("/")
            .header("host", "app1.localhost")
            .header(X_FORWARDED_FOR, "1.2.3.4")
            .body(())
            .unwrap();
        let addr: SocketAddr = "192.168.1.10:5555".parse().unwrap();

        set_forwarding_headers(&mut req, addr, "req-1");
        assert_eq!(req.headers()[X_FORWARDED_FOR], "192.168.1.10");
        assert_eq!(req.headers()[X_FORWARDED_HOST], "app1.localhost");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "http");
        assert_eq!(req.headers()[X_REQUEST_ID], "req-1");
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let server = ProxyServer::with_config(
            addr,
            crate::registry::ServiceRegistry::shared(),
            rx,
            PoolConfig::default(),
            ForwardSettings::default(),
        );

        let err = server.bind().await.unwrap_err();
        assert!(err.to_string().contains(&addr.to_string()));
        assert!(server.run().await.is_err());
    }

    #[test]
    fn test_forward_settings_from_config() {
        let settings = ForwardSettings::default();
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.upgrade_timeout, Duration::from_secs(10));
        assert!(settings.upgrade_max_lifetime.is_none());
        assert!(settings.change_origin);
    }
}
