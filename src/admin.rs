use crate::endpoint::normalize_service_name;
use crate::ingest::IngestStatus;
use crate::registry::SharedRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the router
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Read-only view of the routing table and ingestor health
#[derive(Clone)]
struct AdminState {
    registry: SharedRegistry,
    ingest_status: Arc<IngestStatus>,
    auth_token: Arc<String>,
}

/// Status API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: SharedRegistry,
        ingest_status: Arc<IngestStatus>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
            state: AdminState {
                registry,
                ingest_status,
                auth_token: Arc::new(auth_token),
            },
        }
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind status API on {}: {}", self.bind_addr, e))
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Status API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Status API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: AdminState) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Only `Authorization: Bearer <token>` is accepted
fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| constant_time_compare(token, expected_token))
        .unwrap_or(false)
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route_admin_request(&req, &state))
}

fn route_admin_request<B>(req: &Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the status API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/routes") | (&Method::GET, "/routes/") => {
            if !check_auth(req, &state.auth_token) {
                return unauthorized(path);
            }
            let routes = state.registry.snapshot();
            let body = serde_json::json!({
                "count": routes.len(),
                "routes": routes.iter().map(|e| e.as_ref()).collect::<Vec<_>>(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, path) if path.starts_with("/routes/") => {
            if !check_auth(req, &state.auth_token) {
                return unauthorized(path);
            }
            let name = normalize_service_name(path.strip_prefix("/routes/").unwrap_or(""));
            match state.registry.lookup(&name) {
                Some(endpoint) => match serde_json::to_string(endpoint.as_ref()) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => {
                        error!(service = %name, error = %e, "Failed to serialize route");
                        response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    }
                },
                None => response(StatusCode::NOT_FOUND, "no such route"),
            }
        }

        (&Method::GET, "/status") => {
            if !check_auth(req, &state.auth_token) {
                return unauthorized(path);
            }
            let body = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "routes": state.registry.len(),
                "ingest": state.ingest_status.snapshot(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn unauthorized(path: &str) -> Response<Full<Bytes>> {
    warn!(path, "Unauthorized admin API request");
    response(StatusCode::UNAUTHORIZED, "unauthorized")
}
