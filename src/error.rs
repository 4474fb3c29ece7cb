//! Error types and JSON error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors raised while turning lifecycle events into registry updates.
///
/// Everything except `SubscriptionLost` is contained per event: the ingestor
/// logs it and moves on to the next event.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The event could not be decoded or lacks required fields
    #[error("malformed lifecycle event: {0}")]
    MalformedEvent(String),

    /// Inspecting the container failed or timed out
    #[error("failed to fetch metadata for {id}: {reason}")]
    MetadataFetchFailed { id: String, reason: String },

    /// The container has no network address we can route to
    #[error("container {id} has no routable network address")]
    MissingAddress { id: String },

    /// The event subscription ended and could not be re-established
    #[error("event subscription lost: {0}")]
    SubscriptionLost(String),
}

impl IngestError {
    pub fn metadata(id: &str, reason: impl std::fmt::Display) -> Self {
        IngestError::MetadataFetchFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Only a lost subscription is allowed to stop the router
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::SubscriptionLost(_))
    }
}

/// Errors raised while forwarding a single request to a backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The registry entry has no usable port
    #[error("service {0} has no known port")]
    NoPort(String),

    /// TCP connect to the backend failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP exchange with the backend failed
    #[error("backend request failed: {0}")]
    Backend(#[from] crate::pool::PoolError),

    /// I/O error during the upgrade handshake
    #[error("upgrade handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    /// Backend answered the upgrade with something we could not parse
    #[error("invalid upgrade response from backend")]
    InvalidUpgradeResponse,

    /// The backend did not answer in time
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// Map a forwarding failure to the code the caller sees
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::NoPort(_) => ProxyErrorCode::NoServicePort,
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            _ => ProxyErrorCode::ConnectionFailed,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or unparseable Host header
    MissingHostHeader,
    /// No endpoint registered for the subdomain
    UnknownService,
    /// Endpoint registered without a port
    NoServicePort,
    /// Backend did not respond in time
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoServicePort => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::NoServicePort => "NO_SERVICE_PORT",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Same as [`json_error_response`], but asks the client to drop the
/// connection. Used when an upgrade attempt is refused.
pub fn json_error_close(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = json_error_response(code, message);
    response.headers_mut().insert(
        hyper::header::CONNECTION,
        hyper::header::HeaderValue::from_static("close"),
    );
    response
}
