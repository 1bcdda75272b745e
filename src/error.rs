//! Error types for the control plane and JSON error responses for the front end

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures talking to the shared table store.
///
/// Every variant is surfaced to the caller as-is: the control plane never
/// substitutes a guessed value for a record it could not read.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (after retries, at startup)
    #[error("table store unreachable: {0}")]
    Unreachable(String),
    /// The store reported an error while serving a request
    #[error("table store error: {0}")]
    Backend(String),
    /// A hash operation was attempted on a scalar key or vice versa
    #[error("wrong kind of value stored at key '{0}'")]
    WrongType(String),
    /// A structured record could not be decoded
    #[error("corrupt record at key '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A readiness line (or any `host:port` string) that could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("empty readiness line")]
    Empty,
    #[error("missing port in '{0}'")]
    MissingPort(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("empty host in '{0}'")]
    EmptyHost(String),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Neither the host nor the access key maps to a pool
    UnknownPool,
    /// The pool's backend could not be started
    BackendStartFailed,
    /// The placement moved while a forwarded request was in flight
    PlacementChanged,
    /// The shared table store is not answering
    StoreUnavailable,
    /// Request timed out waiting for the backend
    RequestTimeout,
    /// Failed to connect to the backend or remote node
    ConnectionFailed,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UnknownPool => StatusCode::NOT_FOUND,
            GatewayErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::PlacementChanged => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Poolmux-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::UnknownPool => "UNKNOWN_POOL",
            GatewayErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            GatewayErrorCode::PlacementChanged => "PLACEMENT_CHANGED",
            GatewayErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Poolmux-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Poolmux-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
