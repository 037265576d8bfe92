//! Error taxonomy for the host and JSON error responses for the gateway

use crate::compiler::{Diagnostic, Severity};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Header naming the error code on error responses
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// A proxy chain entered the same route twice
    InfiniteLoop,
    /// Neither a proxy nor a function route matched
    RouteNotFound,
    /// Function source failed to compile
    CompilationFailed,
    /// The function itself raised a fault
    InvocationFailed,
    /// Failed to connect to an external backend
    ConnectionFailed,
    /// External backend did not answer in time
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InfiniteLoop => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::CompilationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InvocationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InfiniteLoop => "INFINITE_LOOP",
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::CompilationFailed => "COMPILATION_FAILED",
            ProxyErrorCode::InvocationFailed => "INVOCATION_FAILED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Compilation failure carrying the full diagnostic list
#[derive(Debug, Clone)]
pub struct CompilationError {
    pub function: String,
    pub diagnostics: Arc<Vec<Diagnostic>>,
}

impl CompilationError {
    pub fn new(function: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            function: function.into(),
            diagnostics: Arc::new(diagnostics),
        }
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }
}

impl std::fmt::Display for CompilationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Function '{}' compilation failed with {} error(s)",
            self.function,
            self.error_count()
        )?;
        if let Some(first) = self
            .diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
        {
            write!(f, ": {}", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompilationError {}

/// Every failure the dispatch path can surface to a caller
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("Infinite loop detected when trying to call proxy '{route}' (chain: {})", .chain.join(" -> "))]
    LoopDetected { route: String, chain: Vec<String> },

    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Key check rejected the request; reported as not found
    #[error("No route matches {method} {path}")]
    Unauthorized { method: String, path: String },

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Backend request timed out after {} seconds", .0.as_secs())]
    BackendTimeout(Duration),

    #[error("Function '{function}' failed: {message}")]
    InvocationFault { function: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HostError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            HostError::Compilation(_) => ProxyErrorCode::CompilationFailed,
            HostError::LoopDetected { .. } => ProxyErrorCode::InfiniteLoop,
            HostError::RouteNotFound { .. } | HostError::Unauthorized { .. } => {
                ProxyErrorCode::RouteNotFound
            }
            HostError::BackendUnreachable(_) => ProxyErrorCode::ConnectionFailed,
            HostError::BackendTimeout(_) => ProxyErrorCode::RequestTimeout,
            HostError::InvocationFault { .. } => ProxyErrorCode::InvocationFailed,
            HostError::Internal(_) => ProxyErrorCode::InternalError,
        }
    }

    /// Render as the JSON error response returned to the client
    pub fn into_response(self) -> Response<Bytes> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<Bytes> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()));
    response
}
