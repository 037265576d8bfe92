//! Pooled HTTP client for external backends
//!
//! Requests and responses are fully buffered. Only plain `http://` backends
//! are reachable; an `https://` backend fails with a connection error.

use crate::error::HostError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for backend requests
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent
    pub total_requests: AtomicU64,
    /// Requests that could not reach the backend
    pub failures: AtomicU64,
    /// Requests that timed out
    pub timeouts: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Max time for a backend to send its full response
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Outbound request to an external backend
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Pooled client used for external backends
pub struct BackendClient {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl BackendClient {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Backend client initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request and buffer the whole response
    pub async fn send(&self, request: BackendRequest) -> Result<Response<Bytes>, HostError> {
        let uri: Uri = request.url.parse().map_err(|e| {
            HostError::BackendUnreachable(format!("invalid backend url '{}': {}", request.url, e))
        })?;

        let mut headers = request.headers;
        headers.remove(HOST);
        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);
        if let Some(authority) = uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, value);
            }
        }

        let mut outbound = Request::new(Full::new(request.body));
        *outbound.method_mut() = request.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;

        self.stats.record_request();

        let exchange = async {
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|e| HostError::BackendUnreachable(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| HostError::BackendUnreachable(e.to_string()))?
                .to_bytes();
            Ok::<_, HostError>(Response::from_parts(parts, body))
        };

        let mut response = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(e);
            }
            Err(_) => {
                self.stats.record_timeout();
                return Err(HostError::BackendTimeout(self.config.request_timeout));
            }
        };

        response.headers_mut().remove(TRANSFER_ENCODING);
        response.headers_mut().remove(CONNECTION);
        Ok(response)
    }
}
