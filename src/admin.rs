//! Admin API: function listing, status, reload and host metrics

use crate::config::AuthLevel;
use crate::dispatch::Dispatcher;
use crate::metrics::HostMetrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = response(status, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// One entry of the function listing
#[derive(Debug, Serialize)]
pub struct FunctionEntry {
    pub name: String,
    pub invoke_url_template: String,
    pub methods: Vec<String>,
    pub auth_level: AuthLevel,
    pub runtime: Option<String>,
    pub state: Option<&'static str>,
    pub is_proxy: bool,
}

/// Everything the admin handlers read
pub struct AdminState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<HostMetrics>,
    pub host_name: String,
    pub auth_token: String,
}

impl AdminState {
    fn list_functions(&self, include_proxies: bool) -> Vec<FunctionEntry> {
        let mut entries: Vec<FunctionEntry> = self
            .dispatcher
            .functions()
            .list()
            .iter()
            .map(|invoker| {
                let descriptor = invoker.descriptor();
                FunctionEntry {
                    name: descriptor.name.clone(),
                    invoke_url_template: format!("https://{}{}", self.host_name, descriptor.route.raw()),
                    methods: descriptor.methods.clone(),
                    auth_level: descriptor.auth_level,
                    runtime: Some(descriptor.runtime.clone()),
                    state: Some(invoker.state().name()),
                    is_proxy: false,
                }
            })
            .collect();

        if include_proxies {
            let routes = self.dispatcher.routes().snapshot();
            entries.extend(routes.routes().iter().map(|route| FunctionEntry {
                name: route.name.clone(),
                invoke_url_template: format!("https://{}{}", self.host_name, route.route.raw()),
                methods: route.methods.clone(),
                auth_level: AuthLevel::Anonymous,
                runtime: None,
                state: None,
                is_proxy: true,
            }));
        }
        entries
    }
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
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
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn query_flag(query: Option<&str>, name: &str) -> bool {
    query
        .and_then(|q| crate::binding::query_param(q, name))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            return Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            ))
        }
        _ => {}
    }

    if !path.starts_with("/admin/") {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    }
    if !check_auth(req.headers(), &state.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let response = match (method, segments.as_slice()) {
        (&Method::GET, ["admin", "functions"]) => {
            let include_proxies = query_flag(req.uri().query(), "includeProxies");
            json_response(StatusCode::OK, &state.list_functions(include_proxies))
        }

        (&Method::GET, ["admin", "functions", name, "status"]) => {
            match state.dispatcher.functions().get(name) {
                Some(invoker) => json_response(StatusCode::OK, &invoker.status()),
                None => response(StatusCode::NOT_FOUND, "unknown function"),
            }
        }

        (&Method::POST, ["admin", "functions", name, "reload"]) => {
            match state.dispatcher.functions().get(name) {
                Some(invoker) => {
                    info!(function = %invoker.name(), "Reload requested via admin API");
                    let status = match invoker.reload().await {
                        Ok(_) => StatusCode::OK,
                        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    };
                    json_response(status, &invoker.status())
                }
                None => response(StatusCode::NOT_FOUND, "unknown function"),
            }
        }

        (&Method::GET, ["admin", "host", "metrics"]) => json_response(StatusCode::OK, &state.metrics.snapshot()),

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
