//! Public HTTP listener for function and proxy routes

use crate::dispatch::Dispatcher;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Correlates a request across proxy hops; echoed on the response
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub struct HostServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HostServer {
    pub fn new(bind_addr: SocketAddr, dispatcher: Arc<Dispatcher>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Function routes listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Client connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed on function listener");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Function host shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_request(req, dispatcher, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("serving {}: {}", addr, e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Client-sent values are replaced, never appended to
    let headers = &mut parts.headers;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    debug!(method = %method, uri = %uri, request_id, "Dispatching request");

    let response = dispatcher
        .dispatch(Request::from_parts(parts, body), &request_id)
        .await;

    debug!(
        method = %method,
        uri = %uri,
        request_id,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    let (mut parts, body) = response.into_parts();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    Ok(Response::from_parts(parts, Full::new(body)))
}
