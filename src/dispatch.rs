//! Request dispatch: proxy routes first, then function routes
//!
//! A proxy whose backend is this host is re-dispatched in-process with the
//! same [`ProxyInvocationContext`], so chained proxies share one loop guard.

use crate::auth::KeyValidator;
use crate::binding::{HttpRequestData, InvocationValue};
use crate::context::ProxyInvocationContext;
use crate::error::HostError;
use crate::function::FunctionRegistry;
use crate::invoker::FunctionInvoker;
use crate::overrides::{OutboundRequest, PlaceholderScope};
use crate::pool::{BackendClient, BackendRequest};
use crate::routes::{RouteMatch, RouteTable, SharedRouteTable};
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Dispatcher {
    routes: SharedRouteTable,
    functions: Arc<FunctionRegistry>,
    backend: BackendClient,
    keys: Arc<dyn KeyValidator>,
    host_name: String,
}

impl Dispatcher {
    pub fn new(
        routes: SharedRouteTable,
        functions: Arc<FunctionRegistry>,
        backend: BackendClient,
        keys: Arc<dyn KeyValidator>,
        host_name: &str,
    ) -> Self {
        Self {
            routes,
            functions,
            backend,
            keys,
            host_name: host_name.to_string(),
        }
    }

    pub fn routes(&self) -> &SharedRouteTable {
        &self.routes
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    /// Dispatch one inbound request. Every failure becomes an error response.
    pub async fn dispatch(&self, request: Request<Bytes>, request_id: &str) -> Response<Bytes> {
        let routes = self.routes.snapshot();
        let (parts, body) = request.into_parts();
        let mut ctx = ProxyInvocationContext::new(
            request_id,
            parts.method.clone(),
            parts.uri.clone(),
            parts.headers.clone(),
        );

        let hop = OutboundRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts.headers,
            body,
        };

        let response = match self.route(&routes, &mut ctx, hop).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    HostError::RouteNotFound { .. } | HostError::Unauthorized { .. } => {
                        debug!(request_id, error = %e, "No route")
                    }
                    _ => warn!(request_id, chain = ?ctx.chain(), error = %e, "Dispatch failed"),
                }
                e.into_response()
            }
        };

        finalize(response, ctx.original_method())
    }

    fn route<'a>(
        &'a self,
        routes: &'a RouteTable,
        ctx: &'a mut ProxyInvocationContext,
        request: OutboundRequest,
    ) -> BoxFuture<'a, Result<Response<Bytes>, HostError>> {
        Box::pin(async move {
            if let Some(matched) = routes.find(&request.method, &request.path) {
                return self.proxy(routes, ctx, matched, request).await;
            }

            if let Some((invoker, params)) = self.functions.find_route(&request.method, &request.path) {
                return self.invoke_function(ctx, invoker, params, request).await;
            }

            Err(HostError::RouteNotFound {
                method: request.method.to_string(),
                path: request.path,
            })
        })
    }

    async fn proxy(
        &self,
        routes: &RouteTable,
        ctx: &mut ProxyInvocationContext,
        matched: RouteMatch,
        mut request: OutboundRequest,
    ) -> Result<Response<Bytes>, HostError> {
        let RouteMatch { route, params } = matched;
        ctx.enter(&route.name)?;

        debug!(
            request_id = ctx.request_id(),
            route = %route.name,
            depth = ctx.depth(),
            method = %request.method,
            path = %request.path,
            "Proxy route matched"
        );

        let scope = PlaceholderScope::new(
            request.method.clone(),
            &request.path,
            &request.query,
            request.headers.clone(),
            params.clone(),
        );
        let trailing_slash = request.path.len() > 1 && request.path.ends_with('/');

        route.request_overrides.apply(&mut request, &scope);

        let url = route
            .backend
            .compose(&params, trailing_slash, &request.query, |q| scope.expand(q))
            .map_err(|e| HostError::Internal(format!("route '{}': {}", route.name, e)))?;

        let backend_response = if route.backend.is_local(&self.host_name) {
            let uri: Uri = url
                .parse()
                .map_err(|e| HostError::Internal(format!("route '{}': bad url {}: {}", route.name, url, e)))?;
            debug!(request_id = ctx.request_id(), route = %route.name, url = %url, "Dispatching locally");

            // The next hop sees the composed backend URL, as an external backend would
            let mut headers = request.headers;
            if let Some(value) = uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
                headers.insert(HOST, value);
            }

            let local = OutboundRequest {
                method: request.method,
                path: uri.path().to_string(),
                query: uri.query().unwrap_or_default().to_string(),
                headers,
                body: request.body,
            };
            self.route(routes, ctx, local).await?
        } else {
            debug!(request_id = ctx.request_id(), route = %route.name, url = %url, "Forwarding to backend");
            self.backend
                .send(BackendRequest {
                    method: request.method,
                    url,
                    headers: request.headers,
                    body: request.body,
                })
                .await?
        };

        let scope = scope.with_backend(&backend_response);
        Ok(route.response_overrides.apply(backend_response, &scope))
    }

    async fn invoke_function(
        &self,
        ctx: &ProxyInvocationContext,
        invoker: Arc<FunctionInvoker>,
        params: BTreeMap<String, String>,
        request: OutboundRequest,
    ) -> Result<Response<Bytes>, HostError> {
        let descriptor = invoker.descriptor();

        let host = request
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(self.host_name.as_str())
            .to_string();
        let url = if request.query.is_empty() {
            format!("http://{}{}", host, request.path)
        } else {
            format!("http://{}{}?{}", host, request.path, request.query)
        };

        let data = HttpRequestData {
            method: request.method,
            url,
            path: request.path,
            query: request.query,
            headers: request.headers,
            body: request.body,
            params,
            response: None,
        };

        if !self.keys.validate(&descriptor, &data) {
            debug!(request_id = ctx.request_id(), function = %descriptor.name, "Function key rejected");
            return Err(HostError::Unauthorized {
                method: data.method.to_string(),
                path: data.path,
            });
        }

        debug!(request_id = ctx.request_id(), function = %descriptor.name, "Invoking function");

        let result = invoker.invoke(InvocationValue::Request(Box::new(data))).await?;
        let response = result.into_request().and_then(|r| r.response);

        Ok(match response {
            Some(response) => response.into_response(),
            None => {
                let mut empty = Response::new(Bytes::new());
                *empty.status_mut() = StatusCode::NO_CONTENT;
                empty
            }
        })
    }
}

/// A body-less 304 drops its `Content-Type` unless the client asked with HEAD
fn finalize(mut response: Response<Bytes>, original_method: &Method) -> Response<Bytes> {
    if response.status() == StatusCode::NOT_MODIFIED
        && response.body().is_empty()
        && original_method != Method::HEAD
    {
        response.headers_mut().remove(CONTENT_TYPE);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConfiguredKeys;
    use crate::compiler::CompilerRegistry;
    use crate::config::{FunctionConfig, ProxyConfig};
    use crate::metrics::HostMetrics;
    use crate::overrides::ResponseOverrides;
    use crate::pool::PoolConfig;
    use hyper::header::LOCATION;
    use std::collections::BTreeMap;
    use std::path::Path;

    const PING: &str = r#"{"parameters": ["req"], "rules": [
        {"when": {"query": {"a": "*"}}, "body": "{request.path}?a={request.querystring.a}"},
        {"body": "Pong"}
    ]}"#;

    const ECHO_PATH: &str = r#"{"parameters": ["req"], "rules": [{"body": "{request.path}"}]}"#;

    fn dispatcher(dir: &Path, proxies: Vec<ProxyConfig>) -> Dispatcher {
        std::fs::write(dir.join("ping.json"), PING).unwrap();
        std::fs::write(dir.join("echo.json"), ECHO_PATH).unwrap();
        std::fs::write(
            dir.join("notmodified.json"),
            r#"{"parameters": ["req"], "rules": [{"status": 304, "headers": {"content-type": "fake/custom", "test": "1"}}]}"#,
        )
        .unwrap();

        let functions = Arc::new(FunctionRegistry::new(
            CompilerRegistry::with_builtin(),
            Arc::new(HostMetrics::new("i", "g")),
            "api",
            dir,
        ));
        functions
            .apply_config(&[
                FunctionConfig::new("Ping", "ping.json", "declarative"),
                FunctionConfig::new("Echo", "echo.json", "declarative").with_route("echo/{*rest}"),
                FunctionConfig::new("NotModified", "notmodified.json", "declarative"),
                FunctionConfig::new("Secure", "ping.json", "declarative").with_keys(&["abc"]),
            ])
            .unwrap();

        Dispatcher::new(
            SharedRouteTable::new(RouteTable::from_config(&proxies).unwrap()),
            functions,
            BackendClient::new(PoolConfig::default()),
            Arc::new(ConfiguredKeys),
            "localhost",
        )
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_function_route() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);

        let response = d.dispatch(get("/api/Ping"), "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"Pong"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);

        let response = d.dispatch(get("/nothing/here"), "r1").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "ROUTE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_key_rejection_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);

        let response = d.dispatch(get("/api/Secure"), "r1").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = d.dispatch(get("/api/Secure?code=abc"), "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_local_proxy_with_response_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut proxy = ProxyConfig::new("pingproxy", "/pingproxy", "http://localhost/api/Ping");
        proxy.response_override.headers = BTreeMap::from([("myversion".to_string(), "123".to_string())]);
        let d = dispatcher(dir.path(), vec![proxy]);

        let response = d.dispatch(get("/pingproxy"), "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("myversion").unwrap(), "123");
        assert_eq!(response.body(), &Bytes::from_static(b"Pong"));
    }

    #[tokio::test]
    async fn test_self_loop_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("myloop", "/myloop", "http://localhost/myloop")],
        );

        let response = d.dispatch(get("/myloop"), "r1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("Infinite loop"));
    }

    #[tokio::test]
    async fn test_indirect_loop_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![
                ProxyConfig::new("a", "/a", "http://localhost/b"),
                ProxyConfig::new("b", "/b", "http://localhost/a"),
            ],
        );

        let response = d.dispatch(get("/a"), "r1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chained_proxies_without_loop() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![
                ProxyConfig::new("outer", "/outer", "http://localhost/inner"),
                ProxyConfig::new("inner", "/inner", "http://localhost/api/Ping"),
            ],
        );

        let response = d.dispatch(get("/outer"), "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"Pong"));
    }

    #[tokio::test]
    async fn test_trailing_slash_with_wildcard_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("wild", "/myroute/{*rest}", "http://localhost/api/echo/{rest}")],
        );

        let response = d.dispatch(get("/myroute/mysubroute/?a=1"), "r1").await;
        assert_eq!(response.body(), &Bytes::from_static(b"/api/echo/mysubroute/"));

        let response = d.dispatch(get("/myroute/mysubroute"), "r1").await;
        assert_eq!(response.body(), &Bytes::from_static(b"/api/echo/mysubroute"));
    }

    #[tokio::test]
    async fn test_trailing_slash_dropped_for_literal_backend() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("lit", "/lit/{*rest}", "http://localhost/api/Ping")],
        );

        let response = d.dispatch(get("/lit/x/?a=1"), "r1").await;
        assert_eq!(response.body(), &Bytes::from_static(b"/api/Ping?a=1"));
    }

    #[tokio::test]
    async fn test_local_hop_sees_composed_backend_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("url.json"),
            r#"{"parameters": ["req"], "rules": [{"body": "{request.url}"}]}"#,
        )
        .unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new(
                "staticBackendUrlTest",
                "/staticBackendUrlTest/{*rest}",
                "http://localhost/api/Url?a=1",
            )],
        );
        d.functions()
            .insert(FunctionConfig::new("Url", "url.json", "declarative"))
            .unwrap();

        let request = Request::builder()
            .uri("/staticBackendUrlTest/blahblah/")
            .header(HOST, "localhost:7071")
            .body(Bytes::new())
            .unwrap();
        let response = d.dispatch(request, "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"http://localhost/api/Url?a=1"));

        // Direct calls still see the client's host
        let request = Request::builder()
            .uri("/api/Url")
            .header(HOST, "localhost:7071")
            .body(Bytes::new())
            .unwrap();
        let response = d.dispatch(request, "r2").await;
        assert_eq!(response.body(), &Bytes::from_static(b"http://localhost:7071/api/Url"));
    }

    #[tokio::test]
    async fn test_trailing_slash_dropped_for_parameter_terminated_backend() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("param", "/param/{id}", "http://localhost/api/echo/{id}")],
        );

        let response = d.dispatch(get("/param/blahblah/"), "r1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"/api/echo/blahblah"));
    }

    #[tokio::test]
    async fn test_redirect_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut proxy = ProxyConfig::new("redir", "/redirect", "http://localhost/api/Ping");
        proxy.response_override = ResponseOverrides {
            redirect: Some("http://www.redirects-regardless.com/".to_string()),
            ..Default::default()
        };
        let d = dispatcher(dir.path(), vec![proxy]);

        let response = d.dispatch(get("/redirect"), "r1").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "http://www.redirects-regardless.com/"
        );
    }

    #[tokio::test]
    async fn test_not_modified_content_type_rule() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("nm", "/contentTypePresenceTest", "http://localhost/api/NotModified")],
        );

        let response = d.dispatch(get("/contentTypePresenceTest"), "r1").await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        assert!(response.headers().get("test").is_some());

        let head = Request::builder()
            .method(Method::HEAD)
            .uri("/contentTypePresenceTest")
            .body(Bytes::new())
            .unwrap();
        let response = d.dispatch(head, "r2").await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "fake/custom");
        assert!(response.headers().get("test").is_some());
    }

    #[tokio::test]
    async fn test_route_table_swap_applies_to_new_requests() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);
        assert_eq!(d.dispatch(get("/p"), "r1").await.status(), StatusCode::NOT_FOUND);

        d.routes().replace(
            RouteTable::from_config(&[ProxyConfig::new("p", "/p", "http://localhost/api/Ping")]).unwrap(),
        );
        assert_eq!(d.dispatch(get("/p"), "r2").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_external_backend_unreachable_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let d = dispatcher(
            dir.path(),
            vec![ProxyConfig::new("ext", "/ext", &format!("http://127.0.0.1:{}/", port))],
        );
        let response = d.dispatch(get("/ext"), "r1").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_function_without_response_is_204() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);
        std::fs::write(
            dir.path().join("silent.json"),
            r#"{"parameters": ["req"], "rules": [{"when": {"method": "DELETE"}, "body": "x"}]}"#,
        )
        .unwrap();
        d.functions()
            .insert(FunctionConfig::new("Silent", "silent.json", "declarative"))
            .unwrap();

        let response = d.dispatch(get("/api/Silent"), "r1").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_compile_failure_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), vec![]);
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        d.functions()
            .insert(FunctionConfig::new("Broken", "broken.json", "declarative"))
            .unwrap();

        let response = d.dispatch(get("/api/Broken"), "r1").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "COMPILATION_FAILED");

        // Other functions are unaffected
        let response = d.dispatch(get("/api/Ping"), "r2").await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
