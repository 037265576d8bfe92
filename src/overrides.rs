//! Request and response override rules attached to proxy routes
//!
//! Override values may reference the request being proxied and, for response
//! overrides, the backend response:
//!
//! - `{request.method}`, `{request.path}`
//! - `{request.headers.NAME}`, `{request.querystring.NAME}`
//! - `{backend.response.status}`, `{backend.response.headers.NAME}`
//! - `{NAME}` for any route parameter
//!
//! Anything else in braces is left untouched.

use crate::binding::query_param;
use crate::template::{expand_with, param_value};
use hyper::body::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION};
use hyper::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Overrides applied to the request before it is forwarded
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RequestOverrides {
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub querystring: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl RequestOverrides {
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.headers.is_empty()
            && self.querystring.is_empty()
            && self.body.is_none()
    }
}

/// Overrides applied to the backend response before it is returned
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseOverrides {
    pub status: Option<u16>,
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// When set, the response becomes a redirect to this target
    pub redirect: Option<String>,
}

impl ResponseOverrides {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.reason.is_none()
            && self.headers.is_empty()
            && self.body.is_none()
            && self.redirect.is_none()
    }
}

/// Values visible to placeholder expansion
#[derive(Debug, Clone)]
pub struct PlaceholderScope {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub params: BTreeMap<String, String>,
    pub backend_status: Option<StatusCode>,
    pub backend_headers: Option<HeaderMap>,
}

impl PlaceholderScope {
    pub fn new(
        method: Method,
        path: &str,
        query: &str,
        headers: HeaderMap,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            headers,
            params,
            backend_status: None,
            backend_headers: None,
        }
    }

    pub fn with_backend<B>(mut self, response: &Response<B>) -> Self {
        self.backend_status = Some(response.status());
        self.backend_headers = Some(response.headers().clone());
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(header) = name.strip_prefix("request.headers.") {
            return Some(header_text(&self.headers, header));
        }
        if let Some(key) = name.strip_prefix("request.querystring.") {
            return Some(query_param(&self.query, key).unwrap_or_default());
        }
        if let Some(header) = name.strip_prefix("backend.response.headers.") {
            return self
                .backend_headers
                .as_ref()
                .map(|headers| header_text(headers, header));
        }
        match name {
            "request.method" => Some(self.method.to_string()),
            "request.path" => Some(self.path.clone()),
            "backend.response.status" => self.backend_status.map(|s| s.as_u16().to_string()),
            _ => param_value(&self.params, name).cloned(),
        }
    }

    /// Expand placeholders in `text`
    pub fn expand(&self, text: &str) -> String {
        expand_with(text, |name| self.resolve(name))
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Insert or replace headers, skipping names or values that are not valid HTTP
fn overlay_headers(target: &mut HeaderMap, headers: &BTreeMap<String, String>, scope: &PlaceholderScope) {
    for (name, value) in headers {
        let expanded = scope.expand(value);
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&expanded),
        ) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid override header"),
        }
    }
}

/// Replace or add query parameters in a raw query string
fn overlay_query(query: &str, overrides: &BTreeMap<String, String>, scope: &PlaceholderScope) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            (k.to_string(), v.to_string())
        })
        .collect();

    for (key, value) in overrides {
        let encoded = urlencoding::encode(&scope.expand(value)).into_owned();
        match pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(pair) => pair.1 = encoded,
            None => pairs.push((key.clone(), encoded)),
        }
    }

    pairs
        .into_iter()
        .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join("&")
}

/// Mutable view of a request being proxied
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestOverrides {
    pub fn apply(&self, request: &mut OutboundRequest, scope: &PlaceholderScope) {
        if let Some(method) = &self.method {
            match Method::from_bytes(scope.expand(method).as_bytes()) {
                Ok(method) => request.method = method,
                Err(_) => warn!(method = %method, "Skipping invalid override method"),
            }
        }

        overlay_headers(&mut request.headers, &self.headers, scope);

        if !self.querystring.is_empty() {
            request.query = overlay_query(&request.query, &self.querystring, scope);
        }

        if let Some(body) = &self.body {
            request.body = Bytes::from(scope.expand(body));
            request.headers.remove(CONTENT_LENGTH);
        }
    }
}

impl ResponseOverrides {
    pub fn apply(&self, mut response: Response<Bytes>, scope: &PlaceholderScope) -> Response<Bytes> {
        if let Some(target) = &self.redirect {
            *response.status_mut() = StatusCode::FOUND;
            match HeaderValue::from_str(&scope.expand(target)) {
                Ok(location) => {
                    response.headers_mut().insert(LOCATION, location);
                }
                Err(_) => warn!(target = %target, "Skipping invalid redirect target"),
            }
            return response;
        }

        if let Some(status) = self.status.and_then(|s| StatusCode::from_u16(s).ok()) {
            *response.status_mut() = status;
        }

        if let Some(reason) = &self.reason {
            match ReasonPhrase::try_from(scope.expand(reason)) {
                Ok(phrase) => {
                    response.extensions_mut().insert(phrase);
                }
                Err(_) => warn!(reason = %reason, "Skipping invalid reason phrase"),
            }
        }

        overlay_headers(response.headers_mut(), &self.headers, scope);

        if let Some(body) = &self.body {
            *response.body_mut() = Bytes::from(scope.expand(body));
            response.headers_mut().remove(CONTENT_LENGTH);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> PlaceholderScope {
        let mut headers = HeaderMap::new();
        headers.insert("x-user", HeaderValue::from_static("alice"));
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), "42".to_string());
        PlaceholderScope::new(Method::GET, "/items/42", "q=hello%20there", headers, params)
    }

    fn outbound() -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            path: "/items/42".to_string(),
            query: "q=1&keep=yes".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let s = scope();
        assert_eq!(s.expand("{request.method} {request.path}"), "GET /items/42");
        assert_eq!(s.expand("user={request.headers.x-user}"), "user=alice");
        assert_eq!(s.expand("{request.querystring.q}"), "hello there");
        assert_eq!(s.expand("id={id}"), "id=42");
        assert_eq!(s.expand("id={ID}"), "id=42");
        assert_eq!(s.expand(r#"{"test":"{}{123}"}"#), r#"{"test":"{}{123}"}"#);
        assert_eq!(s.expand("{backend.response.status}"), "{backend.response.status}");
    }

    #[test]
    fn test_backend_placeholders() {
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("etag", "abc")
            .body(Bytes::new())
            .unwrap();
        let s = scope().with_backend(&response);
        assert_eq!(
            s.expand("{backend.response.status}/{backend.response.headers.etag}"),
            "201/abc"
        );
    }

    #[test]
    fn test_request_overrides() {
        let overrides = RequestOverrides {
            method: Some("POST".to_string()),
            headers: BTreeMap::from([("x-forwarded-id".to_string(), "{id}".to_string())]),
            querystring: BTreeMap::from([
                ("q".to_string(), "replaced value".to_string()),
                ("added".to_string(), "1".to_string()),
            ]),
            body: Some("{\"user\":\"{request.headers.x-user}\"}".to_string()),
        };

        let mut request = outbound();
        overrides.apply(&mut request, &scope());

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers.get("x-forwarded-id").unwrap(), "42");
        assert_eq!(request.query, "q=replaced%20value&keep=yes&added=1");
        assert_eq!(request.body, Bytes::from_static(b"{\"user\":\"alice\"}"));
    }

    #[test]
    fn test_redirect_ignores_backend_status() {
        let overrides = ResponseOverrides {
            redirect: Some("http://www.example.com/".to_string()),
            status: Some(201),
            ..Default::default()
        };
        let backend = Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Bytes::from_static(b"Pong"))
            .unwrap();

        let response = overrides.apply(backend, &scope());
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "http://www.example.com/"
        );
        assert_eq!(response.body(), &Bytes::from_static(b"Pong"));
    }

    #[test]
    fn test_response_overlay() {
        let overrides = ResponseOverrides {
            status: Some(201),
            reason: Some("test".to_string()),
            headers: BTreeMap::from([("myversion".to_string(), "123".to_string())]),
            body: Some("{\"test\":\"{backend.response.status}\"}".to_string()),
            redirect: None,
        };
        let backend = Response::builder()
            .status(StatusCode::OK)
            .header("x-backend", "kept")
            .header("content-length", "4")
            .body(Bytes::from_static(b"Pong"))
            .unwrap();

        let s = scope().with_backend(&backend);
        let response = overrides.apply(backend, &s);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("myversion").unwrap(), "123");
        assert_eq!(response.headers().get("x-backend").unwrap(), "kept");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(response.body(), &Bytes::from_static(b"{\"test\":\"200\"}"));
        assert_eq!(
            response.extensions().get::<ReasonPhrase>().unwrap().as_bytes(),
            b"test"
        );
    }

    #[test]
    fn test_empty_overrides_pass_through() {
        let backend = Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Bytes::from_static(b"x"))
            .unwrap();
        let response = ResponseOverrides::default().apply(backend, &scope());
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(RequestOverrides::default().is_empty());
        assert!(ResponseOverrides::default().is_empty());
    }
}
