//! Per-request proxy context and loop guard

use crate::error::HostError;
use hyper::header::HeaderMap;
use hyper::{Method, Uri};

/// State carried through every hop of one inbound request
#[derive(Debug, Clone)]
pub struct ProxyInvocationContext {
    request_id: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    chain: Vec<String>,
}

impl ProxyInvocationContext {
    pub fn new(request_id: impl Into<String>, method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            request_id: request_id.into(),
            method,
            uri,
            headers,
            chain: Vec::new(),
        }
    }

    /// Record that `route` is being entered.
    ///
    /// Fails if the route was already entered for this request.
    pub fn enter(&mut self, route: &str) -> Result<(), HostError> {
        if self.chain.iter().any(|r| r.eq_ignore_ascii_case(route)) {
            let mut chain = self.chain.clone();
            chain.push(route.to_string());
            return Err(HostError::LoopDetected {
                route: route.to_string(),
                chain,
            });
        }
        self.chain.push(route.to_string());
        Ok(())
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Method of the inbound request, before any override
    pub fn original_method(&self) -> &Method {
        &self.method
    }

    pub fn original_uri(&self) -> &Uri {
        &self.uri
    }

    pub fn original_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Route names entered so far, in order
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}
