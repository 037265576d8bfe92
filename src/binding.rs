//! Invocation values, binding metadata and the result processing chain

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// HTTP request handed to a function through its trigger binding
#[derive(Debug, Clone)]
pub struct HttpRequestData {
    pub method: Method,
    /// Absolute URL as seen by the host
    pub url: String,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Values bound from the function's route template
    pub params: BTreeMap<String, String>,
    /// Response written back by a result binding
    pub response: Option<HttpResponseData>,
}

impl HttpRequestData {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        query_param(&self.query, name)
    }
}

/// Look up a query parameter in a raw query string
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.eq_ignore_ascii_case(name) {
                let value = value.replace('+', " ");
                Some(
                    urlencoding::decode(&value)
                        .map(|v| v.into_owned())
                        .unwrap_or(value),
                )
            } else {
                None
            }
        })
}

/// HTTP response produced by a function
#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponseData {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self
    }

    pub fn into_response(self) -> Response<Bytes> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// A value flowing into or out of a function
#[derive(Debug, Clone, Default)]
pub enum InvocationValue {
    #[default]
    Null,
    Text(String),
    Json(serde_json::Value),
    Bytes(Bytes),
    Request(Box<HttpRequestData>),
    Response(HttpResponseData),
}

impl InvocationValue {
    pub fn is_null(&self) -> bool {
        matches!(self, InvocationValue::Null)
    }

    pub fn as_request(&self) -> Option<&HttpRequestData> {
        match self {
            InvocationValue::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn into_request(self) -> Option<HttpRequestData> {
        match self {
            InvocationValue::Request(req) => Some(*req),
            _ => None,
        }
    }

    /// Short type name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationValue::Null => "null",
            InvocationValue::Text(_) => "text",
            InvocationValue::Json(_) => "json",
            InvocationValue::Bytes(_) => "bytes",
            InvocationValue::Request(_) => "request",
            InvocationValue::Response(_) => "response",
        }
    }
}

/// Binding direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
    #[serde(alias = "inout")]
    InOut,
}

/// Declared binding of a function
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct BindingMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub binding_type: String,
    #[serde(default)]
    pub direction: Direction,
}

impl BindingMetadata {
    pub fn new(name: &str, binding_type: &str, direction: Direction) -> Self {
        Self {
            name: name.to_string(),
            binding_type: binding_type.to_string(),
            direction,
        }
    }

    pub fn is_trigger(&self) -> bool {
        self.binding_type.to_ascii_lowercase().ends_with("trigger")
    }

    pub fn is_input(&self) -> bool {
        matches!(self.direction, Direction::In | Direction::InOut)
    }

    pub fn is_output(&self) -> bool {
        matches!(self.direction, Direction::Out | Direction::InOut)
    }
}

/// A binding able to turn a function's return value into its output
pub trait ResultBinding: Send + Sync {
    fn name(&self) -> &str;

    fn can_process(&self, result: &InvocationValue) -> bool;

    /// Write `result` into the trigger argument
    fn process(&self, trigger: &mut InvocationValue, result: InvocationValue);
}

/// `http` output binding: stores the return value as the trigger request's response
pub struct HttpResultBinding {
    name: String,
}

impl HttpResultBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ResultBinding for HttpResultBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_process(&self, result: &InvocationValue) -> bool {
        matches!(
            result,
            InvocationValue::Response(_)
                | InvocationValue::Text(_)
                | InvocationValue::Json(_)
                | InvocationValue::Bytes(_)
        )
    }

    fn process(&self, trigger: &mut InvocationValue, result: InvocationValue) {
        let response = match result {
            InvocationValue::Response(response) => response,
            InvocationValue::Text(text) => HttpResponseData::new(StatusCode::OK, text)
                .with_content_type("text/plain; charset=utf-8"),
            InvocationValue::Json(value) => {
                HttpResponseData::new(StatusCode::OK, value.to_string())
                    .with_content_type("application/json")
            }
            InvocationValue::Bytes(bytes) => HttpResponseData::new(StatusCode::OK, bytes)
                .with_content_type("application/octet-stream"),
            InvocationValue::Null | InvocationValue::Request(_) => return,
        };

        if let InvocationValue::Request(req) = trigger {
            req.response = Some(response);
        }
    }
}

/// Build the result binding for a declared binding, if its type has one
pub fn result_binding_for(metadata: &BindingMetadata) -> Option<Arc<dyn ResultBinding>> {
    match metadata.binding_type.to_ascii_lowercase().as_str() {
        "http" => Some(Arc::new(HttpResultBinding::new(&metadata.name))),
        _ => None,
    }
}

/// Ordered chain of result-capable bindings; the first capable one wins
#[derive(Clone, Default)]
pub struct ResultProcessor {
    bindings: Vec<Arc<dyn ResultBinding>>,
}

impl std::fmt::Debug for ResultProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| b.name()))
            .finish()
    }
}

impl ResultProcessor {
    pub fn new(bindings: Vec<Arc<dyn ResultBinding>>) -> Self {
        Self { bindings }
    }

    /// Inputs first, then outputs, each in declared order
    pub fn from_bindings(inputs: &[BindingMetadata], outputs: &[BindingMetadata]) -> Self {
        let bindings = inputs
            .iter()
            .chain(outputs.iter())
            .filter_map(result_binding_for)
            .collect();
        Self { bindings }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Hand the result to the first capable binding. Returns that binding's name.
    pub fn process(
        &self,
        args: &mut [InvocationValue],
        trigger_position: Option<usize>,
        result: InvocationValue,
    ) -> Option<String> {
        let position = trigger_position?;
        let trigger = args.get_mut(position)?;
        let binding = self.bindings.iter().find(|b| b.can_process(&result))?;
        binding.process(trigger, result);
        Some(binding.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InvocationValue {
        InvocationValue::Request(Box::new(HttpRequestData {
            method: Method::GET,
            url: "http://localhost/api/ping".to_string(),
            path: "/api/ping".to_string(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: BTreeMap::new(),
            response: None,
        }))
    }

    struct Recording {
        name: &'static str,
        accepts: fn(&InvocationValue) -> bool,
    }

    impl ResultBinding for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn can_process(&self, result: &InvocationValue) -> bool {
            (self.accepts)(result)
        }

        fn process(&self, trigger: &mut InvocationValue, _result: InvocationValue) {
            if let InvocationValue::Request(req) = trigger {
                req.response = Some(HttpResponseData::new(StatusCode::ACCEPTED, self.name));
            }
        }
    }

    #[test]
    fn test_query_param_decoding() {
        assert_eq!(query_param("a=1&b=hello%20world", "b"), Some("hello world".to_string()));
        assert_eq!(query_param("code=abc", "CODE"), Some("abc".to_string()));
        assert_eq!(query_param("flag&x=1", "flag"), Some(String::new()));
        assert_eq!(query_param("", "a"), None);
    }

    #[test]
    fn test_binding_metadata_trigger() {
        let trigger = BindingMetadata::new("req", "httpTrigger", Direction::In);
        let output = BindingMetadata::new("$return", "http", Direction::Out);
        assert!(trigger.is_trigger());
        assert!(trigger.is_input());
        assert!(!output.is_trigger());
        assert!(output.is_output());
    }

    #[test]
    fn test_first_capable_binding_wins() {
        let processor = ResultProcessor::new(vec![
            Arc::new(Recording {
                name: "never",
                accepts: |_| false,
            }),
            Arc::new(Recording {
                name: "first",
                accepts: |_| true,
            }),
            Arc::new(Recording {
                name: "second",
                accepts: |_| true,
            }),
        ]);

        let mut args = vec![InvocationValue::Null, request()];
        let used = processor.process(&mut args, Some(1), InvocationValue::Text("x".into()));
        assert_eq!(used.as_deref(), Some("first"));

        let response = args[1].as_request().unwrap().response.as_ref().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"first"));
    }

    #[test]
    fn test_no_capable_binding_writes_nothing() {
        let processor = ResultProcessor::from_bindings(
            &[BindingMetadata::new("req", "httpTrigger", Direction::In)],
            &[BindingMetadata::new("queue", "queue", Direction::Out)],
        );
        assert!(processor.is_empty());

        let mut args = vec![request()];
        let used = processor.process(&mut args, Some(0), InvocationValue::Text("x".into()));
        assert!(used.is_none());
        assert!(args[0].as_request().unwrap().response.is_none());
    }

    #[test]
    fn test_missing_trigger_position_skips_processing() {
        let processor = ResultProcessor::from_bindings(
            &[],
            &[BindingMetadata::new("$return", "http", Direction::Out)],
        );
        let mut args = vec![request()];
        assert!(processor
            .process(&mut args, None, InvocationValue::Text("x".into()))
            .is_none());
    }

    #[test]
    fn test_http_binding_converts_text_and_json() {
        let binding = HttpResultBinding::new("$return");
        assert!(binding.can_process(&InvocationValue::Text("Pong".into())));
        assert!(!binding.can_process(&InvocationValue::Null));

        let mut trigger = request();
        binding.process(&mut trigger, InvocationValue::Text("Pong".into()));
        let response = trigger.as_request().unwrap().response.clone().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"Pong"));

        binding.process(&mut trigger, InvocationValue::Json(serde_json::json!({"a": 1})));
        let response = trigger.as_request().unwrap().response.clone().unwrap();
        assert_eq!(
            response.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(response.body, Bytes::from_static(br#"{"a":1}"#));
    }
}
