//! `declarative` runtime: functions written as JSON response rules
//!
//! ```json
//! {
//!   "parameters": ["req"],
//!   "rules": [
//!     { "when": { "method": "POST" }, "status": 201, "body": "created {request.path}" },
//!     { "when": { "query": { "slow": "1" } }, "delay_ms": 50, "body": "late" },
//!     { "when": { "header": { "x-fail": "*" } }, "fail": "asked to fail" },
//!     { "body": "Pong" }
//!   ]
//! }
//! ```
//!
//! The first rule whose `when` matches produces the response. No matching
//! rule means the function returns nothing.

use crate::binding::{HttpRequestData, HttpResponseData, InvocationValue};
use crate::compiler::{CallOutcome, Compilation, Diagnostic, EntryPoint, FunctionCompiler};
use crate::function::FunctionDescriptor;
use crate::template::{expand_with, param_value};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Definition {
    #[serde(default)]
    parameters: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSource {
    when: Option<Condition>,
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: Option<serde_json::Value>,
    delay_ms: Option<u64>,
    fail: Option<String>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Condition {
    method: Option<String>,
    #[serde(default)]
    header: BTreeMap<String, String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
}

impl Condition {
    fn is_unconditional(&self) -> bool {
        self.method.is_none() && self.header.is_empty() && self.query.is_empty()
    }

    fn matches(&self, request: Option<&HttpRequestData>) -> bool {
        if self.is_unconditional() {
            return true;
        }
        let Some(request) = request else {
            return false;
        };

        let wanted = |expected: &str, actual: Option<String>| match actual {
            Some(actual) => expected == "*" || actual == expected,
            None => false,
        };

        self.method
            .as_ref()
            .map_or(true, |m| m.eq_ignore_ascii_case(request.method.as_str()))
            && self
                .header
                .iter()
                .all(|(k, v)| wanted(v, request.header(k).map(str::to_string)))
            && self
                .query
                .iter()
                .all(|(k, v)| wanted(v, request.query_param(k)))
    }
}

#[derive(Debug, Clone)]
enum Body {
    Empty,
    Text(String),
    Json(String),
}

#[derive(Debug, Clone)]
struct Rule {
    when: Condition,
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
    body: Body,
    delay: Option<Duration>,
    fail: Option<String>,
}

fn resolve(request: Option<&HttpRequestData>, name: &str) -> Option<String> {
    let request = request?;
    if let Some(header) = name.strip_prefix("request.headers.") {
        return Some(request.header(header).unwrap_or_default().to_string());
    }
    if let Some(key) = name.strip_prefix("request.querystring.") {
        return Some(request.query_param(key).unwrap_or_default());
    }
    if let Some(param) = name.strip_prefix("params.") {
        return Some(param_value(&request.params, param).cloned().unwrap_or_default());
    }
    match name {
        "request.url" => Some(request.url.clone()),
        "request.method" => Some(request.method.to_string()),
        "request.path" => Some(request.path.clone()),
        _ => None,
    }
}

impl Rule {
    fn respond(&self, request: Option<&HttpRequestData>) -> Result<InvocationValue, String> {
        let expand = |text: &str| expand_with(text, |name| resolve(request, name));

        if let Some(message) = &self.fail {
            return Err(expand(message));
        }

        let mut response = match &self.body {
            Body::Empty => HttpResponseData::new(self.status, ""),
            Body::Text(text) => HttpResponseData::new(self.status, expand(text))
                .with_content_type("text/plain; charset=utf-8"),
            Body::Json(json) => {
                HttpResponseData::new(self.status, json.clone()).with_content_type("application/json")
            }
        };

        for (name, value) in &self.headers {
            let value = HeaderValue::from_str(&expand(value))
                .map_err(|_| format!("header '{}' expanded to an invalid value", name))?;
            response.headers.insert(name.clone(), value);
        }

        Ok(InvocationValue::Response(response))
    }
}

/// Compiled declarative function
pub struct DeclarativeFunction {
    parameters: Vec<String>,
    rules: Vec<Rule>,
}

impl EntryPoint for DeclarativeFunction {
    fn parameters(&self) -> &[String] {
        &self.parameters
    }

    fn call(&self, args: &mut [InvocationValue]) -> Result<CallOutcome, String> {
        let request = args.iter().find_map(InvocationValue::as_request);
        let Some(rule) = self.rules.iter().find(|r| r.when.matches(request)) else {
            return Ok(CallOutcome::Ready(InvocationValue::Null));
        };

        let result = rule.respond(request);
        match rule.delay {
            Some(delay) => Ok(CallOutcome::Deferred(Box::pin(async move {
                tokio::time::sleep(delay).await;
                result
            }))),
            None => result.map(CallOutcome::Ready),
        }
    }
}

pub struct DeclarativeCompiler;

impl DeclarativeCompiler {
    fn build_rule(index: usize, source: RuleSource, diagnostics: &mut Vec<Diagnostic>) -> Option<Rule> {
        let number = index + 1;
        let mut valid = true;

        let status = match StatusCode::from_u16(source.status) {
            Ok(status) if (100..=599).contains(&source.status) => status,
            _ => {
                diagnostics.push(Diagnostic::error(format!(
                    "rule {}: invalid status {}",
                    number, source.status
                )));
                valid = false;
                StatusCode::OK
            }
        };

        let mut headers = Vec::with_capacity(source.headers.len());
        for (name, value) in source.headers {
            match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => headers.push((name, value)),
                Err(_) => {
                    diagnostics.push(Diagnostic::error(format!(
                        "rule {}: invalid header name '{}'",
                        number, name
                    )));
                    valid = false;
                }
            }
        }

        let body = match source.body {
            None | Some(serde_json::Value::Null) => Body::Empty,
            Some(serde_json::Value::String(text)) => Body::Text(text),
            Some(value) => Body::Json(value.to_string()),
        };

        if source.fail.is_some() && !headers.is_empty() {
            diagnostics.push(Diagnostic::warning(format!(
                "rule {}: headers are ignored on a failing rule",
                number
            )));
        }

        valid.then(|| Rule {
            when: source.when.unwrap_or_default(),
            status,
            headers,
            body,
            delay: source.delay_ms.map(Duration::from_millis),
            fail: source.fail,
        })
    }
}

impl FunctionCompiler for DeclarativeCompiler {
    fn runtime(&self) -> &'static str {
        "declarative"
    }

    fn watched_extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn compile(&self, descriptor: &FunctionDescriptor, source: &str) -> Compilation {
        let definition: Definition = match serde_json::from_str(source) {
            Ok(definition) => definition,
            Err(e) => {
                return Compilation::failure(vec![Diagnostic::error(format!(
                    "line {} column {}: {}",
                    e.line(),
                    e.column(),
                    e
                ))])
            }
        };

        let mut diagnostics = Vec::new();

        if definition.parameters.is_empty() {
            diagnostics.push(Diagnostic::warning(
                "no parameters declared; the trigger value is not bound",
            ));
        } else if !definition.parameters.iter().any(|p| p == &descriptor.trigger) {
            diagnostics.push(Diagnostic::warning(format!(
                "trigger '{}' is not a declared parameter",
                descriptor.trigger
            )));
        }

        if definition.rules.is_empty() {
            diagnostics.push(Diagnostic::error("function defines no rules"));
        }

        let mut rules = Vec::with_capacity(definition.rules.len());
        let mut catch_all: Option<usize> = None;
        for (index, source) in definition.rules.into_iter().enumerate() {
            if let Some(first) = catch_all {
                diagnostics.push(Diagnostic::warning(format!(
                    "rule {} is unreachable after unconditional rule {}",
                    index + 1,
                    first + 1
                )));
            }
            let unconditional = source.when.as_ref().map_or(true, Condition::is_unconditional);
            if unconditional && catch_all.is_none() {
                catch_all = Some(index);
            }
            if let Some(rule) = Self::build_rule(index, source, &mut diagnostics) {
                rules.push(rule);
            }
        }

        Compilation::success(
            Arc::new(DeclarativeFunction {
                parameters: definition.parameters,
                rules,
            }),
            diagnostics,
        )
    }
}
