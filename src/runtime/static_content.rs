//! `static` runtime: the source file itself is the response body

use crate::binding::{HttpResponseData, InvocationValue};
use crate::compiler::{CallOutcome, Compilation, Diagnostic, EntryPoint, FunctionCompiler};
use crate::function::FunctionDescriptor;
use hyper::body::Bytes;
use hyper::StatusCode;
use std::path::Path;
use std::sync::Arc;

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub struct StaticContent {
    parameters: Vec<String>,
    body: Bytes,
    content_type: &'static str,
}

impl EntryPoint for StaticContent {
    fn parameters(&self) -> &[String] {
        &self.parameters
    }

    fn call(&self, _args: &mut [InvocationValue]) -> Result<CallOutcome, String> {
        Ok(CallOutcome::Ready(InvocationValue::Response(
            HttpResponseData::new(StatusCode::OK, self.body.clone())
                .with_content_type(self.content_type),
        )))
    }
}

pub struct StaticContentCompiler;

impl FunctionCompiler for StaticContentCompiler {
    fn runtime(&self) -> &'static str {
        "static"
    }

    fn watched_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn compile(&self, descriptor: &FunctionDescriptor, source: &str) -> Compilation {
        let mut diagnostics = Vec::new();
        if source.is_empty() {
            diagnostics.push(Diagnostic::info("source is empty; responses will have no body"));
        }

        Compilation::success(
            Arc::new(StaticContent {
                parameters: vec![descriptor.trigger.clone()],
                body: Bytes::from(source.to_string()),
                content_type: content_type_for(&descriptor.source),
            }),
            diagnostics,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Severity;
    use crate::config::FunctionConfig;
    use hyper::header::CONTENT_TYPE;

    fn descriptor(source: &str) -> FunctionDescriptor {
        let config = FunctionConfig::new("Page", source, "static");
        FunctionDescriptor::from_config(&config, "api", Path::new("/srv")).unwrap()
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type_for(Path::new("a/index.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("data.json")), "application/json");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_serves_source_text() {
        let compilation = StaticContentCompiler.compile(&descriptor("page.html"), "<h1>hi</h1>");
        assert!(compilation.diagnostics.is_empty());

        let entry = compilation.entry_point.unwrap();
        assert_eq!(entry.parameters(), &["req".to_string()]);

        let mut args = vec![InvocationValue::Null];
        match entry.call(&mut args).unwrap() {
            CallOutcome::Ready(InvocationValue::Response(response)) => {
                assert_eq!(response.body, Bytes::from_static(b"<h1>hi</h1>"));
                assert_eq!(
                    response.headers.get(CONTENT_TYPE).unwrap(),
                    "text/html; charset=utf-8"
                );
            }
            _ => panic!("expected a ready response"),
        }
    }

    #[test]
    fn test_empty_source_is_info() {
        let compilation = StaticContentCompiler.compile(&descriptor("empty.txt"), "");
        assert!(compilation.entry_point.is_some());
        assert_eq!(compilation.diagnostics[0].severity, Severity::Info);
    }
}
