//! Compiler capability: turns function source text into an executable entry point
//!
//! The host core never depends on a concrete language toolchain. Each runtime
//! registers a [`FunctionCompiler`] in the [`CompilerRegistry`] and functions
//! select one by name through their `runtime` config key.

use crate::binding::InvocationValue;
use crate::function::FunctionDescriptor;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Severity of a compile diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Hidden,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Hidden => "hidden",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single compile diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Emit the diagnostic at the log level matching its severity
    pub fn log(&self, function: &str) {
        match self.severity {
            Severity::Hidden => debug!(function, diagnostic = %self.message, "Compile diagnostic"),
            Severity::Info => info!(function, diagnostic = %self.message, "Compile diagnostic"),
            Severity::Warning => warn!(function, diagnostic = %self.message, "Compile diagnostic"),
            Severity::Error => error!(function, diagnostic = %self.message, "Compile diagnostic"),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// True if any diagnostic has error severity
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}

/// Raw result of calling an entry point
pub enum CallOutcome {
    /// The call completed synchronously
    Ready(InvocationValue),
    /// The call returned a computation that must be awaited
    Deferred(BoxFuture<'static, Result<InvocationValue, String>>),
}

/// An executable function entry point
pub trait EntryPoint: Send + Sync {
    /// Declared parameter names, in position order
    fn parameters(&self) -> &[String];

    /// Invoke with arguments bound by position. An `Err` is the function's own fault.
    fn call(&self, args: &mut [InvocationValue]) -> Result<CallOutcome, String>;
}

/// What a compiler produces for one source text
pub struct Compilation {
    pub entry_point: Option<Arc<dyn EntryPoint>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Compilation {
    pub fn success(entry_point: Arc<dyn EntryPoint>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            entry_point: Some(entry_point),
            diagnostics,
        }
    }

    pub fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            entry_point: None,
            diagnostics,
        }
    }
}

/// Compiles function source for one runtime
pub trait FunctionCompiler: Send + Sync {
    /// Runtime name used in configuration
    fn runtime(&self) -> &'static str;

    /// File extensions whose change triggers a recompile; empty means any file
    fn watched_extensions(&self) -> &'static [&'static str];

    fn compile(&self, descriptor: &FunctionDescriptor, source: &str) -> Compilation;
}

/// A successfully compiled, invocable function
pub struct CompiledArtifact {
    entry_point: Arc<dyn EntryPoint>,
    diagnostics: Vec<Diagnostic>,
    trigger_position: Option<usize>,
    generation: u64,
    compiled_at: Instant,
}

impl CompiledArtifact {
    /// Build an artifact, resolving the trigger parameter position once
    pub fn new(
        entry_point: Arc<dyn EntryPoint>,
        diagnostics: Vec<Diagnostic>,
        trigger_name: &str,
        generation: u64,
    ) -> Self {
        let trigger_position = entry_point
            .parameters()
            .iter()
            .position(|p| p == trigger_name);
        Self {
            entry_point,
            diagnostics,
            trigger_position,
            generation,
            compiled_at: Instant::now(),
        }
    }

    pub fn entry_point(&self) -> &Arc<dyn EntryPoint> {
        &self.entry_point
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn trigger_position(&self) -> Option<usize> {
        self.trigger_position
    }

    /// Monotonic compile counter of the owning invoker
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("parameters", &self.entry_point.parameters())
            .field("diagnostics", &self.diagnostics)
            .field("trigger_position", &self.trigger_position)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Compilers keyed by runtime name
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    compilers: HashMap<String, Arc<dyn FunctionCompiler>>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every runtime shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::runtime::declarative::DeclarativeCompiler));
        registry.register(Arc::new(crate::runtime::static_content::StaticContentCompiler));
        registry
    }

    pub fn register(&mut self, compiler: Arc<dyn FunctionCompiler>) {
        self.compilers
            .insert(compiler.runtime().to_ascii_lowercase(), compiler);
    }

    pub fn get(&self, runtime: &str) -> Option<Arc<dyn FunctionCompiler>> {
        self.compilers.get(&runtime.to_ascii_lowercase()).cloned()
    }

    pub fn runtimes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.compilers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<String>);

    impl EntryPoint for Fixed {
        fn parameters(&self) -> &[String] {
            &self.0
        }

        fn call(&self, _args: &mut [InvocationValue]) -> Result<CallOutcome, String> {
            Ok(CallOutcome::Ready(InvocationValue::Null))
        }
    }

    #[test]
    fn test_has_errors() {
        assert!(!has_errors(&[Diagnostic::warning("w"), Diagnostic::info("i")]));
        assert!(has_errors(&[Diagnostic::warning("w"), Diagnostic::error("e")]));
        assert!(!has_errors(&[]));
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error("unexpected token");
        assert_eq!(d.to_string(), "error: unexpected token");
    }

    #[test]
    fn test_trigger_position_resolved_by_name() {
        let entry = Arc::new(Fixed(vec!["log".to_string(), "req".to_string()]));
        let artifact = CompiledArtifact::new(entry, Vec::new(), "req", 1);
        assert_eq!(artifact.trigger_position(), Some(1));

        let entry = Arc::new(Fixed(vec!["log".to_string()]));
        let artifact = CompiledArtifact::new(entry, Vec::new(), "req", 2);
        assert_eq!(artifact.trigger_position(), None);
        assert_eq!(artifact.generation(), 2);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = CompilerRegistry::with_builtin();
        assert!(registry.get("declarative").is_some());
        assert!(registry.get("Static").is_some());
        assert!(registry.get("csharp").is_none());
        assert_eq!(registry.runtimes(), vec!["declarative", "static"]);
    }
}
