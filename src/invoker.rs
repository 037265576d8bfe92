//! Per-function invoker and its compile lifecycle
//!
//! ```text
//!   Unloaded --first use / reload--> Compiling --ok--> Ready(artifact)
//!                                        |
//!                                        +--errors--> Faulted(diagnostics)
//!   Ready --reload--> Compiling (old artifact keeps serving)
//!   Faulted + retained artifact --next use--> Ready(retained)
//! ```
//!
//! At most one compile is in flight per function. Callers that need the
//! outcome subscribe to a `watch` channel, so they all observe the same
//! result. The serving artifact is an `Arc` swapped under the slot mutex and
//! never edited.

use crate::binding::InvocationValue;
use crate::compiler::{
    has_errors, CallOutcome, Compilation, CompiledArtifact, Diagnostic, FunctionCompiler, Severity,
};
use crate::error::{CompilationError, HostError};
use crate::function::FunctionDescriptor;
use crate::metrics::MetricsSink;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type CompileOutcome = Result<Arc<CompiledArtifact>, CompilationError>;

/// Lifecycle state of one function
#[derive(Debug, Clone)]
pub enum InvokerState {
    Unloaded,
    Compiling,
    Ready(Arc<CompiledArtifact>),
    Faulted(Arc<Vec<Diagnostic>>),
}

impl InvokerState {
    pub fn name(&self) -> &'static str {
        match self {
            InvokerState::Unloaded => "unloaded",
            InvokerState::Compiling => "compiling",
            InvokerState::Ready(_) => "ready",
            InvokerState::Faulted(_) => "faulted",
        }
    }
}

/// Serializable view of an invoker for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct InvokerStatus {
    pub name: String,
    pub runtime: String,
    pub state: &'static str,
    /// Compile generation of the artifact currently serving, if any
    pub serving_generation: Option<u64>,
    pub diagnostics: Vec<Diagnostic>,
}

struct Slot {
    state: InvokerState,
    /// Last good artifact; survives failed recompiles
    serving: Option<Arc<CompiledArtifact>>,
    in_flight: Option<watch::Receiver<Option<CompileOutcome>>>,
    generation: u64,
    last_diagnostics: Arc<Vec<Diagnostic>>,
}

pub struct FunctionInvoker {
    descriptor: RwLock<Arc<FunctionDescriptor>>,
    compiler: RwLock<Arc<dyn FunctionCompiler>>,
    slot: Mutex<Slot>,
    metrics: Arc<dyn MetricsSink>,
}

impl FunctionInvoker {
    pub fn new(
        descriptor: Arc<FunctionDescriptor>,
        compiler: Arc<dyn FunctionCompiler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            compiler: RwLock::new(compiler),
            slot: Mutex::new(Slot {
                state: InvokerState::Unloaded,
                serving: None,
                in_flight: None,
                generation: 0,
                last_diagnostics: Arc::new(Vec::new()),
            }),
            metrics,
        }
    }

    pub fn descriptor(&self) -> Arc<FunctionDescriptor> {
        Arc::clone(&self.descriptor.read())
    }

    pub fn compiler(&self) -> Arc<dyn FunctionCompiler> {
        Arc::clone(&self.compiler.read())
    }

    pub fn name(&self) -> String {
        self.descriptor.read().name.clone()
    }

    pub fn state(&self) -> InvokerState {
        self.slot.lock().state.clone()
    }

    pub fn status(&self) -> InvokerStatus {
        let descriptor = self.descriptor();
        let slot = self.slot.lock();
        InvokerStatus {
            name: descriptor.name.clone(),
            runtime: descriptor.runtime.clone(),
            state: slot.state.name(),
            serving_generation: slot.serving.as_ref().map(|a| a.generation()),
            diagnostics: slot.last_diagnostics.as_ref().clone(),
        }
    }

    /// Swap in a new descriptor after a config change. The function returns
    /// to `Unloaded` and recompiles on next use.
    pub fn replace_descriptor(
        &self,
        descriptor: Arc<FunctionDescriptor>,
        compiler: Arc<dyn FunctionCompiler>,
    ) {
        *self.descriptor.write() = descriptor;
        *self.compiler.write() = compiler;

        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.state = InvokerState::Unloaded;
        slot.serving = None;
        slot.in_flight = None;
        slot.last_diagnostics = Arc::new(Vec::new());
    }

    /// Get the artifact to run, compiling first if needed
    pub async fn get_executable(self: &Arc<Self>) -> Result<Arc<CompiledArtifact>, HostError> {
        let pending = {
            let mut slot = self.slot.lock();
            match slot.state.clone() {
                InvokerState::Ready(artifact) => return Ok(artifact),
                InvokerState::Compiling => {
                    if let Some(artifact) = &slot.serving {
                        return Ok(Arc::clone(artifact));
                    }
                    match slot.in_flight.clone() {
                        Some(rx) => rx,
                        None => self.start_compile(&mut slot),
                    }
                }
                InvokerState::Faulted(diagnostics) => match slot.serving.clone() {
                    Some(artifact) => {
                        warn!(
                            function = %self.name(),
                            errors = diagnostics.iter().filter(|d| d.severity == Severity::Error).count(),
                            generation = artifact.generation(),
                            "Latest compile failed, serving previous build"
                        );
                        slot.state = InvokerState::Ready(Arc::clone(&artifact));
                        return Ok(artifact);
                    }
                    None => self.start_compile(&mut slot),
                },
                InvokerState::Unloaded => self.start_compile(&mut slot),
            }
        };

        Self::wait(pending).await
    }

    /// Recompile, joining a compile that is already in flight
    pub async fn reload(self: &Arc<Self>) -> Result<Arc<CompiledArtifact>, HostError> {
        let pending = {
            let mut slot = self.slot.lock();
            match slot.in_flight.clone() {
                Some(rx) => {
                    debug!(function = %self.name(), "Reload joined compile in flight");
                    rx
                }
                None => self.start_compile(&mut slot),
            }
        };

        Self::wait(pending).await
    }

    /// Run the function with `trigger` bound to its trigger parameter.
    ///
    /// Returns the trigger argument after result processing.
    pub async fn invoke(self: &Arc<Self>, trigger: InvocationValue) -> Result<InvocationValue, HostError> {
        let descriptor = self.descriptor();
        self.metrics.invocation_started(&descriptor.name);
        let started = Instant::now();

        let result = self.invoke_artifact(&descriptor, trigger).await;

        self.metrics
            .invocation_completed(&descriptor.name, result.is_ok(), started.elapsed());
        result
    }

    async fn invoke_artifact(
        self: &Arc<Self>,
        descriptor: &FunctionDescriptor,
        trigger: InvocationValue,
    ) -> Result<InvocationValue, HostError> {
        let artifact = self.get_executable().await?;
        let entry_point = artifact.entry_point();
        let position = artifact.trigger_position();

        let mut args = vec![InvocationValue::Null; entry_point.parameters().len()];
        let mut unbound = Some(trigger);
        if let Some(slot) = position.and_then(|p| args.get_mut(p)) {
            *slot = unbound.take().unwrap_or_default();
        }

        let fault = |message: String| HostError::InvocationFault {
            function: descriptor.name.clone(),
            message,
        };

        let result = match entry_point.call(&mut args).map_err(fault)? {
            CallOutcome::Ready(value) => value,
            CallOutcome::Deferred(pending) => pending.await.map_err(fault)?,
        };

        if let Some(binding) = descriptor
            .result_processor
            .process(&mut args, position, result)
        {
            debug!(function = %descriptor.name, binding = %binding, "Result processed");
        }

        Ok(match position.and_then(|p| args.get_mut(p)) {
            Some(slot) => std::mem::take(slot),
            None => unbound.unwrap_or_default(),
        })
    }

    /// Mark the slot as compiling and spawn the compile task
    fn start_compile(self: &Arc<Self>, slot: &mut Slot) -> watch::Receiver<Option<CompileOutcome>> {
        let (tx, rx) = watch::channel(None);
        slot.generation += 1;
        slot.state = InvokerState::Compiling;
        slot.in_flight = Some(rx.clone());

        let generation = slot.generation;
        let invoker = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = invoker.compile(generation).await;
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    async fn compile(&self, generation: u64) -> CompileOutcome {
        let descriptor = self.descriptor();
        let compiler = self.compiler();
        let name = descriptor.name.clone();
        let started = Instant::now();

        info!(function = %name, runtime = %descriptor.runtime, generation, "Compiling function");

        let task_descriptor = Arc::clone(&descriptor);
        let compilation = tokio::task::spawn_blocking(move || {
            match std::fs::read_to_string(&task_descriptor.source) {
                Ok(source) => compiler.compile(&task_descriptor, &source),
                Err(e) => Compilation::failure(vec![Diagnostic::error(format!(
                    "Unable to read source {}: {}",
                    task_descriptor.source.display(),
                    e
                ))]),
            }
        })
        .await
        .unwrap_or_else(|e| {
            Compilation::failure(vec![Diagnostic::error(format!("Compiler task failed: {}", e))])
        });

        for diagnostic in &compilation.diagnostics {
            diagnostic.log(&name);
        }

        let outcome = match compilation.entry_point {
            Some(entry_point) if !has_errors(&compilation.diagnostics) => Ok(Arc::new(
                CompiledArtifact::new(entry_point, compilation.diagnostics, &descriptor.trigger, generation),
            )),
            _ => Err(CompilationError::new(&name, compilation.diagnostics)),
        };

        self.metrics
            .compile_completed(&name, outcome.is_ok(), started.elapsed());

        let mut slot = self.slot.lock();
        if slot.generation != generation {
            debug!(function = %name, generation, "Discarding compile for replaced descriptor");
            return outcome;
        }

        slot.in_flight = None;
        match &outcome {
            Ok(artifact) => {
                info!(
                    function = %name,
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Function ready"
                );
                slot.last_diagnostics = Arc::new(artifact.diagnostics().to_vec());
                slot.serving = Some(Arc::clone(artifact));
                slot.state = InvokerState::Ready(Arc::clone(artifact));
            }
            Err(e) => {
                warn!(
                    function = %name,
                    generation,
                    errors = e.error_count(),
                    retained = slot.serving.is_some(),
                    "Function compile failed"
                );
                slot.last_diagnostics = Arc::clone(&e.diagnostics);
                slot.state = InvokerState::Faulted(Arc::clone(&e.diagnostics));
            }
        }

        outcome
    }

    async fn wait(
        mut pending: watch::Receiver<Option<CompileOutcome>>,
    ) -> Result<Arc<CompiledArtifact>, HostError> {
        let outcome = {
            let resolved = pending
                .wait_for(Option::is_some)
                .await
                .map_err(|_| HostError::Internal("compile task ended without a result".into()))?;
            resolved.clone()
        };

        match outcome {
            Some(Ok(artifact)) => Ok(artifact),
            Some(Err(e)) => Err(HostError::Compilation(e)),
            None => Err(HostError::Internal("compile outcome missing".into())),
        }
    }
}
