//! Function descriptors and the function registry

use crate::binding::{BindingMetadata, Direction, ResultProcessor};
use crate::compiler::CompilerRegistry;
use crate::config::{AuthLevel, FunctionConfig};
use crate::invoker::FunctionInvoker;
use crate::metrics::MetricsSink;
use crate::routes::method_allowed;
use crate::template::UrlTemplate;
use dashmap::DashMap;
use hyper::Method;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Trigger name used when no binding is a trigger
pub const DEFAULT_TRIGGER_NAME: &str = "input";

/// Bindings assumed for a function that declares none: an HTTP trigger and HTTP result
pub fn default_http_bindings() -> Vec<BindingMetadata> {
    vec![
        BindingMetadata::new("req", "httpTrigger", Direction::In),
        BindingMetadata::new("$return", "http", Direction::Out),
    ]
}

/// Immutable description of one function
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub source: PathBuf,
    pub runtime: String,
    /// Name of the trigger parameter
    pub trigger: String,
    pub inputs: Vec<BindingMetadata>,
    pub outputs: Vec<BindingMetadata>,
    /// Full route including the route prefix
    pub route: UrlTemplate,
    pub methods: Vec<String>,
    pub auth_level: AuthLevel,
    pub keys: Vec<String>,
    pub result_processor: ResultProcessor,
}

impl FunctionDescriptor {
    /// Build from config; relative sources resolve against `base_dir`
    pub fn from_config(
        config: &FunctionConfig,
        route_prefix: &str,
        base_dir: &Path,
    ) -> anyhow::Result<Self> {
        let prefix = route_prefix.trim_matches('/');
        let route_text = if prefix.is_empty() {
            format!("/{}", config.route_or_name())
        } else {
            format!("/{}/{}", prefix, config.route_or_name())
        };
        let route = UrlTemplate::parse(&route_text)
            .map_err(|e| anyhow::anyhow!("Function '{}': invalid route: {}", config.name, e))?;

        let bindings = if config.bindings.is_empty() {
            default_http_bindings()
        } else {
            config.bindings.clone()
        };
        let (inputs, outputs): (Vec<_>, Vec<_>) =
            bindings.iter().cloned().partition(|b| b.is_input());

        let trigger = bindings
            .iter()
            .find(|b| b.is_trigger())
            .map(|b| b.name.clone())
            .unwrap_or_else(|| DEFAULT_TRIGGER_NAME.to_string());

        let source = Path::new(&config.source);
        let source = if source.is_absolute() {
            source.to_path_buf()
        } else {
            base_dir.join(source)
        };

        let result_processor = ResultProcessor::from_bindings(&inputs, &outputs);

        Ok(Self {
            name: config.name.clone(),
            source,
            runtime: config.runtime.clone(),
            trigger,
            inputs,
            outputs,
            route,
            methods: config.methods.clone(),
            auth_level: config.auth_level,
            keys: config.keys.clone(),
            result_processor,
        })
    }

    /// Directory holding the source and its package manifest
    pub fn source_dir(&self) -> &Path {
        self.source.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn matches(&self, method: &Method, path: &str) -> Option<BTreeMap<String, String>> {
        if !method_allowed(&self.methods, method) {
            return None;
        }
        self.route.matches(path)
    }
}

/// Result of applying a new function configuration
#[derive(Debug, Default)]
pub struct ReloadResult {
    /// Newly added functions
    pub added: Vec<String>,
    /// Removed functions
    pub removed: Vec<String>,
    /// Functions whose configuration changed; they recompile on next use
    pub updated: Vec<String>,
}

/// All functions of the host, each with its own invoker
pub struct FunctionRegistry {
    invokers: DashMap<String, Arc<FunctionInvoker>>,
    configs: RwLock<HashMap<String, FunctionConfig>>,
    /// Declaration order, used for route matching
    order: RwLock<Vec<String>>,
    compilers: CompilerRegistry,
    metrics: Arc<dyn MetricsSink>,
    route_prefix: String,
    base_dir: PathBuf,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl FunctionRegistry {
    pub fn new(
        compilers: CompilerRegistry,
        metrics: Arc<dyn MetricsSink>,
        route_prefix: &str,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            invokers: DashMap::new(),
            configs: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            compilers,
            metrics,
            route_prefix: route_prefix.trim_matches('/').to_string(),
            base_dir: base_dir.into(),
        }
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    fn build_invoker(&self, config: &FunctionConfig) -> anyhow::Result<Arc<FunctionInvoker>> {
        let descriptor = FunctionDescriptor::from_config(config, &self.route_prefix, &self.base_dir)?;
        let compiler = self.compilers.get(&config.runtime).ok_or_else(|| {
            anyhow::anyhow!("Function '{}': unknown runtime '{}'", config.name, config.runtime)
        })?;
        Ok(Arc::new(FunctionInvoker::new(
            Arc::new(descriptor),
            compiler,
            Arc::clone(&self.metrics),
        )))
    }

    /// Apply a new set of functions.
    ///
    /// Unchanged functions keep their invoker and artifact. Changed ones get a
    /// new descriptor and return to `Unloaded`.
    pub fn apply_config(&self, functions: &[FunctionConfig]) -> anyhow::Result<ReloadResult> {
        let mut result = ReloadResult::default();

        // Build everything first so a bad entry leaves the registry untouched
        let mut prepared = Vec::with_capacity(functions.len());
        for config in functions {
            let descriptor =
                FunctionDescriptor::from_config(config, &self.route_prefix, &self.base_dir)?;
            let compiler = self.compilers.get(&config.runtime).ok_or_else(|| {
                anyhow::anyhow!("Function '{}': unknown runtime '{}'", config.name, config.runtime)
            })?;
            prepared.push((config, descriptor, compiler));
        }

        let new_keys: std::collections::HashSet<String> =
            functions.iter().map(|f| key(&f.name)).collect();

        let current: Vec<String> = self.configs.read().keys().cloned().collect();
        for name in current.iter().filter(|k| !new_keys.contains(*k)) {
            if let Some((_, invoker)) = self.invokers.remove(name) {
                info!(function = %invoker.name(), "Removing function");
                result.removed.push(invoker.name());
            }
            self.configs.write().remove(name);
        }

        for (config, descriptor, compiler) in prepared {
            let k = key(&config.name);
            let existing = self.configs.read().get(&k).cloned();
            match existing {
                None => {
                    info!(function = %config.name, runtime = %config.runtime, "Adding function");
                    self.invokers.insert(
                        k.clone(),
                        Arc::new(FunctionInvoker::new(
                            Arc::new(descriptor),
                            compiler,
                            Arc::clone(&self.metrics),
                        )),
                    );
                    result.added.push(config.name.clone());
                }
                Some(old) if old != *config => {
                    info!(function = %config.name, "Function configuration changed");
                    match self.invokers.get(&k) {
                        Some(invoker) => invoker.replace_descriptor(Arc::new(descriptor), compiler),
                        None => warn!(function = %config.name, "Configured function has no invoker"),
                    }
                    result.updated.push(config.name.clone());
                }
                Some(_) => {}
            }
            self.configs.write().insert(k, config.clone());
        }

        *self.order.write() = functions.iter().map(|f| key(&f.name)).collect();

        Ok(result)
    }

    /// Register a single function, replacing any function with the same name
    pub fn insert(&self, config: FunctionConfig) -> anyhow::Result<Arc<FunctionInvoker>> {
        let invoker = self.build_invoker(&config)?;
        let k = key(&config.name);
        self.invokers.insert(k.clone(), Arc::clone(&invoker));
        self.configs.write().insert(k.clone(), config);
        let mut order = self.order.write();
        if !order.contains(&k) {
            order.push(k);
        }
        Ok(invoker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionInvoker>> {
        self.invokers.get(&key(name)).map(|e| Arc::clone(e.value()))
    }

    /// Invokers in declaration order
    pub fn list(&self) -> Vec<Arc<FunctionInvoker>> {
        self.order
            .read()
            .iter()
            .filter_map(|k| self.invokers.get(k).map(|e| Arc::clone(e.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// First function, in declaration order, whose route matches
    pub fn find_route(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<FunctionInvoker>, BTreeMap<String, String>)> {
        self.list().into_iter().find_map(|invoker| {
            invoker
                .descriptor()
                .matches(method, path)
                .map(|params| (invoker, params))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HostMetrics;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new(
            CompilerRegistry::with_builtin(),
            Arc::new(HostMetrics::new("i", "g")),
            "/api/",
            "/srv/functions",
        )
    }

    #[test]
    fn test_descriptor_from_config() {
        let config = FunctionConfig::new("Ping", "ping/ping.json", "declarative").with_bindings(vec![
            BindingMetadata::new("req", "httpTrigger", Direction::In),
            BindingMetadata::new("$return", "http", Direction::Out),
        ]);
        let descriptor =
            FunctionDescriptor::from_config(&config, "api", Path::new("/srv/functions")).unwrap();

        assert_eq!(descriptor.trigger, "req");
        assert_eq!(descriptor.inputs.len(), 1);
        assert_eq!(descriptor.outputs.len(), 1);
        assert_eq!(descriptor.result_processor.len(), 1);
        assert_eq!(descriptor.source, PathBuf::from("/srv/functions/ping/ping.json"));
        assert_eq!(descriptor.source_dir(), Path::new("/srv/functions/ping"));
        assert_eq!(descriptor.route.raw(), "/api/Ping");
        assert!(descriptor.matches(&Method::GET, "/api/ping").is_some());
    }

    #[test]
    fn test_trigger_name_defaults_to_input() {
        let config = FunctionConfig::new("Timer", "t.json", "declarative")
            .with_bindings(vec![BindingMetadata::new("$return", "http", Direction::Out)]);
        let descriptor = FunctionDescriptor::from_config(&config, "api", Path::new(".")).unwrap();
        assert_eq!(descriptor.trigger, DEFAULT_TRIGGER_NAME);
    }

    #[test]
    fn test_http_bindings_assumed_when_none_declared() {
        let config = FunctionConfig::new("Hello", "h.json", "declarative");
        let descriptor = FunctionDescriptor::from_config(&config, "api", Path::new(".")).unwrap();
        assert_eq!(descriptor.trigger, "req");
        assert_eq!(descriptor.result_processor.len(), 1);
    }

    #[test]
    fn test_route_parameters_and_methods() {
        let mut config =
            FunctionConfig::new("GetItem", "i.json", "declarative").with_route("items/{id}");
        config.methods = vec!["GET".to_string()];
        let descriptor = FunctionDescriptor::from_config(&config, "", Path::new(".")).unwrap();

        let params = descriptor.matches(&Method::GET, "/items/9").unwrap();
        assert_eq!(params["id"], "9");
        assert!(descriptor.matches(&Method::POST, "/items/9").is_none());
    }

    #[test]
    fn test_apply_config_reports_changes() {
        let registry = registry();
        let first = registry
            .apply_config(&[
                FunctionConfig::new("Ping", "ping.json", "declarative"),
                FunctionConfig::new("Echo", "echo.json", "declarative"),
            ])
            .unwrap();
        assert_eq!(first.added, vec!["Ping", "Echo"]);
        assert_eq!(registry.len(), 2);

        let ping = registry.get("ping").unwrap();

        let second = registry
            .apply_config(&[
                FunctionConfig::new("Ping", "ping.json", "declarative"),
                FunctionConfig::new("Echo", "echo.txt", "static"),
                FunctionConfig::new("New", "new.json", "declarative"),
            ])
            .unwrap();
        assert_eq!(second.added, vec!["New"]);
        assert_eq!(second.updated, vec!["Echo"]);
        assert!(second.removed.is_empty());
        assert!(Arc::ptr_eq(&ping, &registry.get("Ping").unwrap()));
        assert_eq!(registry.get("Echo").unwrap().descriptor().runtime, "static");

        let third = registry
            .apply_config(&[FunctionConfig::new("New", "new.json", "declarative")])
            .unwrap();
        assert_eq!(third.removed.len(), 2);
        assert!(registry.get("Ping").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_apply_config_rejects_unknown_runtime() {
        let registry = registry();
        registry
            .apply_config(&[FunctionConfig::new("Ping", "ping.json", "declarative")])
            .unwrap();
        assert!(registry
            .apply_config(&[FunctionConfig::new("Ping", "ping.cs", "csharp")])
            .is_err());
        assert_eq!(registry.get("Ping").unwrap().descriptor().runtime, "declarative");
    }

    #[test]
    fn test_find_route_in_declaration_order() {
        let registry = registry();
        registry
            .apply_config(&[
                FunctionConfig::new("Specific", "a.json", "declarative").with_route("items/special"),
                FunctionConfig::new("Generic", "b.json", "declarative").with_route("items/{id}"),
            ])
            .unwrap();

        let (invoker, _) = registry.find_route(&Method::GET, "/api/items/special").unwrap();
        assert_eq!(invoker.name(), "Specific");
        let (invoker, params) = registry.find_route(&Method::GET, "/api/items/3").unwrap();
        assert_eq!(invoker.name(), "Generic");
        assert_eq!(params["id"], "3");
        assert!(registry.find_route(&Method::GET, "/other").is_none());
    }
}
