use crate::binding::BindingMetadata;
use crate::overrides::{RequestOverrides, ResponseOverrides};
use crate::template::{BackendTemplate, UrlTemplate};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the function host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Source watching and package restore
    #[serde(default)]
    pub watch: WatchConfig,

    /// User functions
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,

    /// Proxy routes, matched in declaration order
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 7071, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Host name under which this host is reachable; backends using it are dispatched in-process
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Path prefix for function routes (default: "api")
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Max time to wait for an external backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Identifier reported in host metrics (default: random uuid)
    pub instance_id: Option<String>,

    /// Function group reported in host metrics
    #[serde(default = "default_function_group")]
    pub function_group: String,
}

impl ServerConfig {
    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Route prefix without surrounding slashes
    pub fn route_prefix(&self) -> &str {
        self.route_prefix.trim_matches('/')
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            host_name: default_host_name(),
            route_prefix: default_route_prefix(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
            instance_id: None,
            function_group: default_function_group(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Watch function sources for changes (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Polling interval in milliseconds (default: 500)
    #[serde(default = "default_watch_interval")]
    pub interval_ms: u64,

    /// Quiet window before a change is acted on, in milliseconds (default: 300)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Command run when a function's package manifest changes
    pub restore_command: Option<String>,
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_watch_interval(),
            debounce_ms: default_debounce(),
            restore_command: None,
        }
    }
}

/// Who may call a function
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    /// No key required (default)
    #[default]
    Anonymous,
    /// A function key is required
    Function,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FunctionConfig {
    pub name: String,

    /// Path to the function source file
    pub source: String,

    /// Runtime used to compile the source (default: "declarative")
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Route below the route prefix (default: the function name)
    pub route: Option<String>,

    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub auth_level: AuthLevel,

    /// Keys accepted when `auth_level = "function"`
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub bindings: Vec<BindingMetadata>,
}

impl FunctionConfig {
    pub fn new(name: &str, source: &str, runtime: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            runtime: runtime.to_string(),
            route: None,
            methods: Vec::new(),
            auth_level: AuthLevel::Anonymous,
            keys: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Set the route (builder pattern)
    pub fn with_route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    /// Set the declared bindings (builder pattern)
    pub fn with_bindings(mut self, bindings: Vec<BindingMetadata>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Require one of `keys` (builder pattern)
    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.auth_level = AuthLevel::Function;
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn route_or_name(&self) -> &str {
        self.route.as_deref().unwrap_or(&self.name).trim_matches('/')
    }

    /// Validate the function configuration
    pub fn validate(&self, runtimes: &[String]) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Function with empty 'name'".to_string());
        }
        if self.source.trim().is_empty() {
            errors.push(format!("Function '{}': 'source' must not be empty", self.name));
        }
        if !runtimes.iter().any(|r| r.eq_ignore_ascii_case(&self.runtime)) {
            errors.push(format!(
                "Function '{}': unknown runtime '{}' (known: {})",
                self.name,
                self.runtime,
                runtimes.join(", ")
            ));
        }
        if let Err(e) = UrlTemplate::parse(&format!("/{}", self.route_or_name())) {
            errors.push(format!("Function '{}': invalid route: {}", self.name, e));
        }
        if self.auth_level == AuthLevel::Function && self.keys.is_empty() {
            errors.push(format!(
                "Function '{}': auth_level 'function' requires at least one key",
                self.name
            ));
        }

        errors
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,

    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,

    /// Match template, e.g. "/myroute/{*rest}"
    pub route: String,

    /// Backend URL template, e.g. "http://localhost/api/{rest}"
    pub backend: String,

    #[serde(default)]
    pub request_override: RequestOverrides,

    #[serde(default)]
    pub response_override: ResponseOverrides,
}

impl ProxyConfig {
    pub fn new(name: &str, route: &str, backend: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: Vec::new(),
            route: route.to_string(),
            backend: backend.to_string(),
            request_override: RequestOverrides::default(),
            response_override: ResponseOverrides::default(),
        }
    }

    /// Validate the proxy configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let route = match UrlTemplate::parse(&self.route) {
            Ok(route) => Some(route),
            Err(e) => {
                errors.push(format!("Proxy '{}': invalid route: {}", self.name, e));
                None
            }
        };

        match BackendTemplate::parse(&self.backend) {
            Ok(backend) => {
                if let Some(route) = &route {
                    let bound = route.parameter_names();
                    for name in backend.path().parameter_names() {
                        if !bound.iter().any(|b| b.eq_ignore_ascii_case(name)) {
                            errors.push(format!(
                                "Proxy '{}': backend parameter '{{{}}}' is not bound by the route",
                                self.name, name
                            ));
                        }
                    }
                }
            }
            Err(e) => errors.push(format!("Proxy '{}': invalid backend: {}", self.name, e)),
        }

        if let Some(redirect) = &self.response_override.redirect {
            if !(redirect.starts_with("http://") || redirect.starts_with("https://")) {
                errors.push(format!(
                    "Proxy '{}': redirect '{}' must be an absolute URL",
                    self.name, redirect
                ));
            }
        }

        if let Some(status) = self.response_override.status {
            if !(100..=599).contains(&status) {
                errors.push(format!(
                    "Proxy '{}': status {} is not between 100 and 599",
                    self.name, status
                ));
            }
        }

        errors
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    7071
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_host_name() -> String {
    "localhost".to_string()
}

fn default_route_prefix() -> String {
    "api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_function_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_interval() -> u64 {
    500
}

fn default_debounce() -> u64 {
    300
}

fn default_runtime() -> String {
    "declarative".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate against the runtimes built into this crate
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_with_runtimes(&crate::compiler::CompilerRegistry::with_builtin().runtimes())
    }

    /// Validate all configuration
    pub fn validate_with_runtimes(&self, runtimes: &[String]) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names = HashSet::new();
        for function in &self.functions {
            if !names.insert(function.name.to_ascii_lowercase()) {
                errors.push(format!("Duplicate function name '{}'", function.name));
            }
            errors.extend(function.validate(runtimes));
        }

        let mut names = HashSet::new();
        for proxy in &self.proxies {
            if !names.insert(proxy.name.to_ascii_lowercase()) {
                errors.push(format!("Duplicate proxy name '{}'", proxy.name));
            }
            errors.extend(proxy.validate());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Direction;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
host_name = "funcs.local"

[watch]
debounce_ms = 100

[[functions]]
name = "Ping"
source = "functions/ping.json"
methods = ["GET"]
  [[functions.bindings]]
  name = "req"
  type = "httpTrigger"
  [[functions.bindings]]
  name = "$return"
  type = "http"
  direction = "out"

[[proxies]]
name = "r1"
route = "/myroute/{*rest}"
backend = "http://localhost/api/{rest}"
  [proxies.response_override]
  status = 201
  headers = { myversion = "123" }
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host_name, "funcs.local");
        assert_eq!(config.watch.debounce(), Duration::from_millis(100));
        assert_eq!(config.functions.len(), 1);

        let ping = &config.functions[0];
        assert_eq!(ping.runtime, "declarative");
        assert_eq!(ping.route_or_name(), "Ping");
        assert_eq!(ping.bindings[0].direction, Direction::In);
        assert_eq!(ping.bindings[1].direction, Direction::Out);

        let proxy = &config.proxies[0];
        assert_eq!(proxy.response_override.status, Some(201));
        assert_eq!(proxy.response_override.headers["myversion"], "123");
        assert!(proxy.request_override.is_empty());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7071);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.route_prefix(), "api");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_default_watch_config() {
        let watch = WatchConfig::default();
        assert!(watch.enabled);
        assert_eq!(watch.interval(), Duration::from_millis(500));
        assert_eq!(watch.debounce(), Duration::from_millis(300));
        assert!(watch.restore_command.is_none());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.functions.push(FunctionConfig::new("Ping", "", "cobol"));
        config.functions.push(FunctionConfig::new("ping", "p.json", "declarative"));

        let mut proxy = ProxyConfig::new("p", "/a/{*rest}/b", "http://localhost/{other}");
        proxy.response_override.status = Some(700);
        proxy.response_override.redirect = Some("/relative".to_string());
        config.proxies.push(proxy);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate function name 'ping'"));
        assert!(err.contains("'source' must not be empty"));
        assert!(err.contains("unknown runtime 'cobol'"));
        assert!(err.contains("invalid route"));
        assert!(err.contains("status 700"));
        assert!(err.contains("must be an absolute URL"));
    }

    #[test]
    fn test_unbound_backend_parameter() {
        let proxy = ProxyConfig::new("p", "/items/{id}", "http://example.com/{id}/{missing}");
        let errors = proxy.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'{missing}'"));
    }

    #[test]
    fn test_function_keys_required() {
        let mut function = FunctionConfig::new("Secure", "s.json", "declarative");
        function.auth_level = AuthLevel::Function;
        let errors = function.validate(&["declarative".to_string()]);
        assert!(errors[0].contains("requires at least one key"));

        let function = function.with_keys(&["abc"]);
        assert!(function.validate(&["declarative".to_string()]).is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/funcgate.toml").is_err());
    }
}
