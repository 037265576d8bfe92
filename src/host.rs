//! Wiring of the registry, route table, dispatcher and watchers for one config

use crate::admin::AdminState;
use crate::auth::ConfiguredKeys;
use crate::compiler::CompilerRegistry;
use crate::config::{Config, WatchConfig};
use crate::dispatch::Dispatcher;
use crate::function::{FunctionRegistry, ReloadResult};
use crate::invoker::FunctionInvoker;
use crate::metrics::HostMetrics;
use crate::pool::{BackendClient, PoolConfig};
use crate::routes::{RouteTable, SharedRouteTable};
use crate::watcher::{CommandRestorer, PackageRestorer, SourceWatcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Host {
    base_dir: PathBuf,
    host_name: String,
    watch: WatchConfig,
    restorer: Option<Arc<dyn PackageRestorer>>,
    metrics: Arc<HostMetrics>,
    dispatcher: Arc<Dispatcher>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Host {
    /// Build a host from `config`. Function sources resolve against `base_dir`.
    pub fn build(config: &Config, base_dir: &Path, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let instance_id = config
            .server
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let metrics = Arc::new(HostMetrics::new(instance_id, config.server.function_group.clone()));

        let functions = Arc::new(FunctionRegistry::new(
            CompilerRegistry::with_builtin(),
            metrics.clone(),
            config.server.route_prefix(),
            base_dir,
        ));
        functions.apply_config(&config.functions)?;

        let routes = SharedRouteTable::new(RouteTable::from_config(&config.proxies)?);

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            request_timeout: config.server.request_timeout(),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            routes,
            functions,
            BackendClient::new(pool_config),
            Arc::new(ConfiguredKeys),
            &config.server.host_name,
        ));

        let restorer = match &config.watch.restore_command {
            Some(command) => Some(Arc::new(CommandRestorer::parse(command)?) as Arc<dyn PackageRestorer>),
            None => None,
        };

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            host_name: config.server.host_name.clone(),
            watch: config.watch.clone(),
            restorer,
            metrics,
            dispatcher,
            watchers: Mutex::new(Vec::new()),
            shutdown_rx,
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn metrics(&self) -> Arc<HostMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn admin_state(&self, auth_token: String) -> AdminState {
        AdminState {
            dispatcher: self.dispatcher(),
            metrics: self.metrics(),
            host_name: self.host_name.clone(),
            auth_token,
        }
    }

    /// Start a source watcher for one function, if watching is enabled.
    /// Returns whether a watcher was started.
    pub fn watch_function(&self, invoker: &Arc<FunctionInvoker>) -> bool {
        if !self.watch.enabled {
            return false;
        }
        let watcher = SourceWatcher::new(invoker, &self.watch, self.restorer.clone(), self.shutdown_rx.clone());
        let handle = watcher.spawn();

        let mut watchers = self.watchers.lock();
        // Watchers of removed functions exit on their own
        watchers.retain(|h| !h.is_finished());
        watchers.push(handle);
        true
    }

    /// Start watchers for every registered function. Returns how many started.
    pub fn watch_all(&self) -> usize {
        self.dispatcher
            .functions()
            .list()
            .iter()
            .filter(|invoker| self.watch_function(invoker))
            .count()
    }

    /// Number of watcher tasks still running
    pub fn active_watchers(&self) -> usize {
        self.watchers.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Take every watcher handle, for joining or aborting on shutdown
    pub fn take_watchers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.watchers.lock())
    }

    /// Apply a reloaded configuration.
    ///
    /// The route table is swapped and functions are added, removed or updated.
    /// Server settings take effect only on restart.
    pub fn reload(&self, config: &Config) -> anyhow::Result<ReloadResult> {
        let routes = RouteTable::from_config(&config.proxies)?;
        let result = self.dispatcher.functions().apply_config(&config.functions)?;
        let old = self.dispatcher.routes().replace(routes);

        info!(
            proxies_before = old.len(),
            proxies = self.dispatcher.routes().snapshot().len(),
            "Route table replaced"
        );

        for name in &result.added {
            match self.dispatcher.functions().get(name) {
                Some(invoker) => {
                    if self.watch_function(&invoker) {
                        debug!(function = %name, "Source watcher started");
                    }
                }
                None => warn!(function = %name, "Added function missing from registry"),
            }
        }

        Ok(result)
    }
}
