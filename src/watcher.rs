//! Source watching and package restore
//!
//! Each watched function gets a polling task over its source directory.
//! Source edits feed a recompile debouncer. Edits to the package manifest
//! feed a restore debouncer, and a successful restore queues a recompile.

use crate::config::WatchConfig;
use crate::debounce::Debouncer;
use crate::invoker::FunctionInvoker;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Package manifest whose change triggers a restore
pub const MANIFEST_FILE: &str = "packages.toml";

/// Restores a function's packages after its manifest changes
pub trait PackageRestorer: Send + Sync {
    fn restore<'a>(&'a self, function: &'a str, dir: &'a Path) -> BoxFuture<'a, Result<()>>;
}

/// Runs a configured shell command in the function directory
#[derive(Debug, Clone)]
pub struct CommandRestorer {
    program: String,
    args: Vec<String>,
}

impl CommandRestorer {
    pub fn parse(command: &str) -> Result<Self> {
        let mut words = shell_words::split(command)
            .with_context(|| format!("Invalid restore command: {}", command))?;
        if words.is_empty() {
            bail!("Restore command is empty");
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }
}

impl PackageRestorer for CommandRestorer {
    fn restore<'a>(&'a self, function: &'a str, dir: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(function, program = %self.program, dir = %dir.display(), "Restoring packages");

            let output = Command::new(&self.program)
                .args(&self.args)
                .current_dir(dir)
                .env("FUNCGATE_FUNCTION", function)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .with_context(|| format!("Failed to run restore command '{}'", self.program))?;

            if !output.status.success() {
                bail!(
                    "Restore command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}

/// Modification stamp of one file
type Stamp = (SystemTime, u64);

/// Collect stamps for every non-hidden file under `dir`
fn scan(dir: &Path) -> BTreeMap<PathBuf, Stamp> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if hidden {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
            } else if let Ok(modified) = metadata.modified() {
                files.insert(path, (modified, metadata.len()));
            }
        }
    }
    files
}

/// Paths added, removed or modified between two scans
fn changed_paths(before: &BTreeMap<PathBuf, Stamp>, after: &BTreeMap<PathBuf, Stamp>) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, stamp)| before.get(*path) != Some(stamp))
        .map(|(path, _)| path.clone())
        .collect();
    changed.extend(before.keys().filter(|p| !after.contains_key(*p)).cloned());
    changed
}

fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case(MANIFEST_FILE))
}

fn is_watched(path: &Path, extensions: &[&str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|w| w.eq_ignore_ascii_case(e)))
}

/// Polls one function's source directory
pub struct SourceWatcher {
    function: String,
    invoker: Weak<FunctionInvoker>,
    interval: Duration,
    recompile: Debouncer,
    restore: Option<Debouncer>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SourceWatcher {
    pub fn new(
        invoker: &Arc<FunctionInvoker>,
        config: &WatchConfig,
        restorer: Option<Arc<dyn PackageRestorer>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let function = invoker.name();

        let weak = Arc::downgrade(invoker);
        let recompile = Debouncer::new(&format!("{}:recompile", function), config.debounce(), move || {
            let weak = weak.clone();
            async move {
                let Some(invoker) = weak.upgrade() else {
                    return;
                };
                match invoker.reload().await {
                    Ok(artifact) => {
                        info!(function = %invoker.name(), generation = artifact.generation(), "Recompiled after source change")
                    }
                    Err(e) => warn!(function = %invoker.name(), error = %e, "Recompile after source change failed"),
                }
            }
        });

        let restore = restorer.map(|restorer| {
            let weak = Arc::downgrade(invoker);
            let recompile = recompile.clone();
            Debouncer::new(&format!("{}:restore", function), config.debounce(), move || {
                let weak = weak.clone();
                let restorer = Arc::clone(&restorer);
                let recompile = recompile.clone();
                async move {
                    let Some(invoker) = weak.upgrade() else {
                        return;
                    };
                    let descriptor = invoker.descriptor();
                    match restorer.restore(&descriptor.name, descriptor.source_dir()).await {
                        Ok(()) => {
                            info!(function = %descriptor.name, "Packages restored");
                            recompile.trigger();
                        }
                        Err(e) => warn!(function = %descriptor.name, error = %e, "Package restore failed"),
                    }
                }
            })
        });

        Self {
            function,
            invoker: Arc::downgrade(invoker),
            interval: config.interval(),
            recompile,
            restore,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until shutdown or until the function is dropped
    pub async fn run(mut self) {
        let Some((mut dir, _)) = self.target() else {
            return;
        };
        let mut files = Self::scan_dir(&dir).await;

        info!(function = %self.function, dir = %dir.display(), files = files.len(), "Watching function source");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some((current_dir, extensions)) = self.target() else {
                debug!(function = %self.function, "Function removed, watcher exiting");
                break;
            };

            // Descriptor replaced with a different source location
            if current_dir != dir {
                info!(function = %self.function, dir = %current_dir.display(), "Watch directory changed");
                dir = current_dir;
                files = Self::scan_dir(&dir).await;
                continue;
            }

            let latest = Self::scan_dir(&dir).await;
            let changed = changed_paths(&files, &latest);
            files = latest;
            self.handle_changes(&changed, extensions);
        }

        self.recompile.shutdown();
        if let Some(restore) = &self.restore {
            restore.shutdown();
        }
        debug!(function = %self.function, "Source watcher stopped");
    }

    fn target(&self) -> Option<(PathBuf, &'static [&'static str])> {
        let invoker = self.invoker.upgrade()?;
        let dir = invoker.descriptor().source_dir().to_path_buf();
        Some((dir, invoker.compiler().watched_extensions()))
    }

    async fn scan_dir(dir: &Path) -> BTreeMap<PathBuf, Stamp> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || scan(&dir))
            .await
            .unwrap_or_default()
    }

    fn handle_changes(&self, changed: &[PathBuf], extensions: &[&str]) {
        let mut restore = false;
        let mut recompile = false;
        for path in changed {
            if is_manifest(path) {
                restore = true;
            } else if is_watched(path, extensions) {
                recompile = true;
            }
        }

        if restore {
            match &self.restore {
                Some(debouncer) => {
                    debug!(function = %self.function, "Package manifest changed");
                    debouncer.trigger();
                }
                None => debug!(function = %self.function, "Package manifest changed, no restore command configured"),
            }
        }
        if recompile {
            debug!(function = %self.function, files = changed.len(), "Source changed");
            self.recompile.trigger();
        }
    }
}
