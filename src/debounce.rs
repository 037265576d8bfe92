//! Trailing-edge debouncer
//!
//! A burst of `trigger()` calls collapses into one run of the action once the
//! quiet window passes with no further trigger. The action runs on the
//! debouncer's own task, so runs never overlap. Triggers that arrive during a
//! run schedule exactly one follow-up run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

enum Signal {
    Trigger,
    Shutdown,
}

/// Handle to a debounced action. Clones share the same action; the task
/// exits when every handle is dropped.
#[derive(Clone)]
pub struct Debouncer {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Signal>,
}

impl Debouncer {
    pub fn new<F, Fut>(name: &str, quiet_window: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task_name = Arc::clone(&name);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Some(Signal::Trigger) => {}
                    Some(Signal::Shutdown) | None => break,
                }

                // Wait out the quiet window, restarting it on every trigger
                let mut closed = false;
                loop {
                    match tokio::time::timeout(quiet_window, rx.recv()).await {
                        Ok(Some(Signal::Trigger)) => continue,
                        Ok(Some(Signal::Shutdown)) => {
                            debug!(debouncer = %task_name, "Debouncer shut down with pending run dropped");
                            return;
                        }
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                debug!(debouncer = %task_name, "Quiet window elapsed, running action");
                action().await;

                if closed {
                    break;
                }
            }
            debug!(debouncer = %task_name, "Debouncer stopped");
        });

        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule a run after the quiet window, restarting the window
    pub fn trigger(&self) {
        let _ = self.tx.send(Signal::Trigger);
    }

    /// Stop the task; a pending run is dropped
    pub fn shutdown(&self) {
        let _ = self.tx.send(Signal::Shutdown);
    }
}
