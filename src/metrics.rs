//! Host metrics
//!
//! Counters are plain atomics; per-function counters live in a `DashMap` keyed
//! by metric name (`function.{name}.started`, ...).

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receiver of invocation and compile events
pub trait MetricsSink: Send + Sync {
    fn invocation_started(&self, function: &str);

    fn invocation_completed(&self, function: &str, succeeded: bool, duration: Duration);

    fn compile_completed(&self, function: &str, succeeded: bool, duration: Duration);
}

/// Point-in-time view of host metrics
#[derive(Debug, Clone, Serialize)]
pub struct HostMetricsSnapshot {
    pub instance_id: String,
    pub function_group: String,
    pub total_started_invocations: u64,
    pub metrics: BTreeMap<String, i64>,
    /// RFC 3339
    pub taken_at: String,
}

/// In-process metrics for the whole host
#[derive(Debug)]
pub struct HostMetrics {
    instance_id: String,
    function_group: String,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    compiles: AtomicU64,
    compile_failures: AtomicU64,
    invocation_micros: AtomicU64,
    per_function: DashMap<String, AtomicU64>,
}

impl HostMetrics {
    pub fn new(instance_id: impl Into<String>, function_group: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            function_group: function_group.into(),
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            invocation_micros: AtomicU64::new(0),
            per_function: DashMap::new(),
        }
    }

    fn bump(&self, key: String) {
        if let Some(counter) = self.per_function.get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.per_function
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// True once anything has been recorded
    pub fn has_metrics(&self) -> bool {
        self.started.load(Ordering::Relaxed) > 0
            || self.compiles.load(Ordering::Relaxed) > 0
            || !self.per_function.is_empty()
    }

    pub fn total_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HostMetricsSnapshot {
        let mut metrics = BTreeMap::new();
        let mut put = |name: &str, value: u64| {
            metrics.insert(name.to_string(), i64::try_from(value).unwrap_or(i64::MAX));
        };

        put("invocations.started", self.started.load(Ordering::Relaxed));
        put("invocations.succeeded", self.succeeded.load(Ordering::Relaxed));
        put("invocations.failed", self.failed.load(Ordering::Relaxed));
        put("invocations.total_micros", self.invocation_micros.load(Ordering::Relaxed));
        put("compiles.total", self.compiles.load(Ordering::Relaxed));
        put("compiles.failed", self.compile_failures.load(Ordering::Relaxed));

        for entry in self.per_function.iter() {
            put(entry.key(), entry.value().load(Ordering::Relaxed));
        }

        HostMetricsSnapshot {
            instance_id: self.instance_id.clone(),
            function_group: self.function_group.clone(),
            total_started_invocations: self.started.load(Ordering::Relaxed),
            metrics,
            taken_at: Utc::now().to_rfc3339(),
        }
    }
}

impl MetricsSink for HostMetrics {
    fn invocation_started(&self, function: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.bump(format!("function.{}.started", function));
    }

    fn invocation_completed(&self, function: &str, succeeded: bool, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.invocation_micros.fetch_add(micros, Ordering::Relaxed);
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.bump(format!("function.{}.succeeded", function));
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.bump(format!("function.{}.failed", function));
        }
    }

    fn compile_completed(&self, function: &str, succeeded: bool, _duration: Duration) {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        self.bump(format!("function.{}.compiles", function));
        if !succeeded {
            self.compile_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
