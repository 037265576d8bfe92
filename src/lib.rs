//! Funcgate - a single-host function gateway
//!
//! This library provides a function host that:
//! - Compiles user functions lazily and recompiles them when their source changes
//! - Keeps serving the last good build while a recompile is failing
//! - Routes requests through proxy routes with request and response overrides
//! - Dispatches proxies that point back at this host in-process, with loop detection
//! - Forwards external backends through a pooled HTTP client

pub mod admin;
pub mod auth;
pub mod binding;
pub mod compiler;
pub mod config;
pub mod context;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod function;
pub mod host;
pub mod invoker;
pub mod metrics;
pub mod overrides;
pub mod pool;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod template;
pub mod watcher;
