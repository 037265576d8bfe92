//! Proxy route table
//!
//! Routes are immutable once built. Reloads build a fresh [`RouteTable`] and
//! swap it into the [`SharedRouteTable`]; requests already in flight keep the
//! snapshot they captured on entry.

use crate::config::ProxyConfig;
use crate::overrides::{RequestOverrides, ResponseOverrides};
use crate::template::{BackendTemplate, UrlTemplate};
use hyper::Method;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// True if `method` is in `methods`, or `methods` is empty
pub fn method_allowed(methods: &[String], method: &Method) -> bool {
    methods.is_empty() || methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

/// A single proxy route
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub name: String,
    /// Allowed methods; empty means any
    pub methods: Vec<String>,
    pub route: UrlTemplate,
    pub backend: BackendTemplate,
    pub request_overrides: RequestOverrides,
    pub response_overrides: ResponseOverrides,
}

impl RouteDefinition {
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let route = UrlTemplate::parse(&config.route)
            .map_err(|e| anyhow::anyhow!("Proxy '{}': invalid route: {}", config.name, e))?;
        let backend = BackendTemplate::parse(&config.backend)
            .map_err(|e| anyhow::anyhow!("Proxy '{}': invalid backend: {}", config.name, e))?;

        Ok(Self {
            name: config.name.clone(),
            methods: config.methods.clone(),
            route,
            backend,
            request_overrides: config.request_override.clone(),
            response_overrides: config.response_override.clone(),
        })
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        method_allowed(&self.methods, method)
    }

    /// Bound parameters if both method and path match
    pub fn matches(&self, method: &Method, path: &str) -> Option<BTreeMap<String, String>> {
        if !self.allows_method(method) {
            return None;
        }
        self.route.matches(path)
    }
}

/// A matched route and its bound parameters
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteDefinition>,
    pub params: BTreeMap<String, String>,
}

/// Ordered set of proxy routes
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<RouteDefinition>>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDefinition>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(proxies: &[ProxyConfig]) -> anyhow::Result<Self> {
        let routes = proxies
            .iter()
            .map(RouteDefinition::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    /// First route in table order matching the request
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.matches(method, path).map(|params| RouteMatch {
                route: Arc::clone(route),
                params,
            })
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RouteDefinition>> {
        self.routes.iter().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn routes(&self) -> &[Arc<RouteDefinition>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route table shared between the dispatcher and the reload path
#[derive(Debug, Clone, Default)]
pub struct SharedRouteTable {
    inner: Arc<RwLock<Arc<RouteTable>>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    /// Current table; callers keep using it even if a reload happens meanwhile
    pub fn snapshot(&self) -> Arc<RouteTable> {
        Arc::clone(&self.inner.read())
    }

    /// Swap in a new table, returning the previous one
    pub fn replace(&self, table: RouteTable) -> Arc<RouteTable> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let mut get_only = ProxyConfig::new("items", "/items/{id}", "http://localhost/api/item/{id}");
        get_only.methods = vec!["get".to_string()];
        let catch_all = ProxyConfig::new("all", "/{*rest}", "http://localhost/api/{rest}");
        let shadowed = ProxyConfig::new("never", "/items/{id}", "http://localhost/api/other");
        RouteTable::from_config(&[get_only, catch_all, shadowed]).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let table = table();
        let found = table.find(&Method::GET, "/items/7").unwrap();
        assert_eq!(found.route.name, "items");
        assert_eq!(found.params["id"], "7");
    }

    #[test]
    fn test_method_filter_falls_through() {
        let table = table();
        let found = table.find(&Method::POST, "/items/7").unwrap();
        assert_eq!(found.route.name, "all");
        assert_eq!(found.params["rest"], "items/7");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::from_config(&[ProxyConfig::new(
            "items",
            "/items/{id}",
            "http://example.com/{id}",
        )])
        .unwrap();
        assert!(table.find(&Method::GET, "/other").is_none());
        assert!(table.find(&Method::GET, "/items").is_none());
    }

    #[test]
    fn test_method_allowed() {
        assert!(method_allowed(&[], &Method::DELETE));
        assert!(method_allowed(&["Get".to_string()], &Method::GET));
        assert!(!method_allowed(&["GET".to_string()], &Method::PUT));
    }

    #[test]
    fn test_invalid_route_reports_name() {
        let err = RouteTable::from_config(&[ProxyConfig::new("bad", "/{*a}/b", "http://x/")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("'bad'"));
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let shared = SharedRouteTable::new(table());
        let before = shared.snapshot();
        let old = shared.replace(RouteTable::default());

        assert_eq!(before.len(), 3);
        assert!(Arc::ptr_eq(&before, &old));
        assert!(shared.snapshot().is_empty());
        assert_eq!(shared.snapshot().get("ITEMS").map(|r| r.name.clone()), None);
        assert!(before.get("ITEMS").is_some());
    }
}
