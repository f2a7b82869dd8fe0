//! Action-based routing of outgoing payloads.
//!
//! A payload declares what it wants done either directly
//! (`{"action": "reflect"}`) or through a task list
//! (`{"task": [{"action": "list_directory"}]}`). The router maps that action
//! to a path under the configured base URL. Anything it does not recognise
//! goes to the root endpoint.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::ValidationError;

/// Path used when no route matches.
pub const ROOT_PATH: &str = "/";

/// Routes every router starts with.
pub const DEFAULT_ROUTES: [(&str, &str); 3] = [
    ("reflect", "/reflect"),
    ("list_directory", "/directory/search"),
    ("web_search", "/web/search"),
];

/// Action name to endpoint path mapping.
///
/// Snapshots are cheap clones of an immutable map; writers build a new map
/// and swap it in, so readers never see a half-applied change.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<Arc<BTreeMap<String, String>>>,
}

impl RoutingTable {
    /// Create an empty table (only the implicit root route).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table pre-populated with [`DEFAULT_ROUTES`].
    pub fn with_defaults() -> Self {
        let routes = DEFAULT_ROUTES
            .iter()
            .map(|(action, path)| (action.to_string(), path.to_string()))
            .collect();
        Self {
            routes: RwLock::new(Arc::new(routes)),
        }
    }

    /// Add or replace the route for `action`.
    pub fn insert(&self, action: &str, path: &str) -> Result<(), ValidationError> {
        let action = action.trim();
        if action.is_empty() {
            return Err(ValidationError::EmptyAction);
        }
        let path = normalize_path(path).ok_or_else(|| ValidationError::EmptyPath {
            action: action.to_string(),
        })?;

        self.update(|routes| {
            routes.insert(action.to_string(), path);
        });
        Ok(())
    }

    /// Remove the route for `action`. Returns the removed path, if any.
    pub fn remove(&self, action: &str) -> Option<String> {
        let mut removed = None;
        self.update(|routes| removed = routes.remove(action));
        removed
    }

    /// Path registered for `action`.
    pub fn lookup(&self, action: &str) -> Option<String> {
        self.snapshot().get(action).cloned()
    }

    /// Immutable view of the current routes.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, String>> {
        match self.routes.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) {
        let mut guard = match self.routes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

/// Resolves payloads to endpoint URLs.
pub struct ActionRouter {
    base_url: String,
    table: RoutingTable,
}

impl ActionRouter {
    /// Create a router over `base_url` with the default routes.
    pub fn new(base_url: &str) -> Result<Self, ValidationError> {
        Self::with_table(base_url, RoutingTable::with_defaults())
    }

    /// Create a router over `base_url` with an explicit table.
    pub fn with_table(base_url: &str, table: RoutingTable) -> Result<Self, ValidationError> {
        let parsed = url::Url::parse(base_url).map_err(|e| ValidationError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ValidationError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "URL cannot be used as a base".to_string(),
            });
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table,
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint for the root route.
    pub fn root(&self) -> String {
        format!("{}{}", self.base_url, ROOT_PATH)
    }

    /// Resolve the endpoint for `payload`. Never fails: anything unrouted
    /// degrades to [`ActionRouter::root`].
    pub fn resolve(&self, payload: &Value) -> String {
        match declared_action(payload).and_then(|action| self.table.lookup(action)) {
            Some(path) => format!("{}{}", self.base_url, path),
            None => self.root(),
        }
    }

    /// Add or replace a route at runtime.
    pub fn add_action_route(&self, action: &str, path: &str) -> Result<(), ValidationError> {
        self.table.insert(action, path)?;
        tracing::info!(action, path, "Action route added");
        Ok(())
    }

    /// Remove a route at runtime. Returns whether a route existed.
    pub fn remove_action_route(&self, action: &str) -> bool {
        let removed = self.table.remove(action).is_some();
        if removed {
            tracing::info!(action, "Action route removed");
        }
        removed
    }

    /// Snapshot of the configured routes.
    pub fn action_routes(&self) -> Arc<BTreeMap<String, String>> {
        self.table.snapshot()
    }
}

/// The action a payload declares.
///
/// A list-valued `task` field takes priority; only its first entry is
/// consulted, even when later entries name different actions.
pub fn declared_action(payload: &Value) -> Option<&str> {
    if let Some(tasks) = payload.get("task").and_then(Value::as_array) {
        return tasks
            .first()
            .and_then(|task| task.get("action"))
            .and_then(Value::as_str);
    }
    payload.get("action").and_then(Value::as_str)
}

fn normalize_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("/{}", trimmed))
}
