//! Service registry: maps (method, path pattern) to deterministic handlers.
//!
//! The registry is populated once at startup, in a fixed order, and is
//! read-mostly afterwards: lookups happen concurrently from the web server
//! and from proposal replay. Handlers are synchronous and pure over
//! (request, store state); anything they fail at is encoded into the
//! returned [`Response`], never thrown past the envelope boundary.

mod bridge;
mod handlers;

pub use bridge::{BridgeError, CommitPayload, L1Bridge, L1Receipt, BRIDGE_TIMEOUT};
pub use handlers::{register_l1_services, register_l2_services};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_types::{Request, Response};
use thiserror::Error;
use tracing::warn;

/// A registered service handler.
pub type HandlerFn = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Errors from route registration. Lookups are infallible.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate exact route: {method} {path}")]
    DuplicateRoute { method: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: String,
    path: String,
}

impl RouteKey {
    fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        }
    }
}

/// Registry of service handlers for one node.
pub struct ServiceRegistry {
    exact: RwLock<HashMap<RouteKey, HandlerFn>>,
    /// Pattern routes in registration order; first registered wins on
    /// ambiguity so every node resolves the same handler.
    patterns: RwLock<Vec<(RouteKey, HandlerFn)>>,
    byzantine: bool,
}

impl ServiceRegistry {
    pub fn new(byzantine: bool) -> Self {
        Self {
            exact: RwLock::new(HashMap::new()),
            patterns: RwLock::new(Vec::new()),
            byzantine,
        }
    }

    /// Whether this node's responses are intentionally corrupted.
    pub fn is_byzantine(&self) -> bool {
        self.byzantine
    }

    /// Register a handler. Exact routes must be unique per (method, path).
    pub fn register(
        &self,
        method: &str,
        path: &str,
        exact: bool,
        handler: HandlerFn,
    ) -> Result<(), RegistryError> {
        let key = RouteKey::new(method, path);
        if exact {
            let mut routes = self.exact.write();
            if routes.contains_key(&key) {
                return Err(RegistryError::DuplicateRoute {
                    method: key.method,
                    path: key.path,
                });
            }
            routes.insert(key, handler);
        } else {
            self.patterns.write().push((key, handler));
        }
        Ok(())
    }

    /// Find the handler for a concrete request path. Exact beats pattern;
    /// among patterns the first registered match wins.
    pub fn lookup(&self, method: &str, path: &str) -> Option<HandlerFn> {
        let key = RouteKey::new(method, path);
        if let Some(handler) = self.exact.read().get(&key) {
            return Some(handler.clone());
        }

        let method = key.method;
        self.patterns
            .read()
            .iter()
            .find(|(route, _)| route.method == method && pattern_matches(&route.path, path))
            .map(|(_, handler)| handler.clone())
    }

    /// Execute the request against the registered handler, applying the
    /// Byzantine rewrite at the same pipeline point as a normal response so
    /// the divergence is visible at proposal replay.
    ///
    /// Returns `None` when no handler is registered for the route.
    pub fn execute(&self, request: &Request) -> Option<Response> {
        let handler = self.lookup(&request.method, &request.path)?;
        let mut response = handler(request);

        if self.byzantine && matches!(response.status_code, 200 | 201 | 202) {
            warn!(
                path = %request.path,
                "byzantine mode: corrupting successful response"
            );
            response.status_code = 500;
            response.body =
                r#"{"message":"byzantine node response - data corrupted"}"#.to_string();
        }

        Some(response)
    }
}

/// Segment-wise pattern match: `:name` segments match any single segment.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut path_parts = path.split('/');

    loop {
        match (pattern_parts.next(), path_parts.next()) {
            (None, None) => return true,
            (Some(pattern_part), Some(path_part)) => {
                if pattern_part.starts_with(':') {
                    continue;
                }
                if pattern_part != path_part {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
