//! Runtime-editable per-operation candidate routing
//!
//! Holds the ordered candidate list for every operation behind an
//! RwLock so an operator can re-prioritize at runtime through the admin
//! API. Consistency model: `candidates_for` returns a snapshot clone,
//! so updates apply to requests that start after the update — never to
//! an in-flight fallback chain.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

/// Ordered candidate lists per operation, with the config-file defaults
/// kept for the reset operation.
pub struct RoutingTable {
    defaults: HashMap<String, Vec<String>>,
    routes: RwLock<HashMap<String, Vec<String>>>,
}

impl RoutingTable {
    pub fn new(defaults: HashMap<String, Vec<String>>) -> Self {
        let routes = RwLock::new(defaults.clone());
        Self { defaults, routes }
    }

    /// Snapshot of the candidate list for one operation.
    pub async fn candidates_for(&self, operation: &str) -> Option<Vec<String>> {
        let routes = self.routes.read().await;
        routes.get(operation).cloned()
    }

    /// Replace one operation's candidate list. Takes effect for new
    /// requests only. Also used to route a newly introduced operation.
    pub async fn update(&self, operation: &str, candidates: Vec<String>) {
        let mut routes = self.routes.write().await;
        info!(operation, candidates = ?candidates, "routing updated");
        routes.insert(operation.to_string(), candidates);
    }

    /// Restore every operation to its config-file default list.
    pub async fn reset_to_defaults(&self) {
        let mut routes = self.routes.write().await;
        *routes = self.defaults.clone();
        info!("routing reset to config defaults");
    }

    /// Snapshot of the whole table (admin listing).
    pub async fn all(&self) -> HashMap<String, Vec<String>> {
        self.routes.read().await.clone()
    }
}
