//! Project name resolution
//!
//! Usage results only carry project ids; dashboards want names. Names are
//! fetched once per id, cached for the life of the process and never
//! refreshed. A failed lookup returns [`UNKNOWN`] without caching, so the next
//! call for the same id tries again.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::UNKNOWN;

/// Source of project display names.
#[async_trait]
pub trait ProjectLookup: Send + Sync {
    async fn project_name(&self, project_id: &str) -> anyhow::Result<String>;
}

/// Write-through cache in front of a [`ProjectLookup`].
pub struct NameResolver {
    lookup: Arc<dyn ProjectLookup>,
    names: DashMap<String, String>,
    // One lock per id ever looked up, never removed, so fetches for the same
    // id are strictly serialized.
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl NameResolver {
    pub fn new(lookup: Arc<dyn ProjectLookup>) -> Self {
        Self {
            lookup,
            names: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    pub async fn resolve(&self, project_id: &str) -> String {
        if project_id.is_empty() || project_id == UNKNOWN {
            return UNKNOWN.to_string();
        }

        if let Some(name) = self.cached(project_id) {
            return name;
        }

        let gate = self
            .gates
            .entry(project_id.to_string())
            .or_default()
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have filled the cache while we waited.
        if let Some(name) = self.cached(project_id) {
            return name;
        }

        match self.lookup.project_name(project_id).await {
            Ok(name) => {
                debug!(project_id, project_name = %name, "Resolved project name");
                self.names.insert(project_id.to_string(), name.clone());
                name
            }
            Err(e) => {
                warn!(project_id, error = %e, "Failed to resolve project name");
                UNKNOWN.to_string()
            }
        }
    }

    pub fn cached(&self, project_id: &str) -> Option<String> {
        self.names.get(project_id).map(|n| n.value().clone())
    }
}
