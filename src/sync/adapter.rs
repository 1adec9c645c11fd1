//! Discovery adapter contract and the explicit adapter registry.
//!
//! Adapters only produce candidate nodes and edges in canonical shape;
//! hashing, diffing and persistence belong to the sync engine.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{GraphEdge, GraphNode, Provider, ResourceType};

use super::error::DiscoveryError;

/// Parameters for one `discover` call (one page of one scope).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    /// Restrict discovery to one resource type (`None` = everything).
    pub resource_type: Option<ResourceType>,
    /// Cursor returned by the previous page.
    pub cursor: Option<String>,
    /// Maximum records per page the adapter should return.
    pub page_limit: usize,
}

/// One page of candidate entities.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryBatch {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Per-record failures within the page.
    pub errors: Vec<DiscoveryError>,
    /// Cursor for the next page; `None` ends pagination.
    pub next_cursor: Option<String>,
}

impl DiscoveryBatch {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            nodes,
            edges,
            errors: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn with_next(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    pub fn with_error(mut self, error: DiscoveryError) -> Self {
        self.errors.push(error);
        self
    }
}

/// A source of candidate infrastructure entities (one cloud account, one
/// cluster, ...).
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync {
    /// Stable identifier, used in sync records.
    fn id(&self) -> &str;

    fn provider(&self) -> Provider;

    /// Account (or cluster) the adapter discovers; scopes the disappearance sweep.
    fn account(&self) -> &str;

    async fn discover(&self, options: &DiscoveryOptions) -> Result<DiscoveryBatch, DiscoveryError>;
}

/// Adapters registered at startup and looked up by id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn DiscoveryAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id.
    pub fn register(&self, adapter: Arc<dyn DiscoveryAdapter>) {
        tracing::debug!(adapter = adapter.id(), provider = %adapter.provider(), "adapter registered");
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DiscoveryAdapter>> {
        self.adapters.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.adapters.remove(id).is_some()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("adapters", &self.ids()).finish()
    }
}
