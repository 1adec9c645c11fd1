//! Backend-agnostic storage contract for the infrastructure graph.
//!
//! Three backends implement [`GraphStorage`] with identical semantics:
//!
//! - [`MemStore`]: concurrent hashmaps (DashMap), for tests and single processes
//! - [`DurableStore`]: embedded ACID store (redb), one table per entity kind
//! - [`SqlStore`]: networked SQL (MySQL, or SQLite for local use) through sqlx
//!
//! Picking one is a deployment decision; callers only see the trait. The
//! shared contract suite in `tests/storage_contract.rs` runs against all three.

pub mod durable;
pub mod mem;
pub mod sql;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{
    EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeStatus, NodeVersion, Provider,
    RelationshipType, ResourceType, Snapshot, SnapshotId, SnapshotSummary, SyncRecord, TenantId,
    Timestamp, UpsertOutcome,
};

pub use durable::DurableStore;
pub use mem::MemStore;
pub use sql::SqlStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Predicate filter for node queries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    pub tenant_id: Option<TenantId>,
    pub provider: Option<Provider>,
    /// Match any of these resource types (empty = all).
    pub resource_types: BTreeSet<ResourceType>,
    pub region: Option<String>,
    pub account: Option<String>,
    pub status: Option<NodeStatus>,
    /// Exclude tombstoned nodes.
    pub exclude_disappeared: bool,
    /// Tag equality constraints; all must hold.
    pub tags: BTreeMap<String, String>,
    /// Case-insensitive substring match on the node name.
    pub name_contains: Option<String>,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }

    pub fn provider(mut self, provider: impl AsRef<str>) -> Self {
        self.provider = Some(Provider::new(provider));
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_types.insert(resource_type);
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn active_only(mut self) -> Self {
        self.exclude_disappeared = true;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Evaluate the filter against a node. Every backend applies exactly this
    /// predicate (SQL pushes the indexed parts down first).
    pub fn matches(&self, node: &GraphNode) -> bool {
        if self.tenant_id.as_ref().is_some_and(|t| t != &node.tenant_id) {
            return false;
        }
        if self.provider.as_ref().is_some_and(|p| p != &node.provider) {
            return false;
        }
        if !self.resource_types.is_empty() && !self.resource_types.contains(&node.resource_type) {
            return false;
        }
        if self.region.as_ref().is_some_and(|r| r != &node.region) {
            return false;
        }
        if self.account.as_ref().is_some_and(|a| a != &node.account) {
            return false;
        }
        if self.status.is_some_and(|s| s != node.status) {
            return false;
        }
        if self.exclude_disappeared && node.is_disappeared() {
            return false;
        }
        if !self
            .tags
            .iter()
            .all(|(k, v)| node.tags.get(k).is_some_and(|actual| actual == v))
        {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            if !node.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Predicate filter for edge queries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeFilter {
    pub tenant_id: Option<TenantId>,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    /// Match edges where this node is either endpoint.
    pub touching: Option<NodeId>,
    /// Match any of these relationship types (empty = all).
    pub relationship_types: BTreeSet<RelationshipType>,
    pub min_confidence: Option<f64>,
}

impl EdgeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }

    pub fn source(mut self, source: NodeId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn touching(mut self, node: NodeId) -> Self {
        self.touching = Some(node);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipType) -> Self {
        self.relationship_types.insert(relationship);
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn matches(&self, edge: &GraphEdge) -> bool {
        if self.tenant_id.as_ref().is_some_and(|t| t != &edge.tenant_id) {
            return false;
        }
        if self.source.as_ref().is_some_and(|s| s != &edge.source_node_id) {
            return false;
        }
        if self.target.as_ref().is_some_and(|t| t != &edge.target_node_id) {
            return false;
        }
        if self.touching.as_ref().is_some_and(|n| !edge.touches(n)) {
            return false;
        }
        if !self.relationship_types.is_empty()
            && !self.relationship_types.contains(&edge.relationship_type)
        {
            return false;
        }
        if self.min_confidence.is_some_and(|c| edge.confidence < c) {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Offset+limit or cursor pagination. Results are always ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    /// Only return entities whose id sorts strictly after this cursor.
    pub after: Option<String>,
    /// Skip this many matching entities (applied after `after`).
    pub offset: usize,
    /// Maximum number of entities to return (`None` = unbounded).
    pub limit: Option<usize>,
}

impl Pagination {
    /// Everything, in id order.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn offset(offset: usize, limit: usize) -> Self {
        Self {
            after: None,
            offset,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            after: Some(cursor.into()),
            offset: 0,
            limit: Some(limit),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches before pagination was applied.
    pub total: usize,
    /// Cursor for the next page, when more results remain.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            next_cursor: None,
        }
    }
}

/// Apply pagination to matches already sorted by id.
///
/// Shared by every backend so cursors and totals agree across them.
pub fn paginate<T>(sorted: Vec<T>, page: &Pagination, id_of: impl Fn(&T) -> &str) -> Page<T> {
    let total = sorted.len();
    let after_cursor: Vec<T> = match &page.after {
        Some(cursor) => sorted
            .into_iter()
            .filter(|item| id_of(item) > cursor.as_str())
            .collect(),
        None => sorted,
    };
    let remaining = after_cursor.len().saturating_sub(page.offset);
    let take = page.limit.unwrap_or(remaining).min(remaining);
    let items: Vec<T> = after_cursor.into_iter().skip(page.offset).take(take).collect();
    let next_cursor = if take < remaining {
        items.last().map(|item| id_of(item).to_string())
    } else {
        None
    };
    Page {
        items,
        total,
        next_cursor,
    }
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Storage contract every backend satisfies identically.
///
/// Upserts are atomic per id and merge by id (see [`GraphNode::absorb`] and
/// [`GraphEdge::absorb`]). Deletes are hard deletes and distinct from the
/// `Disappeared` soft state. Query results are ordered by id.
#[async_trait]
pub trait GraphStorage: Send + Sync {
    /// Prepare tables/indexes. Idempotent.
    async fn initialize(&self) -> StoreResult<()>;

    /// Flush and release resources.
    async fn close(&self) -> StoreResult<()>;

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome>;

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        for node in nodes {
            outcomes.push(self.upsert_node(node).await?);
        }
        Ok(outcomes)
    }

    /// Fails with [`StoreError::DanglingEdge`] unless both endpoints exist.
    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome>;

    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        let mut outcomes = Vec::with_capacity(edges.len());
        for edge in edges {
            outcomes.push(self.upsert_edge(edge).await?);
        }
        Ok(outcomes)
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>>;

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>>;

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>>;

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>>;

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>>;

    /// Hard-delete a node and every edge touching it. Returns whether it existed.
    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool>;

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool>;

    // -- temporal entities ---------------------------------------------------

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()>;

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()>;

    /// Version chain of one node, oldest first.
    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>>;

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>>;

    /// All node versions recorded at or before `t`, ordered by (node id, version).
    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>>;

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>>;

    /// Remove versions recorded strictly before `t`. Returns how many were removed.
    async fn prune_versions_before(&self, t: Timestamp) -> StoreResult<usize>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>>;

    /// All stored snapshots, oldest first.
    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>>;

    async fn delete_snapshot(&self, id: SnapshotId) -> StoreResult<bool>;

    /// Every node and edge, read as one consistent view.
    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)>;

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()>;

    /// Sync records, oldest first, optionally restricted to one adapter.
    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>>;

    // -- metadata key-value area ----------------------------------------------

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// `(key, value)` pairs whose key starts with `prefix`, in key order.
    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Atomically increment the big-endian `u64` counter under `key` and
    /// return the new value. Concurrent callers never get the same value.
    async fn next_sequence(&self, key: &str) -> StoreResult<u64>;
}

/// Merge `incoming` into the stored node (if any), reporting what changed.
pub(crate) fn merge_node(existing: Option<GraphNode>, incoming: GraphNode) -> (GraphNode, UpsertOutcome) {
    match existing {
        None => (incoming, UpsertOutcome::Created),
        Some(mut stored) => {
            let before = stored.clone();
            stored.absorb(incoming);
            let outcome = if stored == before {
                UpsertOutcome::Unchanged
            } else {
                UpsertOutcome::Updated
            };
            (stored, outcome)
        }
    }
}

/// Merge `incoming` into the stored edge (if any), reporting what changed.
pub(crate) fn merge_edge(existing: Option<GraphEdge>, incoming: GraphEdge) -> (GraphEdge, UpsertOutcome) {
    match existing {
        None => (incoming, UpsertOutcome::Created),
        Some(mut stored) => {
            let before = stored.clone();
            stored.absorb(incoming);
            let outcome = if stored == before {
                UpsertOutcome::Unchanged
            } else {
                UpsertOutcome::Updated
            };
            (stored, outcome)
        }
    }
}

pub(crate) fn decode_u64(bytes: &[u8]) -> StoreResult<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Serialization {
        message: format!("expected 8-byte counter, found {} bytes", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(arr))
}
