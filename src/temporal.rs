//! Temporal store: snapshots, per-entity version chains and point-in-time
//! reconstruction.
//!
//! Every observed change appends a [`NodeVersion`] or [`EdgeVersion`] holding
//! the full entity state after the change. [`TemporalStore::get_topology_at`]
//! rebuilds the graph at any instant by taking, per entity, the latest
//! version recorded at or before it. Diffs compare two graph states and
//! report field-level deltas over flattened paths (`tags.environment`,
//! `metadata.engine.version`), ignoring the volatile `last_seen_at` and
//! `updated_at` fields.
//!
//! Retention compacts old history into one baseline version per entity and
//! advances a persisted *history floor*; reconstruction before the floor
//! fails with [`TemporalError::HistoryUnavailable`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{
    ChangeKind, EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Snapshot, SnapshotId,
    SnapshotSummary, Timestamp, now_millis,
};
use crate::store::{EdgeFilter, GraphStorage, Pagination, decode_u64};

const HISTORY_FLOOR_KEY: &str = "temporal:history_floor";
const SNAPSHOT_SEQUENCE_KEY: &str = "seq:snapshot";

/// Top-level fields excluded from diffs and content comparison.
pub const VOLATILE_FIELDS: &[&str] = &["last_seen_at", "updated_at"];

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors specific to temporal queries and retention.
#[derive(Debug, Error, Diagnostic)]
pub enum TemporalError {
    #[error("history unavailable: requested t={requested}, oldest retained point is t={floor}")]
    #[diagnostic(
        code(infragraph::temporal::history_unavailable),
        help(
            "Retention has compacted history older than the floor. Query a timestamp at or \
             after the floor, or relax the retention policy's max age."
        )
    )]
    HistoryUnavailable { requested: Timestamp, floor: Timestamp },

    #[error("snapshot not found: {id}")]
    #[diagnostic(
        code(infragraph::temporal::snapshot_not_found),
        help("List the retained snapshots with `list_snapshots()`; old ones may have been pruned.")
    )]
    SnapshotNotFound { id: SnapshotId },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Result type for temporal operations.
pub type TemporalResult<T> = std::result::Result<T, TemporalError>;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for version and snapshot timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now_millis()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.now.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Count- and/or age-based retention. The newest snapshot is always kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_snapshots: Option<usize>,
    pub max_age_ms: Option<u64>,
}

impl RetentionPolicy {
    pub fn keep_last(max_snapshots: usize) -> Self {
        Self {
            max_snapshots: Some(max_snapshots),
            max_age_ms: None,
        }
    }

    pub fn max_age_days(days: u64) -> Self {
        Self {
            max_snapshots: None,
            max_age_ms: Some(days.saturating_mul(24 * 60 * 60 * 1000)),
        }
    }
}

/// What a retention pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub snapshots_deleted: usize,
    pub versions_pruned: usize,
    pub history_floor: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Diffs
// ---------------------------------------------------------------------------

/// One changed field between two states of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// Flattened dotted path, e.g. `tags.environment`.
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// An entity present on both sides of a diff with field-level changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff<T> {
    pub id: String,
    pub before: T,
    pub after: T,
    pub changes: Vec<FieldDelta>,
}

/// Added/removed/modified sets for nodes and edges, each ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    pub added_nodes: Vec<GraphNode>,
    pub removed_nodes: Vec<GraphNode>,
    pub modified_nodes: Vec<EntityDiff<GraphNode>>,
    pub added_edges: Vec<GraphEdge>,
    pub removed_edges: Vec<GraphEdge>,
    pub modified_edges: Vec<EntityDiff<GraphEdge>>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
            && self.modified_edges.is_empty()
    }

    /// Total number of changed entities.
    pub fn change_count(&self) -> usize {
        self.added_nodes.len()
            + self.removed_nodes.len()
            + self.modified_nodes.len()
            + self.added_edges.len()
            + self.removed_edges.len()
            + self.modified_edges.len()
    }
}

/// Flatten a serialized entity into `path -> leaf` pairs. Objects are walked;
/// arrays and scalars are leaves. Volatile top-level fields are skipped.
pub fn flatten_entity<T: Serialize>(entity: &T) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Ok(Value::Object(fields)) = serde_json::to_value(entity) {
        for (key, value) in fields {
            if VOLATILE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            flatten_into(&key, value, &mut out);
        }
    }
    out
}

fn flatten_into(prefix: &str, value: Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(&format!("{prefix}.{key}"), child, out);
            }
        }
        // Empty maps contribute nothing so that `{}` and absent compare equal.
        Value::Object(_) => {}
        leaf => {
            out.insert(prefix.to_string(), leaf);
        }
    }
}

/// Field-level deltas between two states of the same entity.
pub fn field_deltas<T: Serialize>(before: &T, after: &T) -> Vec<FieldDelta> {
    let left = flatten_entity(before);
    let right = flatten_entity(after);
    let mut paths: Vec<&String> = left.keys().chain(right.keys()).collect();
    paths.sort();
    paths.dedup();
    paths
        .into_iter()
        .filter_map(|path| {
            let b = left.get(path);
            let a = right.get(path);
            (b != a).then(|| FieldDelta {
                path: path.clone(),
                before: b.cloned(),
                after: a.cloned(),
            })
        })
        .collect()
}

fn diff_sets<T: Clone + Serialize>(
    before: &[T],
    after: &[T],
    id_of: impl Fn(&T) -> &str,
) -> (Vec<T>, Vec<T>, Vec<EntityDiff<T>>) {
    let left: BTreeMap<&str, &T> = before.iter().map(|e| (id_of(e), e)).collect();
    let right: BTreeMap<&str, &T> = after.iter().map(|e| (id_of(e), e)).collect();

    let added = right
        .iter()
        .filter(|(id, _)| !left.contains_key(*id))
        .map(|(_, e)| (*e).clone())
        .collect();
    let removed = left
        .iter()
        .filter(|(id, _)| !right.contains_key(*id))
        .map(|(_, e)| (*e).clone())
        .collect();
    let modified = left
        .iter()
        .filter_map(|(id, b)| {
            let a = right.get(id)?;
            let changes = field_deltas(*b, *a);
            (!changes.is_empty()).then(|| EntityDiff {
                id: (*id).to_string(),
                before: (*b).clone(),
                after: (*a).clone(),
                changes,
            })
        })
        .collect();
    (added, removed, modified)
}

/// Diff two graph states.
pub fn diff_graphs(
    before_nodes: &[GraphNode],
    before_edges: &[GraphEdge],
    after_nodes: &[GraphNode],
    after_edges: &[GraphEdge],
) -> GraphDiff {
    let (added_nodes, removed_nodes, modified_nodes) =
        diff_sets(before_nodes, after_nodes, |n| n.id.as_str());
    let (added_edges, removed_edges, modified_edges) =
        diff_sets(before_edges, after_edges, |e| e.id.as_str());
    GraphDiff {
        added_nodes,
        removed_nodes,
        modified_nodes,
        added_edges,
        removed_edges,
        modified_edges,
    }
}

/// The graph as it stood at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub at: Timestamp,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// ---------------------------------------------------------------------------
// Temporal store
// ---------------------------------------------------------------------------

/// Snapshots and version chains layered over any [`GraphStorage`].
pub struct TemporalStore {
    storage: Arc<dyn GraphStorage>,
    clock: Arc<dyn Clock>,
    /// Serializes version-number allocation within this process.
    append_lock: Mutex<()>,
}

impl TemporalStore {
    pub fn new(storage: Arc<dyn GraphStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn GraphStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            append_lock: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn storage(&self) -> &Arc<dyn GraphStorage> {
        &self.storage
    }

    /// Append a version for `node` recording `change` at the current clock time.
    pub async fn record_node_change(&self, node: &GraphNode, change: ChangeKind) -> TemporalResult<NodeVersion> {
        let _guard = self.append_lock.lock().await;
        let chain = self.storage.node_versions(&node.id).await?;
        let version = NodeVersion {
            node_id: node.id.clone(),
            version: chain.iter().map(|v| v.version).max().unwrap_or(0) + 1,
            recorded_at: self.clock.now(),
            change,
            node: node.clone(),
        };
        self.storage.append_node_version(version.clone()).await?;
        Ok(version)
    }

    /// Append a version for `edge` recording `change` at the current clock time.
    pub async fn record_edge_change(&self, edge: &GraphEdge, change: ChangeKind) -> TemporalResult<EdgeVersion> {
        let _guard = self.append_lock.lock().await;
        let chain = self.storage.edge_versions(&edge.id).await?;
        let version = EdgeVersion {
            edge_id: edge.id.clone(),
            version: chain.iter().map(|v| v.version).max().unwrap_or(0) + 1,
            recorded_at: self.clock.now(),
            change,
            edge: edge.clone(),
        };
        self.storage.append_edge_version(version.clone()).await?;
        Ok(version)
    }

    /// Hard-delete a node, recording `Deleted` versions for it and every
    /// incident edge first.
    pub async fn delete_node(&self, id: &NodeId) -> TemporalResult<bool> {
        let Some(node) = self.storage.get_node(id).await? else {
            return Ok(false);
        };
        let incident = self
            .storage
            .query_edges(&EdgeFilter::new().touching(id.clone()), &Pagination::all())
            .await?;
        for edge in &incident.items {
            self.record_edge_change(edge, ChangeKind::Deleted).await?;
        }
        self.record_node_change(&node, ChangeKind::Deleted).await?;
        Ok(self.storage.delete_node(id).await?)
    }

    /// Hard-delete an edge, recording a `Deleted` version first.
    pub async fn delete_edge(&self, id: &EdgeId) -> TemporalResult<bool> {
        let Some(edge) = self.storage.get_edge(id).await? else {
            return Ok(false);
        };
        self.record_edge_change(&edge, ChangeKind::Deleted).await?;
        Ok(self.storage.delete_edge(id).await?)
    }

    /// Capture the full current graph as a new snapshot.
    pub async fn take_snapshot(&self) -> TemporalResult<Snapshot> {
        let id = SnapshotId(self.storage.next_sequence(SNAPSHOT_SEQUENCE_KEY).await?);
        let (nodes, edges) = self.storage.capture_state().await?;
        let snapshot = Snapshot {
            id,
            taken_at: self.clock.now(),
            nodes,
            edges,
        };
        self.storage.save_snapshot(&snapshot).await?;
        tracing::info!(
            snapshot = %snapshot.id,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, id: SnapshotId) -> TemporalResult<Snapshot> {
        self.storage
            .get_snapshot(id)
            .await?
            .ok_or(TemporalError::SnapshotNotFound { id })
    }

    pub async fn list_snapshots(&self) -> TemporalResult<Vec<SnapshotSummary>> {
        Ok(self.storage.list_snapshots().await?)
    }

    /// Oldest reconstructable timestamp, if retention has ever compacted history.
    pub async fn history_floor(&self) -> TemporalResult<Option<Timestamp>> {
        match self.storage.get_meta(HISTORY_FLOOR_KEY).await? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn check_floor(&self, t: Timestamp) -> TemporalResult<()> {
        if let Some(floor) = self.history_floor().await? {
            if t < floor {
                return Err(TemporalError::HistoryUnavailable { requested: t, floor });
            }
        }
        Ok(())
    }

    /// Reconstruct the graph at `t` from version chains.
    ///
    /// Entities whose latest version at `t` is `Deleted` are absent; edges
    /// whose endpoints are absent are dropped.
    pub async fn get_topology_at(&self, t: Timestamp) -> TemporalResult<Topology> {
        self.check_floor(t).await?;

        let mut latest_nodes: BTreeMap<NodeId, NodeVersion> = BTreeMap::new();
        for v in self.storage.node_versions_until(t).await? {
            let newer = latest_nodes
                .get(&v.node_id)
                .is_none_or(|cur| (v.recorded_at, v.version) > (cur.recorded_at, cur.version));
            if newer {
                latest_nodes.insert(v.node_id.clone(), v);
            }
        }
        let nodes: Vec<GraphNode> = latest_nodes
            .into_values()
            .filter(|v| v.change != ChangeKind::Deleted)
            .map(|v| v.node)
            .collect();

        let present: std::collections::BTreeSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
        let mut latest_edges: BTreeMap<EdgeId, EdgeVersion> = BTreeMap::new();
        for v in self.storage.edge_versions_until(t).await? {
            let newer = latest_edges
                .get(&v.edge_id)
                .is_none_or(|cur| (v.recorded_at, v.version) > (cur.recorded_at, cur.version));
            if newer {
                latest_edges.insert(v.edge_id.clone(), v);
            }
        }
        let edges: Vec<GraphEdge> = latest_edges
            .into_values()
            .filter(|v| v.change != ChangeKind::Deleted)
            .map(|v| v.edge)
            .filter(|e| present.contains(&e.source_node_id) && present.contains(&e.target_node_id))
            .collect();

        Ok(Topology { at: t, nodes, edges })
    }

    /// Version chain of one node, oldest first.
    pub async fn get_node_history(&self, id: &NodeId) -> TemporalResult<Vec<NodeVersion>> {
        Ok(self.storage.node_versions(id).await?)
    }

    pub async fn get_edge_history(&self, id: &EdgeId) -> TemporalResult<Vec<EdgeVersion>> {
        Ok(self.storage.edge_versions(id).await?)
    }

    pub async fn diff_snapshots(&self, a: SnapshotId, b: SnapshotId) -> TemporalResult<GraphDiff> {
        let before = self.get_snapshot(a).await?;
        let after = if a == b { before.clone() } else { self.get_snapshot(b).await? };
        Ok(diff_graphs(&before.nodes, &before.edges, &after.nodes, &after.edges))
    }

    pub async fn diff_timestamps(&self, t1: Timestamp, t2: Timestamp) -> TemporalResult<GraphDiff> {
        let before = self.get_topology_at(t1).await?;
        let after = self.get_topology_at(t2).await?;
        Ok(diff_graphs(&before.nodes, &before.edges, &after.nodes, &after.edges))
    }

    /// Prune snapshots and compact version history per `policy`.
    pub async fn apply_retention(&self, policy: &RetentionPolicy) -> TemporalResult<RetentionReport> {
        let now = self.clock.now();
        let mut report = RetentionReport::default();

        let snapshots = self.storage.list_snapshots().await?;
        if let Some((newest, older)) = snapshots.split_last() {
            let cutoff = policy.max_age_ms.map(|age| now.saturating_sub(age));
            let mut survivors: Vec<&SnapshotSummary> = Vec::new();
            for summary in older {
                if cutoff.is_some_and(|c| summary.taken_at < c) {
                    self.storage.delete_snapshot(summary.id).await?;
                    report.snapshots_deleted += 1;
                } else {
                    survivors.push(summary);
                }
            }
            if let Some(max) = policy.max_snapshots {
                // The newest snapshot counts against the limit but is never removed.
                let keep_older = max.saturating_sub(1);
                let excess = survivors.len().saturating_sub(keep_older);
                for summary in survivors.iter().take(excess) {
                    self.storage.delete_snapshot(summary.id).await?;
                    report.snapshots_deleted += 1;
                }
            }
            tracing::debug!(newest = %newest.id, deleted = report.snapshots_deleted, "snapshot retention applied");
        }

        if let Some(age) = policy.max_age_ms {
            let cutoff = now.saturating_sub(age);
            if cutoff > 0 {
                self.compact_before(cutoff).await?;
                report.versions_pruned = self.storage.prune_versions_before(cutoff).await?;
                let floor = self.history_floor().await?.unwrap_or(0).max(cutoff);
                self.storage
                    .put_meta(HISTORY_FLOOR_KEY, &floor.to_be_bytes())
                    .await?;
                report.history_floor = Some(floor);
            }
        }

        tracing::info!(
            snapshots_deleted = report.snapshots_deleted,
            versions_pruned = report.versions_pruned,
            floor = ?report.history_floor,
            "retention applied"
        );
        Ok(report)
    }

    /// Re-record each entity's last pre-`cutoff` state at `cutoff`, so that
    /// pruning older versions keeps reconstruction exact from `cutoff` on.
    async fn compact_before(&self, cutoff: Timestamp) -> TemporalResult<()> {
        let _guard = self.append_lock.lock().await;
        let before = cutoff - 1;

        let mut nodes: BTreeMap<NodeId, NodeVersion> = BTreeMap::new();
        for v in self.storage.node_versions_until(before).await? {
            let newer = nodes
                .get(&v.node_id)
                .is_none_or(|cur| (v.recorded_at, v.version) > (cur.recorded_at, cur.version));
            if newer {
                nodes.insert(v.node_id.clone(), v);
            }
        }
        for (_, baseline) in nodes {
            if baseline.change != ChangeKind::Deleted {
                self.storage
                    .append_node_version(NodeVersion {
                        recorded_at: cutoff,
                        ..baseline
                    })
                    .await?;
            }
        }

        let mut edges: BTreeMap<EdgeId, EdgeVersion> = BTreeMap::new();
        for v in self.storage.edge_versions_until(before).await? {
            let newer = edges
                .get(&v.edge_id)
                .is_none_or(|cur| (v.recorded_at, v.version) > (cur.recorded_at, cur.version));
            if newer {
                edges.insert(v.edge_id.clone(), v);
            }
        }
        for (_, baseline) in edges {
            if baseline.change != ChangeKind::Deleted {
                self.storage
                    .append_edge_version(EdgeVersion {
                        recorded_at: cutoff,
                        ..baseline
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
