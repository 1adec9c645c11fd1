//! In-memory storage backed by DashMap.
//!
//! Provides the fastest possible lookups and is the reference backend for
//! tests and single-process deployments. All data is lost on process exit.
//! No method ever awaits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::model::{
    EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Provider, Snapshot, SnapshotId,
    SnapshotSummary, SyncRecord, Timestamp, UpsertOutcome,
};

use super::{
    EdgeFilter, GraphStorage, NodeFilter, Page, Pagination, StoreResult, decode_u64, merge_edge,
    merge_node, paginate,
};

/// `(account, provider, native_id)` secondary index key.
type NativeKey = (String, Provider, String);

/// Concurrent in-memory graph store using sharded hashmaps.
///
/// Upserts hold the shared side of `gate` for a whole batch; node deletes
/// and [`MemStore::capture`] hold the exclusive side, so a snapshot never
/// observes a half-applied batch and an edge never outlives its endpoint.
#[derive(Debug, Default)]
pub struct MemStore {
    nodes: DashMap<NodeId, GraphNode>,
    edges: DashMap<EdgeId, GraphEdge>,
    native_index: DashMap<NativeKey, NodeId>,
    node_versions: DashMap<NodeId, Vec<NodeVersion>>,
    edge_versions: DashMap<EdgeId, Vec<EdgeVersion>>,
    snapshots: RwLock<BTreeMap<SnapshotId, Snapshot>>,
    sync_records: RwLock<Vec<SyncRecord>>,
    meta: RwLock<BTreeMap<String, Vec<u8>>>,
    gate: RwLock<()>,
}

impl MemStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of stored edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Callers hold the shared gate.
    fn put_node(&self, node: GraphNode) -> UpsertOutcome {
        let native_key = (node.account.clone(), node.provider.clone(), node.native_id.clone());
        let id = node.id.clone();
        let outcome = match self.nodes.entry(node.id.clone()) {
            Entry::Occupied(mut slot) => {
                let (merged, outcome) = merge_node(Some(slot.get().clone()), node);
                slot.insert(merged);
                outcome
            }
            Entry::Vacant(slot) => {
                slot.insert(node);
                UpsertOutcome::Created
            }
        };
        self.native_index.insert(native_key, id);
        outcome
    }

    fn check_endpoints(&self, edge: &GraphEdge) -> StoreResult<()> {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if !self.nodes.contains_key(endpoint) {
                return Err(StoreError::DanglingEdge {
                    edge_id: edge.id.to_string(),
                    missing: endpoint.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Callers hold the shared gate and have checked the endpoints.
    fn put_edge(&self, edge: GraphEdge) -> UpsertOutcome {
        match self.edges.entry(edge.id.clone()) {
            Entry::Occupied(mut slot) => {
                let (merged, outcome) = merge_edge(Some(slot.get().clone()), edge);
                slot.insert(merged);
                outcome
            }
            Entry::Vacant(slot) => {
                slot.insert(edge);
                UpsertOutcome::Created
            }
        }
    }

    fn remove_node(&self, id: &NodeId) -> bool {
        let _gate = self.gate.write();
        let Some((_, node)) = self.nodes.remove(id) else {
            return false;
        };
        self.native_index
            .remove(&(node.account, node.provider, node.native_id));
        self.edges.retain(|_, edge| !edge.touches(id));
        true
    }

    fn sorted_nodes(&self, filter: &NodeFilter) -> Vec<GraphNode> {
        let mut matches: Vec<GraphNode> = self
            .nodes
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    fn sorted_edges(&self, filter: &EdgeFilter) -> Vec<GraphEdge> {
        let mut matches: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// Consistent copy of every node and edge, ordered by id.
    pub fn capture(&self) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let _gate = self.gate.write();
        (
            self.sorted_nodes(&NodeFilter::default()),
            self.sorted_edges(&EdgeFilter::default()),
        )
    }
}

/// Insert or replace a version (keyed by its number) keeping the chain ordered
/// by `(recorded_at, version)`.
fn place_version<T>(chain: &mut Vec<T>, item: T, key: impl Fn(&T) -> (Timestamp, u64)) {
    let version = key(&item).1;
    chain.retain(|v| key(v).1 != version);
    chain.push(item);
    chain.sort_by_key(|v| key(v));
}

fn node_version_key(v: &NodeVersion) -> (Timestamp, u64) {
    (v.recorded_at, v.version)
}

fn edge_version_key(v: &EdgeVersion) -> (Timestamp, u64) {
    (v.recorded_at, v.version)
}

#[async_trait]
impl GraphStorage for MemStore {
    async fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome> {
        let _gate = self.gate.read();
        Ok(self.put_node(node))
    }

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        let _gate = self.gate.read();
        Ok(nodes.into_iter().map(|node| self.put_node(node)).collect())
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome> {
        let _gate = self.gate.read();
        self.check_endpoints(&edge)?;
        Ok(self.put_edge(edge))
    }

    /// All or nothing: a dangling edge rejects the whole batch.
    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        let _gate = self.gate.read();
        for edge in &edges {
            self.check_endpoints(edge)?;
        }
        Ok(edges.into_iter().map(|edge| self.put_edge(edge)).collect())
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>> {
        Ok(self.nodes.get(id).map(|n| n.value().clone()))
    }

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>> {
        let key = (account.to_string(), provider.clone(), native_id.to_string());
        let Some(id) = self.native_index.get(&key).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        Ok(self.nodes.get(&id).map(|n| n.value().clone()))
    }

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>> {
        Ok(self.edges.get(id).map(|e| e.value().clone()))
    }

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>> {
        Ok(paginate(self.sorted_nodes(filter), page, |n| n.id.as_str()))
    }

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>> {
        Ok(paginate(self.sorted_edges(filter), page, |e| e.id.as_str()))
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool> {
        Ok(self.remove_node(id))
    }

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool> {
        let _gate = self.gate.read();
        Ok(self.edges.remove(id).is_some())
    }

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()> {
        let mut chain = self.node_versions.entry(version.node_id.clone()).or_default();
        place_version(chain.value_mut(), version, node_version_key);
        Ok(())
    }

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()> {
        let mut chain = self.edge_versions.entry(version.edge_id.clone()).or_default();
        place_version(chain.value_mut(), version, edge_version_key);
        Ok(())
    }

    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>> {
        Ok(self
            .node_versions
            .get(id)
            .map(|chain| chain.value().clone())
            .unwrap_or_default())
    }

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>> {
        Ok(self
            .edge_versions
            .get(id)
            .map(|chain| chain.value().clone())
            .unwrap_or_default())
    }

    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>> {
        let mut out: Vec<NodeVersion> = self
            .node_versions
            .iter()
            .flat_map(|chain| {
                chain
                    .value()
                    .iter()
                    .filter(|v| v.recorded_at <= t)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| (&a.node_id, a.version).cmp(&(&b.node_id, b.version)));
        Ok(out)
    }

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>> {
        let mut out: Vec<EdgeVersion> = self
            .edge_versions
            .iter()
            .flat_map(|chain| {
                chain
                    .value()
                    .iter()
                    .filter(|v| v.recorded_at <= t)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| (&a.edge_id, a.version).cmp(&(&b.edge_id, b.version)));
        Ok(out)
    }

    async fn prune_versions_before(&self, t: Timestamp) -> StoreResult<usize> {
        let mut removed = 0;
        for mut chain in self.node_versions.iter_mut() {
            let before = chain.len();
            chain.retain(|v| v.recorded_at >= t);
            removed += before - chain.len();
        }
        for mut chain in self.edge_versions.iter_mut() {
            let before = chain.len();
            chain.retain(|v| v.recorded_at >= t);
            removed += before - chain.len();
        }
        self.node_versions.retain(|_, chain| !chain.is_empty());
        self.edge_versions.retain(|_, chain| !chain.is_empty());
        Ok(removed)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        self.snapshots.write().insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>> {
        Ok(self.snapshots.read().get(&id).cloned())
    }

    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        Ok(self.snapshots.read().values().map(Snapshot::summary).collect())
    }

    async fn delete_snapshot(&self, id: SnapshotId) -> StoreResult<bool> {
        Ok(self.snapshots.write().remove(&id).is_some())
    }

    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)> {
        Ok(self.capture())
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        let mut records = self.sync_records.write();
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        records.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
        Ok(())
    }

    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        Ok(self
            .sync_records
            .read()
            .iter()
            .filter(|r| adapter_id.is_none_or(|a| r.adapter_id == a))
            .cloned()
            .collect())
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.meta.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.meta.read().get(key).cloned())
    }

    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .meta
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let mut meta = self.meta.write();
        let current = match meta.get(key) {
            Some(bytes) => decode_u64(bytes)?,
            None => 0,
        };
        let next = current + 1;
        meta.insert(key.to_string(), next.to_be_bytes().to_vec());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{RelationshipType, ResourceType};

    fn vm(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = MemStore::new();
        let node = vm("i-1");
        assert_eq!(store.upsert_node(node.clone()).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.get_node(&node.id).await.unwrap(), Some(node.clone()));
        let by_native = store
            .get_node_by_native_id("111", &Provider::new("aws"), "i-1")
            .await
            .unwrap();
        assert_eq!(by_native.map(|n| n.id), Some(node.id));
    }

    #[tokio::test]
    async fn delete_node_removes_incident_edges() {
        let store = MemStore::new();
        let a = vm("a");
        let b = vm("b");
        store.upsert_node(a.clone()).await.unwrap();
        store.upsert_node(b.clone()).await.unwrap();
        store
            .upsert_edge(GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, b.id.clone()))
            .await
            .unwrap();
        assert_eq!(store.edge_count(), 1);
        assert!(store.delete_node(&b.id).await.unwrap());
        assert_eq!(store.edge_count(), 0);
        assert!(!store.delete_node(&b.id).await.unwrap());
    }

    #[tokio::test]
    async fn meta_prefix_scan_is_ordered() {
        let store = MemStore::new();
        store.put_meta("tenant:b", b"2").await.unwrap();
        store.put_meta("tenant:a", b"1").await.unwrap();
        store.put_meta("account:x", b"3").await.unwrap();
        let scanned = store.scan_meta_prefix("tenant:").await.unwrap();
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["tenant:a", "tenant:b"]);
    }

    #[test]
    fn concurrent_upserts() {
        let store = Arc::new(MemStore::new());
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let _gate = store.gate.read();
                    store.put_node(vm(&format!("i-{i}")));
                    store.put_node(vm(&format!("i-{i}")));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.node_count(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capture_never_sees_part_of_a_batch() {
        let store = Arc::new(MemStore::new());
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for batch in 0..20 {
                    let nodes = (0..100).map(|i| vm(&format!("b{batch:02}-{i:03}"))).collect();
                    store.upsert_nodes(nodes).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let reader = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || {
                for _ in 0..200 {
                    let (nodes, _) = store.capture();
                    assert_eq!(nodes.len() % 100, 0, "captured {} nodes", nodes.len());
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
        assert_eq!(store.node_count(), 2_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn edge_upsert_racing_node_delete_leaves_no_dangling_edge() {
        let store = Arc::new(MemStore::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..200 {
            let (a, b) = (vm(&format!("a-{i}")), vm(&format!("b-{i}")));
            store.upsert_nodes(vec![a.clone(), b.clone()]).await.unwrap();
            let edge = GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, b.id.clone());
            let deleter = Arc::clone(&store);
            tasks.spawn(async move {
                deleter.delete_node(&a.id).await.unwrap();
            });
            let writer = Arc::clone(&store);
            tasks.spawn(async move {
                // Either outcome is fine as long as the store stays consistent.
                let _ = writer.upsert_edge(edge).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        for entry in store.edges.iter() {
            let edge = entry.value();
            assert!(store.nodes.contains_key(&edge.source_node_id), "{} dangles", edge.id);
            assert!(store.nodes.contains_key(&edge.target_node_id), "{} dangles", edge.id);
        }
    }

    #[tokio::test]
    async fn edge_batch_with_a_dangling_edge_writes_nothing() {
        let store = MemStore::new();
        let (a, b) = (vm("a"), vm("b"));
        store.upsert_nodes(vec![a.clone(), b.clone()]).await.unwrap();
        let good = GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, b.id.clone());
        let bad = GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, NodeId::new("ghost"));
        let err = store.upsert_edges(vec![good, bad]).await.unwrap_err();
        assert!(matches!(err, StoreError::DanglingEdge { .. }));
        assert_eq!(store.edge_count(), 0);
    }
}
