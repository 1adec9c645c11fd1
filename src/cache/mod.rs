//! Read cache over any [`GraphStorage`], invalidated by a write generation.
//!
//! [`CachedStorage`] bumps its generation on every entity write that changed
//! something and serves `get_node`, `query_nodes` and `query_edges` from a
//! [`QueryCache`]. Entries tagged with an older generation are misses. Reads
//! capture the generation *before* calling the backend, so a write racing
//! with a fill leaves that entry stale instead of serving an old result.

pub mod lru;
pub mod query;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{
    EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Provider, Snapshot, SnapshotId,
    SnapshotSummary, SyncRecord, Timestamp, UpsertOutcome,
};
use crate::store::{EdgeFilter, GraphStorage, NodeFilter, Page, Pagination, StoreResult};

pub use lru::{CacheStats, LruCache};
pub use query::{CachedValue, QueryCache, cache_key};

/// Caching decorator around a storage backend.
pub struct CachedStorage {
    inner: Arc<dyn GraphStorage>,
    generation: AtomicU64,
    cache: QueryCache,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn GraphStorage>, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner,
            generation: AtomicU64::new(0),
            cache: QueryCache::new(capacity, ttl),
        }
    }

    pub fn inner(&self) -> &Arc<dyn GraphStorage> {
        &self.inner
    }

    /// Current write generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every cached entry.
    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stale_count(&self) -> u64 {
        self.cache.stale_count()
    }

    fn bump_if_changed(&self, outcome: UpsertOutcome) {
        if outcome != UpsertOutcome::Unchanged {
            self.bump();
        }
    }
}

impl std::fmt::Debug for CachedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStorage")
            .field("generation", &self.generation())
            .field("cache", &self.cache)
            .finish()
    }
}

#[async_trait]
impl GraphStorage for CachedStorage {
    async fn initialize(&self) -> StoreResult<()> {
        self.inner.initialize().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.cache.clear();
        self.inner.close().await
    }

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome> {
        let outcome = self.inner.upsert_node(node).await?;
        self.bump_if_changed(outcome);
        Ok(outcome)
    }

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        let result = self.inner.upsert_nodes(nodes).await;
        // A failed batch may have applied a prefix.
        match &result {
            Ok(outcomes) if outcomes.iter().all(|o| *o == UpsertOutcome::Unchanged) => {}
            _ => self.bump(),
        }
        result
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome> {
        let outcome = self.inner.upsert_edge(edge).await?;
        self.bump_if_changed(outcome);
        Ok(outcome)
    }

    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        let result = self.inner.upsert_edges(edges).await;
        match &result {
            Ok(outcomes) if outcomes.iter().all(|o| *o == UpsertOutcome::Unchanged) => {}
            _ => self.bump(),
        }
        result
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>> {
        let generation = self.generation();
        let key = cache_key("node", id, &());
        if let Some(CachedValue::Node(hit)) = self.cache.get(&key, generation) {
            return Ok(hit);
        }
        let node = self.inner.get_node(id).await?;
        self.cache.insert(key, generation, CachedValue::Node(node.clone()));
        Ok(node)
    }

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>> {
        self.inner.get_node_by_native_id(account, provider, native_id).await
    }

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>> {
        self.inner.get_edge(id).await
    }

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>> {
        let generation = self.generation();
        let key = cache_key("nodes", filter, page);
        if let Some(CachedValue::Nodes(hit)) = self.cache.get(&key, generation) {
            return Ok(hit);
        }
        let result = self.inner.query_nodes(filter, page).await?;
        self.cache.insert(key, generation, CachedValue::Nodes(result.clone()));
        Ok(result)
    }

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>> {
        let generation = self.generation();
        let key = cache_key("edges", filter, page);
        if let Some(CachedValue::Edges(hit)) = self.cache.get(&key, generation) {
            return Ok(hit);
        }
        let result = self.inner.query_edges(filter, page).await?;
        self.cache.insert(key, generation, CachedValue::Edges(result.clone()));
        Ok(result)
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool> {
        let existed = self.inner.delete_node(id).await?;
        self.bump();
        Ok(existed)
    }

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool> {
        let existed = self.inner.delete_edge(id).await?;
        self.bump();
        Ok(existed)
    }

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()> {
        self.inner.append_node_version(version).await
    }

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()> {
        self.inner.append_edge_version(version).await
    }

    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>> {
        self.inner.node_versions(id).await
    }

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>> {
        self.inner.edge_versions(id).await
    }

    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>> {
        self.inner.node_versions_until(t).await
    }

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>> {
        self.inner.edge_versions_until(t).await
    }

    async fn prune_versions_before(&self, t: Timestamp) -> StoreResult<usize> {
        self.inner.prune_versions_before(t).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>> {
        self.inner.get_snapshot(id).await
    }

    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        self.inner.list_snapshots().await
    }

    async fn delete_snapshot(&self, id: SnapshotId) -> StoreResult<bool> {
        self.inner.delete_snapshot(id).await
    }

    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)> {
        self.inner.capture_state().await
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        self.inner.save_sync_record(record).await
    }

    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        self.inner.list_sync_records(adapter_id).await
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner.put_meta(key, value).await
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get_meta(key).await
    }

    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_meta_prefix(prefix).await
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        self.inner.next_sequence(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;
    use crate::store::MemStore;

    fn cached() -> CachedStorage {
        CachedStorage::new(Arc::new(MemStore::new()), 64, None)
    }

    fn node(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
    }

    #[tokio::test]
    async fn repeated_query_is_served_from_cache() {
        let store = cached();
        store.upsert_node(node("a")).await.unwrap();
        let filter = NodeFilter::new();
        store.query_nodes(&filter, &Pagination::all()).await.unwrap();
        store.query_nodes(&filter, &Pagination::all()).await.unwrap();
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn write_invalidates_cached_query() {
        let store = cached();
        store.upsert_node(node("a")).await.unwrap();
        let filter = NodeFilter::new();
        assert_eq!(store.query_nodes(&filter, &Pagination::all()).await.unwrap().total, 1);
        let before = store.generation();
        store.upsert_node(node("b")).await.unwrap();
        assert!(store.generation() > before);
        assert_eq!(store.query_nodes(&filter, &Pagination::all()).await.unwrap().total, 2);
        assert_eq!(store.stale_count(), 1);
    }

    #[tokio::test]
    async fn unchanged_upsert_keeps_generation() {
        let store = cached();
        let n = node("a").observed_at(5);
        store.upsert_node(n.clone()).await.unwrap();
        let generation = store.generation();
        assert_eq!(store.upsert_node(n).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.generation(), generation);
    }
}
