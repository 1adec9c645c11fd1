//! End-to-end sync cycles against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use infragraph::model::{GraphEdge, GraphNode, NodeStatus, Provider, RelationshipType, ResourceType};
use infragraph::store::{GraphStorage, MemStore, NodeFilter, Pagination};
use infragraph::sync::{
    CancelToken, DiscoveryAdapter, DiscoveryBatch, DiscoveryError, DiscoveryOptions, SyncEngine,
    SyncOptions,
};
use infragraph::temporal::{ManualClock, TemporalStore};

fn node(native: &str) -> GraphNode {
    GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
}

/// `RUST_LOG=infragraph=debug cargo test --test sync_scenarios` shows the cycle logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine() -> (Arc<MemStore>, Arc<ManualClock>, Arc<TemporalStore>, SyncEngine) {
    init_tracing();
    let store = Arc::new(MemStore::new());
    let clock = Arc::new(ManualClock::new(10_000));
    let temporal = Arc::new(TemporalStore::with_clock(store.clone(), clock.clone()));
    let sync = SyncEngine::new(store.clone(), Arc::clone(&temporal));
    (store, clock, temporal, sync)
}

/// Serves whatever it currently holds, in one page.
struct MutableAdapter {
    state: Mutex<(Vec<GraphNode>, Vec<GraphEdge>)>,
}

impl MutableAdapter {
    fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            state: Mutex::new((nodes, edges)),
        }
    }

    fn replace(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) {
        *self.state.lock() = (nodes, edges);
    }
}

#[async_trait]
impl DiscoveryAdapter for MutableAdapter {
    fn id(&self) -> &str {
        "mutable"
    }
    fn provider(&self) -> Provider {
        Provider::new("aws")
    }
    fn account(&self) -> &str {
        "111"
    }
    async fn discover(&self, _options: &DiscoveryOptions) -> Result<DiscoveryBatch, DiscoveryError> {
        let (nodes, edges) = self.state.lock().clone();
        Ok(DiscoveryBatch::new(nodes, edges))
    }
}

/// 10,000 nodes served as 5 pages of 2,000; page 2 can be made to fail.
struct PagedAdapter {
    fail_middle_page: AtomicBool,
}

const PAGES: usize = 5;
const PAGE_SIZE: usize = 2_000;

#[async_trait]
impl DiscoveryAdapter for PagedAdapter {
    fn id(&self) -> &str {
        "paged"
    }
    fn provider(&self) -> Provider {
        Provider::new("aws")
    }
    fn account(&self) -> &str {
        "111"
    }
    async fn discover(&self, options: &DiscoveryOptions) -> Result<DiscoveryBatch, DiscoveryError> {
        let page: usize = options.cursor.as_deref().map_or(0, |c| c.parse().unwrap_or(0));
        if page == 2 && self.fail_middle_page.load(Ordering::SeqCst) {
            return Err(DiscoveryError::recoverable("rate limited").resume_at((page + 1).to_string()));
        }
        let nodes = (page * PAGE_SIZE..(page + 1) * PAGE_SIZE)
            .map(|i| node(&format!("i-{i:05}")))
            .collect();
        let batch = DiscoveryBatch::new(nodes, Vec::new());
        Ok(if page + 1 < PAGES {
            batch.with_next((page + 1).to_string())
        } else {
            batch
        })
    }
}

#[tokio::test]
async fn omitted_node_becomes_disappeared() {
    let (store, clock, _temporal, sync) = engine();
    let (a, b, c) = (node("a"), node("b"), node("c"));
    let ab = GraphEdge::new(a.id.clone(), RelationshipType::ConnectsTo, b.id.clone());
    let bc = GraphEdge::new(b.id.clone(), RelationshipType::ConnectsTo, c.id.clone());
    let adapter = Arc::new(MutableAdapter::new(
        vec![a.clone(), b.clone(), c.clone()],
        vec![ab.clone(), bc],
    ));
    let options = SyncOptions::default();
    let cancel = CancelToken::new();

    let first = sync.run_cycle(adapter.clone(), &options, &cancel).await.unwrap();
    assert_eq!((first.created, first.edges_created), (3, 2));

    clock.advance(60_000);
    adapter.replace(vec![a.clone(), b.clone()], vec![ab]);
    let second = sync.run_cycle(adapter, &options, &cancel).await.unwrap();
    assert_eq!((second.created, second.updated, second.disappeared), (0, 0, 1));
    assert!(second.complete);

    let gone = store.get_node(&c.id).await.unwrap().unwrap();
    assert_eq!(gone.status, NodeStatus::Disappeared);
    for kept in [&a, &b] {
        assert_eq!(store.get_node(&kept.id).await.unwrap().unwrap().status, NodeStatus::Running);
    }
}

#[tokio::test]
async fn unchanged_output_writes_nothing_and_snapshots_match() {
    let (store, clock, temporal, sync) = engine();
    let (a, b) = (node("a"), node("b").with_tag("team", "core"));
    let edge = GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, b.id.clone());
    let adapter = Arc::new(MutableAdapter::new(vec![a.clone(), b], vec![edge]));
    let options = SyncOptions::default();
    let cancel = CancelToken::new();

    sync.run_cycle(adapter.clone(), &options, &cancel).await.unwrap();
    let s1 = temporal.take_snapshot().await.unwrap();
    let versions_before = store.node_versions(&a.id).await.unwrap().len();

    clock.advance(1_000);
    let again = sync.run_cycle(adapter, &options, &cancel).await.unwrap();
    assert_eq!(again.writes(), 0);
    let s2 = temporal.take_snapshot().await.unwrap();

    assert!(temporal.diff_snapshots(s1.id, s2.id).await.unwrap().is_empty());
    assert_eq!(store.node_versions(&a.id).await.unwrap().len(), versions_before);
}

#[tokio::test]
async fn failed_page_is_recorded_and_blocks_the_sweep() {
    let (store, _clock, _temporal, sync) = engine();
    let adapter = Arc::new(PagedAdapter {
        fail_middle_page: AtomicBool::new(false),
    });
    let options = SyncOptions::default();
    let cancel = CancelToken::new();

    let full = sync.run_cycle(adapter.clone(), &options, &cancel).await.unwrap();
    assert_eq!(full.created, PAGES * PAGE_SIZE);

    adapter.fail_middle_page.store(true, Ordering::SeqCst);
    let partial = sync.run_cycle(adapter, &options, &cancel).await.unwrap();
    assert_eq!(partial.nodes_processed, 8_000);
    assert_eq!(partial.errors.len(), 1);
    assert!(partial.errors[0].recoverable);
    assert!(!partial.complete);
    assert_eq!(partial.disappeared, 0);

    let disappeared = store
        .query_nodes(&NodeFilter::new().status(NodeStatus::Disappeared), &Pagination::all())
        .await
        .unwrap();
    assert_eq!(disappeared.total, 0);
}

#[tokio::test]
async fn failed_page_on_first_pass_still_stores_the_rest() {
    let (store, _clock, _temporal, sync) = engine();
    let adapter = Arc::new(PagedAdapter {
        fail_middle_page: AtomicBool::new(true),
    });
    let result = sync
        .run_cycle(adapter, &SyncOptions::default(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(result.created, 8_000);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(store.node_count(), 8_000);

    let records = store.list_sync_records(Some("paged")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].complete);
    assert_eq!(records[0].errors.len(), 1);
}

#[tokio::test]
async fn node_deleted_outside_sync_is_recreated() {
    let (store, _clock, _temporal, sync) = engine();
    let (a, b) = (node("a"), node("b"));
    let ab = GraphEdge::new(a.id.clone(), RelationshipType::ConnectsTo, b.id.clone());
    let adapter = Arc::new(MutableAdapter::new(vec![a.clone(), b.clone()], vec![ab.clone()]));
    let options = SyncOptions::default();
    let cancel = CancelToken::new();

    let first = sync.run_cycle(adapter.clone(), &options, &cancel).await.unwrap();
    assert_eq!((first.created, first.edges_created), (2, 1));

    // Deleting `a` also drops the edge; both must come back on the next cycle.
    assert!(store.delete_node(&a.id).await.unwrap());
    assert!(store.get_edge(&ab.id).await.unwrap().is_none());

    let second = sync.run_cycle(adapter, &options, &cancel).await.unwrap();
    assert_eq!((second.created, second.unchanged), (1, 1));
    assert_eq!(second.edges_created, 1);
    assert!(store.get_node(&a.id).await.unwrap().is_some());
    assert!(store.get_edge(&ab.id).await.unwrap().is_some());
}
