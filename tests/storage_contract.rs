//! One contract, three backends.
//!
//! Every test body below is written against `&dyn GraphStorage` and run
//! unchanged against the in-memory store, the embedded redb store and the
//! SQL store (SQLite in a temp directory).

use std::sync::Arc;

use tempfile::TempDir;

use infragraph::error::StoreError;
use infragraph::iql::{self, QueryResult};
use infragraph::model::{
    ChangeKind, GraphEdge, GraphNode, NodeId, NodeStatus, NodeVersion, Provider, RelationshipType,
    ResourceType, Snapshot, SnapshotId, SyncRecord, TenantId, UpsertOutcome,
};
use infragraph::store::{
    DurableStore, EdgeFilter, GraphStorage, MemStore, NodeFilter, Pagination, SqlStore,
};
use infragraph::temporal::TemporalStore;

type Opened = (Option<TempDir>, Arc<dyn GraphStorage>);

async fn open_mem() -> Opened {
    (None, Arc::new(MemStore::new()))
}

async fn open_redb() -> Opened {
    let dir = TempDir::new().unwrap();
    let store = DurableStore::open(dir.path()).unwrap();
    store.initialize().await.unwrap();
    (Some(dir), Arc::new(store))
}

async fn open_sqlite() -> Opened {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("graph.db").display());
    let store = SqlStore::connect(&url, 4).await.unwrap();
    store.initialize().await.unwrap();
    (Some(dir), Arc::new(store))
}

fn node(native: &str, resource_type: ResourceType) -> GraphNode {
    GraphNode::new("aws", "111", "us-east-1", resource_type, native, native).observed_at(1_000)
}

// ---------------------------------------------------------------------------
// Contract bodies
// ---------------------------------------------------------------------------

async fn upsert_reports_outcomes(store: &dyn GraphStorage) {
    let db = node("db-1", ResourceType::Database);
    assert_eq!(store.upsert_node(db.clone()).await.unwrap(), UpsertOutcome::Created);
    assert_eq!(store.upsert_node(db.clone()).await.unwrap(), UpsertOutcome::Unchanged);

    let tagged = db.clone().with_tag("environment", "production");
    assert_eq!(store.upsert_node(tagged).await.unwrap(), UpsertOutcome::Updated);

    let stored = store.get_node(&db.id).await.unwrap().unwrap();
    assert_eq!(stored.tags.get("environment").map(String::as_str), Some("production"));

    let by_native = store
        .get_node_by_native_id("111", &Provider::new("aws"), "db-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_native.id, db.id);
    assert!(store.get_node(&NodeId::new("nope")).await.unwrap().is_none());
}

async fn dangling_edge_is_rejected(store: &dyn GraphStorage) {
    let a = node("a", ResourceType::Compute);
    store.upsert_node(a.clone()).await.unwrap();
    let edge = GraphEdge::new(a.id.clone(), RelationshipType::DependsOn, NodeId::new("ghost"));
    let err = store.upsert_edge(edge).await.unwrap_err();
    assert!(matches!(err, StoreError::DanglingEdge { .. }));
}

async fn queries_filter_and_page_in_id_order(store: &dyn GraphStorage) {
    for native in ["c", "a", "e", "b", "d"] {
        store.upsert_node(node(native, ResourceType::Compute)).await.unwrap();
    }
    store
        .upsert_node(node("orders", ResourceType::Database).with_tag("team", "payments"))
        .await
        .unwrap();

    let compute = NodeFilter::new().resource_type(ResourceType::Compute);
    let all = store.query_nodes(&compute, &Pagination::all()).await.unwrap();
    let ids: Vec<String> = all.items.iter().map(|n| n.id.to_string()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert_eq!(all.total, 5);

    let first = store.query_nodes(&compute, &Pagination::offset(0, 2)).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let cursor = first.next_cursor.clone().unwrap();
    let second = store.query_nodes(&compute, &Pagination::after(cursor, 10)).await.unwrap();
    assert_eq!(second.items.len(), 3);
    assert!(second.next_cursor.is_none());

    let tagged = store
        .query_nodes(&NodeFilter::new().tag("team", "payments"), &Pagination::all())
        .await
        .unwrap();
    assert_eq!(tagged.items.len(), 1);
    let named = store
        .query_nodes(&NodeFilter::new().name_contains("ORD"), &Pagination::all())
        .await
        .unwrap();
    assert_eq!(named.items[0].name, "orders");
}

async fn delete_node_removes_touching_edges(store: &dyn GraphStorage) {
    let (a, b, c) = (
        node("a", ResourceType::Compute),
        node("b", ResourceType::Compute),
        node("c", ResourceType::Compute),
    );
    for n in [&a, &b, &c] {
        store.upsert_node(n.clone()).await.unwrap();
    }
    let ab = GraphEdge::new(a.id.clone(), RelationshipType::ConnectsTo, b.id.clone());
    let bc = GraphEdge::new(b.id.clone(), RelationshipType::ConnectsTo, c.id.clone());
    let ac = GraphEdge::new(a.id.clone(), RelationshipType::ConnectsTo, c.id.clone());
    store.upsert_edges(vec![ab.clone(), bc.clone(), ac.clone()]).await.unwrap();

    let touching_b = store
        .query_edges(&EdgeFilter::new().touching(b.id.clone()), &Pagination::all())
        .await
        .unwrap();
    assert_eq!(touching_b.items.len(), 2);

    assert!(store.delete_node(&b.id).await.unwrap());
    assert!(!store.delete_node(&b.id).await.unwrap());
    assert!(store.get_edge(&ab.id).await.unwrap().is_none());
    assert!(store.get_edge(&bc.id).await.unwrap().is_none());
    assert!(store.get_edge(&ac.id).await.unwrap().is_some());
}

async fn disappeared_is_a_status_not_a_delete(store: &dyn GraphStorage) {
    let gone = node("gone", ResourceType::Compute).with_status(NodeStatus::Disappeared);
    store.upsert_node(gone.clone()).await.unwrap();
    assert!(store.get_node(&gone.id).await.unwrap().is_some());

    let active = store
        .query_nodes(&NodeFilter::new().active_only(), &Pagination::all())
        .await
        .unwrap();
    assert!(active.items.is_empty());
}

async fn versions_are_ordered_and_prunable(store: &dyn GraphStorage) {
    let n = node("v", ResourceType::Compute);
    for (version, at) in [(1, 100), (2, 200), (3, 300)] {
        store
            .append_node_version(NodeVersion {
                node_id: n.id.clone(),
                version,
                recorded_at: at,
                change: if version == 1 { ChangeKind::Created } else { ChangeKind::Updated },
                node: n.clone(),
            })
            .await
            .unwrap();
    }
    let chain = store.node_versions(&n.id).await.unwrap();
    assert_eq!(chain.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(store.node_versions_until(200).await.unwrap().len(), 2);

    assert_eq!(store.prune_versions_before(200).await.unwrap(), 1);
    let chain = store.node_versions(&n.id).await.unwrap();
    assert_eq!(chain.first().map(|v| v.version), Some(2));
}

async fn snapshots_round_trip(store: &dyn GraphStorage) {
    let n = node("s", ResourceType::Storage);
    for id in [1, 2] {
        store
            .save_snapshot(&Snapshot {
                id: SnapshotId(id),
                taken_at: id * 1_000,
                nodes: vec![n.clone()],
                edges: Vec::new(),
            })
            .await
            .unwrap();
    }
    let listed = store.list_snapshots().await.unwrap();
    assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![SnapshotId(1), SnapshotId(2)]);
    assert_eq!(listed[0].node_count, 1);

    let loaded = store.get_snapshot(SnapshotId(2)).await.unwrap().unwrap();
    assert_eq!(loaded.nodes, vec![n]);
    assert!(store.delete_snapshot(SnapshotId(1)).await.unwrap());
    assert!(store.get_snapshot(SnapshotId(1)).await.unwrap().is_none());
}

async fn sync_records_and_meta(store: &dyn GraphStorage) {
    for (id, adapter, started_at) in [("r2", "aws", 20), ("r1", "aws", 10), ("r3", "gcp", 30)] {
        store
            .save_sync_record(&SyncRecord {
                id: id.into(),
                adapter_id: adapter.into(),
                tenant_id: TenantId::default(),
                started_at,
                finished_at: started_at + 1,
                created: 1,
                updated: 0,
                disappeared: 0,
                unchanged: 0,
                errors: Vec::new(),
                complete: true,
                cancelled: false,
            })
            .await
            .unwrap();
    }
    let aws = store.list_sync_records(Some("aws")).await.unwrap();
    assert_eq!(aws.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
    assert_eq!(store.list_sync_records(None).await.unwrap().len(), 3);

    store.put_meta("x:2", b"two").await.unwrap();
    store.put_meta("x:1", b"one").await.unwrap();
    store.put_meta("y:1", b"other").await.unwrap();
    assert_eq!(store.get_meta("x:1").await.unwrap(), Some(b"one".to_vec()));
    let scanned = store.scan_meta_prefix("x:").await.unwrap();
    assert_eq!(
        scanned,
        vec![("x:1".to_string(), b"one".to_vec()), ("x:2".to_string(), b"two".to_vec())]
    );
}

/// 32 snapshots taken at once get 32 distinct ids, and all of them are stored.
async fn concurrent_snapshots_get_distinct_ids(store: Arc<dyn GraphStorage>) {
    store.upsert_node(node("db-1", ResourceType::Database)).await.unwrap();
    let temporal = Arc::new(TemporalStore::new(store));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..32 {
        let temporal = Arc::clone(&temporal);
        tasks.spawn(async move { temporal.take_snapshot().await.unwrap().id });
    }
    let mut ids = Vec::new();
    while let Some(id) = tasks.join_next().await {
        ids.push(id.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 32);
    assert_eq!(temporal.list_snapshots().await.unwrap().len(), 32);

    // Plain counters too.
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let storage = Arc::clone(temporal.storage());
        tasks.spawn(async move { storage.next_sequence("counter").await.unwrap() });
    }
    let mut seen = Vec::new();
    while let Some(n) = tasks.join_next().await {
        seen.push(n.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=16).collect::<Vec<u64>>());
}

/// 100 nodes, 5 production databases; the IQL result is exactly those five.
async fn iql_find_is_backend_independent(store: &dyn GraphStorage) {
    let mut expected = Vec::new();
    for i in 0..100 {
        let resource_type = if i % 4 == 0 { ResourceType::Database } else { ResourceType::Compute };
        let environment = if i % 20 == 0 { "production" } else { "staging" };
        let n = node(&format!("r-{i:03}"), resource_type).with_tag("environment", environment);
        if resource_type == ResourceType::Database && environment == "production" {
            expected.push(n.id.clone());
        }
        store.upsert_node(n).await.unwrap();
    }
    expected.sort();
    assert_eq!(expected.len(), 5);

    let result = iql::query(
        store,
        r#"FIND node WHERE resource_type = "database" AND tags.environment = "production""#,
    )
    .await
    .unwrap();
    let QueryResult::Nodes(nodes) = result else {
        panic!("expected a node result");
    };
    assert_eq!(nodes.into_iter().map(|n| n.id).collect::<Vec<_>>(), expected);
}

// ---------------------------------------------------------------------------
// Instantiation
// ---------------------------------------------------------------------------

macro_rules! storage_contract {
    ($backend:ident, $open:ident) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            async fn upsert_reports_outcomes() {
                let (_dir, store) = $open().await;
                super::upsert_reports_outcomes(store.as_ref()).await;
            }

            #[tokio::test]
            async fn dangling_edge_is_rejected() {
                let (_dir, store) = $open().await;
                super::dangling_edge_is_rejected(store.as_ref()).await;
            }

            #[tokio::test]
            async fn queries_filter_and_page_in_id_order() {
                let (_dir, store) = $open().await;
                super::queries_filter_and_page_in_id_order(store.as_ref()).await;
            }

            #[tokio::test]
            async fn delete_node_removes_touching_edges() {
                let (_dir, store) = $open().await;
                super::delete_node_removes_touching_edges(store.as_ref()).await;
            }

            #[tokio::test]
            async fn disappeared_is_a_status_not_a_delete() {
                let (_dir, store) = $open().await;
                super::disappeared_is_a_status_not_a_delete(store.as_ref()).await;
            }

            #[tokio::test]
            async fn versions_are_ordered_and_prunable() {
                let (_dir, store) = $open().await;
                super::versions_are_ordered_and_prunable(store.as_ref()).await;
            }

            #[tokio::test]
            async fn snapshots_round_trip() {
                let (_dir, store) = $open().await;
                super::snapshots_round_trip(store.as_ref()).await;
            }

            #[tokio::test]
            async fn sync_records_and_meta() {
                let (_dir, store) = $open().await;
                super::sync_records_and_meta(store.as_ref()).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn concurrent_snapshots_get_distinct_ids() {
                let (_dir, store) = $open().await;
                super::concurrent_snapshots_get_distinct_ids(store).await;
            }

            #[tokio::test]
            async fn iql_find_is_backend_independent() {
                let (_dir, store) = $open().await;
                super::iql_find_is_backend_independent(store.as_ref()).await;
            }
        }
    };
}

storage_contract!(mem, open_mem);
storage_contract!(durable, open_redb);
storage_contract!(sqlite, open_sqlite);
