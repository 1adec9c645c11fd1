//! Benchmarks for IQL and graph traversal.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use infragraph::graph::{self, GraphView};
use infragraph::iql;
use infragraph::model::{GraphEdge, GraphNode, RelationshipType, ResourceType};
use infragraph::store::{GraphStorage, MemStore};

const QUERY: &str =
    r#"FIND database WHERE tags.environment = "production" AND (cost > 100 OR name MATCHES "^db-[0-9]+$") LIMIT 50"#;

/// A layered graph: each node depends on the next two.
fn layered(n: usize) -> (Vec<GraphNode>, Vec<GraphEdge>) {
    let types = [ResourceType::Compute, ResourceType::Database, ResourceType::Storage];
    let nodes: Vec<GraphNode> = (0..n)
        .map(|i| {
            GraphNode::new("aws", "111", "us-east-1", types[i % types.len()], format!("db-{i}"), format!("db-{i}"))
                .with_tag("environment", if i % 2 == 0 { "production" } else { "staging" })
                .with_cost((i % 300) as f64)
        })
        .collect();
    let edges = (0..n)
        .flat_map(|i| [i + 1, i + 2].into_iter().filter(move |&j| j < n).map(move |j| (i, j)))
        .map(|(i, j)| GraphEdge::new(nodes[i].id.clone(), RelationshipType::DependsOn, nodes[j].id.clone()))
        .collect();
    (nodes, edges)
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("iql_parse", |bench| bench.iter(|| black_box(iql::parse(black_box(QUERY)).unwrap())));
}

fn bench_find(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemStore::new();
    let (nodes, edges) = layered(10_000);
    rt.block_on(async {
        store.upsert_nodes(nodes).await.unwrap();
        store.upsert_edges(edges).await.unwrap();
    });

    c.bench_function("iql_find_10k", |bench| {
        bench.iter(|| black_box(rt.block_on(iql::query(&store, QUERY)).unwrap()))
    });
}

fn bench_traversal(c: &mut Criterion) {
    let (nodes, edges) = layered(10_000);
    let first = nodes[0].id.clone();
    let last = nodes[nodes.len() - 1].id.clone();
    let view = GraphView::from_parts(nodes, edges);

    c.bench_function("shortest_path_10k", |bench| {
        bench.iter(|| black_box(graph::shortest_path(&view, &first, &last).unwrap()))
    });
    c.bench_function("blast_radius_10k", |bench| {
        bench.iter(|| black_box(graph::upstream(&view, &last, None).unwrap()))
    });
    c.bench_function("single_points_of_failure_10k", |bench| {
        bench.iter(|| black_box(graph::find_single_points_of_failure(&view)))
    });
}

criterion_group!(benches, bench_parse, bench_find, bench_traversal);
criterion_main!(benches);
