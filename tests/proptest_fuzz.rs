//! Property-based tests for the query front end and the change-detection
//! helpers.
//!
//! The lexer and parser must turn any input into either a query or a clean
//! error; diffs and hashes must be stable under irrelevant changes; IQL text
//! comparisons must agree with the storage filters on mixed-case values.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;

use infragraph::iql::{self, IqlError, QueryResult, lexer};
use infragraph::model::{GraphEdge, GraphNode, NodeId, RelationshipType, ResourceType};
use infragraph::store::{GraphStorage, MemStore, NodeFilter, Pagination};
use infragraph::sync::hash::node_hash;
use infragraph::temporal::{diff_graphs, field_deltas};

// =============================================================================
// Strategies
// =============================================================================

const WORDS: &[&str] = &[
    "FIND", "SUMMARIZE", "PATH", "DIFF", "WHERE", "BY", "LIMIT", "AND", "OR", "NOT", "FROM", "TO",
    "SINCE", "CONTAINS", "MATCHES", "NULL", "TRUE", "nodes", "edges", "database", "*", "(", ")", ",",
    ".", "=", "!=", ">=", "<", "tags", "cost", "\"prod\"", "'x", "42", "-1", "1e9", "is_spof()",
];

/// Sequences of IQL-ish tokens, which reach much deeper into the parser
/// than random characters do.
fn token_soup() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS), 0..16).prop_map(|words| words.join(" "))
}

fn field() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("name".to_string()),
        Just("region".to_string()),
        Just("cost".to_string()),
        "x[a-z]{0,7}".prop_map(|k| format!("tags.{k}")),
        "x[a-z]{0,7}(\\.x[a-z]{0,7}){0,2}".prop_map(|p| format!("metadata.{p}")),
    ]
}

fn comparison() -> impl Strategy<Value = String> {
    (field(), prop::sample::select(&["=", "!=", "CONTAINS"][..]), "[a-z0-9 -]{0,12}")
        .prop_map(|(f, op, v)| format!("{f} {op} \"{v}\""))
}

/// Well-formed FIND queries over text comparisons.
fn find_query() -> impl Strategy<Value = String> {
    (
        prop::sample::select(&["nodes", "*", "compute", "databases"][..]),
        prop::collection::vec(comparison(), 1..5),
        prop::sample::select(&["AND", "OR"][..]),
        prop::option::of(0u32..500),
    )
        .prop_map(|(target, conds, joiner, limit)| {
            let mut q = format!("FIND {target} WHERE {}", conds.join(&format!(" {joiner} ")));
            if let Some(n) = limit {
                q.push_str(&format!(" LIMIT {n}"));
            }
            q
        })
}

fn graph_strategy() -> impl Strategy<Value = (Vec<GraphNode>, Vec<GraphEdge>)> {
    prop::collection::btree_map("[a-z]{1,6}", (0u32..1000, "[a-z]{0,6}"), 0..20).prop_map(|entries| {
        let nodes: Vec<GraphNode> = entries
            .into_iter()
            .map(|(native, (cost, team))| {
                GraphNode::new("gcp", "proj", "us-central1", ResourceType::Function, &native, &native)
                    .with_cost(f64::from(cost))
                    .with_tag("team", team)
            })
            .collect();
        let edges = nodes
            .windows(2)
            .map(|w| GraphEdge::new(w[0].id.clone(), RelationshipType::Uses, w[1].id.clone()))
            .collect();
        (nodes, edges)
    })
}

// =============================================================================
// Front end
// =============================================================================

proptest! {
    /// Arbitrary text never panics the lexer or parser.
    #[test]
    fn fuzz_parse_arbitrary_text(src in ".{0,200}") {
        let _ = lexer::tokenize(&src);
        let _ = iql::parse(&src);
    }

    /// Token soup either parses or fails with a position inside the input.
    #[test]
    fn fuzz_parse_token_soup(src in token_soup()) {
        match iql::parse(&src) {
            Ok(_) => {}
            Err(err @ IqlError::Syntax { .. }) => {
                let position = err.position().unwrap_or(usize::MAX);
                prop_assert!(position <= src.len(), "{src:?} -> {position}");
            }
            Err(other) => prop_assert!(false, "unexpected error kind: {other:?}"),
        }
    }

    /// Generated well-formed queries always parse.
    #[test]
    fn well_formed_find_parses(src in find_query()) {
        prop_assert!(iql::parse(&src).is_ok(), "{src}");
    }
}

// =============================================================================
// Diffs and hashes
// =============================================================================

proptest! {
    /// A graph compared with itself has no changes.
    #[test]
    fn diff_with_self_is_empty((nodes, edges) in graph_strategy()) {
        prop_assert!(diff_graphs(&nodes, &edges, &nodes, &edges).is_empty());
    }

    /// Against an empty graph everything is added, and the reverse removes it.
    #[test]
    fn diff_against_empty_adds_everything((nodes, edges) in graph_strategy()) {
        let grown = diff_graphs(&[], &[], &nodes, &edges);
        prop_assert_eq!(grown.added_nodes.len(), nodes.len());
        prop_assert_eq!(grown.added_edges.len(), edges.len());
        let shrunk = diff_graphs(&nodes, &edges, &[], &[]);
        prop_assert_eq!(shrunk.removed_nodes.len(), nodes.len());
        prop_assert!(shrunk.added_nodes.is_empty());
    }

    /// Re-observing a node at another time keeps its hash; changing a tag
    /// changes it and shows up as exactly one delta.
    #[test]
    fn hash_ignores_observation_time(
        (nodes, _) in graph_strategy(),
        t1 in 0u64..1 << 40,
        t2 in 0u64..1 << 40,
    ) {
        for node in nodes {
            let a = node.clone().observed_at(t1);
            let b = node.clone().observed_at(t2);
            prop_assert_eq!(node_hash(&a), node_hash(&b));

            let retagged = a.clone().with_tag("team", "someone-else");
            prop_assert_ne!(node_hash(&a), node_hash(&retagged));
            let deltas = field_deltas(&a, &retagged);
            prop_assert_eq!(deltas.len(), 1);
            prop_assert_eq!(deltas[0].path.as_str(), "tags.team");
        }
    }
}

// =============================================================================
// Text comparisons
// =============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

async fn tagged_store(values: &[String]) -> MemStore {
    let store = MemStore::new();
    let nodes = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let native = format!("n-{i:02}");
            GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, &native, &native).with_tag("env", v.as_str())
        })
        .collect();
    store.upsert_nodes(nodes).await.unwrap();
    store
}

async fn iql_ids(store: &MemStore, q: &str) -> Vec<NodeId> {
    match iql::query(store, q).await.unwrap() {
        QueryResult::Nodes(nodes) => nodes.into_iter().map(|n| n.id).collect(),
        other => panic!("{q}: expected nodes, got {other:?}"),
    }
}

proptest! {
    /// `=` selects exactly what the storage tag filter selects, and `>=`
    /// follows the same exact byte order, whatever the case.
    #[test]
    fn text_comparisons_agree_with_node_filter(
        values in prop::collection::vec("[a-cA-C]{1,3}", 1..12),
        wanted in "[a-cA-C]{1,3}",
    ) {
        runtime().block_on(async {
            let store = tagged_store(&values).await;
            let all = store.query_nodes(&NodeFilter::new(), &Pagination::all()).await.unwrap().items;

            let found = iql_ids(&store, &format!(r#"FIND nodes WHERE tags.env = "{wanted}""#)).await;
            let filtered: Vec<NodeId> = store
                .query_nodes(&NodeFilter::new().tag("env", wanted.as_str()), &Pagination::all())
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|n| n.id)
                .collect();
            prop_assert_eq!(&found, &filtered);

            let not_found = iql_ids(&store, &format!(r#"FIND nodes WHERE tags.env != "{wanted}""#)).await;
            prop_assert_eq!(found.len() + not_found.len(), all.len());

            let at_least = iql_ids(&store, &format!(r#"FIND nodes WHERE tags.env >= "{wanted}""#)).await;
            let expected: Vec<NodeId> = all
                .iter()
                .filter(|n| n.tags.get("env").is_some_and(|v| v.as_str() >= wanted.as_str()))
                .map(|n| n.id.clone())
                .collect();
            prop_assert_eq!(at_least, expected);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
