//! Graph analytics: orphans, single points of failure, and clusters.
//!
//! All functions operate on a [`GraphView`] and return results in a
//! deterministic order (by relevance, then by lowest node id).

use std::collections::BTreeMap;

use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, RelationshipType};

use super::view::GraphView;

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

/// Nodes with no edges in either direction, in id order.
pub fn find_orphans(view: &GraphView) -> Vec<NodeId> {
    let graph = view.graph();
    graph
        .node_indices()
        .filter(|&idx| graph.neighbors_undirected(idx).next().is_none())
        .map(|idx| graph[idx].id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Single points of failure
// ---------------------------------------------------------------------------

/// A node whose removal splits its connected component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePointOfFailure {
    pub node_id: NodeId,
    /// Nodes cut off from the largest remaining piece when this node is removed.
    pub dependents: usize,
    /// Number of pieces the component falls into.
    pub partitions: usize,
    /// `dependents` relative to the rest of the component, in `[0, 1]`.
    pub criticality: f64,
}

/// Undirected adjacency by node index, deduplicated, without self-loops.
fn undirected_adjacency(view: &GraphView) -> Vec<Vec<usize>> {
    let graph = view.graph();
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); graph.node_count()];
    for edge in graph.edge_references() {
        let (a, b) = (edge.source().index(), edge.target().index());
        if a != b {
            adj[a].push(b);
            adj[b].push(a);
        }
    }
    for list in &mut adj {
        list.sort_unstable();
        list.dedup();
    }
    adj
}

/// Articulation points of the undirected graph, weighted by how many nodes
/// each one strands. Sorted by dependents (desc), then node id.
pub fn find_single_points_of_failure(view: &GraphView) -> Vec<SinglePointOfFailure> {
    let adj = undirected_adjacency(view);
    let n = adj.len();
    const UNSEEN: usize = usize::MAX;

    let mut disc = vec![UNSEEN; n];
    let mut low = vec![0usize; n];
    let mut size = vec![1usize; n];
    // Sizes of DFS subtrees that are separated from the rest when the node goes.
    let mut separated: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut parent = vec![UNSEEN; n];
    let mut timer = 0usize;
    let mut results = Vec::new();

    for root in 0..n {
        if disc[root] != UNSEEN {
            continue;
        }
        disc[root] = timer;
        low[root] = timer;
        timer += 1;
        let mut members = vec![root];
        // (node, next neighbor position)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(&(v, i)) = stack.last() {
            if let Some(&w) = adj[v].get(i) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if disc[w] == UNSEEN {
                    parent[w] = v;
                    disc[w] = timer;
                    low[w] = timer;
                    timer += 1;
                    members.push(w);
                    stack.push((w, 0));
                } else if w != parent[v] {
                    low[v] = low[v].min(disc[w]);
                }
            } else {
                stack.pop();
                if let Some(&(p, _)) = stack.last() {
                    low[p] = low[p].min(low[v]);
                    size[p] += size[v];
                    if p == root || low[v] >= disc[p] {
                        separated[p].push(size[v]);
                    }
                }
            }
        }

        let component = members.len();
        for v in members {
            let is_cut = if v == root {
                separated[v].len() >= 2
            } else {
                !separated[v].is_empty()
            };
            if !is_cut {
                continue;
            }
            let mut pieces = separated[v].clone();
            let cut_off: usize = pieces.iter().sum();
            let rest = component - 1 - cut_off;
            if rest > 0 {
                pieces.push(rest);
            }
            let largest = pieces.iter().copied().max().unwrap_or(0);
            let dependents = component - 1 - largest;
            results.push(SinglePointOfFailure {
                node_id: view.graph()[petgraph::graph::NodeIndex::new(v)].id.clone(),
                dependents,
                partitions: pieces.len(),
                criticality: dependents as f64 / (component - 1) as f64,
            });
        }
    }

    results.sort_by(|a, b| b.dependents.cmp(&a.dependents).then_with(|| a.node_id.cmp(&b.node_id)));
    results
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// A weakly connected group of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Members in id order.
    pub members: Vec<NodeId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.binary_search(id).is_ok()
    }
}

/// Weakly connected components, optionally following only some relationship
/// types. Isolated nodes form singleton clusters. Sorted by size (desc), then
/// by lowest member id.
pub fn find_clusters(view: &GraphView, relationships: Option<&[RelationshipType]>) -> Vec<Cluster> {
    let graph = view.graph();
    let mut uf: UnionFind<usize> = UnionFind::new(graph.node_count());
    for edge in graph.edge_references() {
        let follow = relationships.is_none_or(|allowed| allowed.contains(&edge.weight().relationship_type));
        if follow {
            uf.union(edge.source().index(), edge.target().index());
        }
    }

    // Node indexes are in id order, so members come out sorted.
    let mut groups: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
    for idx in graph.node_indices() {
        groups.entry(uf.find(idx.index())).or_default().push(graph[idx].id.clone());
    }

    let mut clusters: Vec<Cluster> = groups.into_values().map(|members| Cluster { members }).collect();
    clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.members[0].cmp(&b.members[0])));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphEdge, GraphNode, ResourceType};

    fn node(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
    }

    fn link(a: &GraphNode, rel: RelationshipType, b: &GraphNode) -> GraphEdge {
        GraphEdge::new(a.id.clone(), rel, b.id.clone())
    }

    /// a - b - c - d, with e isolated and f hanging off b.
    fn sample() -> (GraphView, Vec<GraphNode>) {
        let nodes: Vec<GraphNode> = ["a", "b", "c", "d", "e", "f"].iter().map(|n| node(n)).collect();
        let edges = vec![
            link(&nodes[0], RelationshipType::DependsOn, &nodes[1]),
            link(&nodes[1], RelationshipType::DependsOn, &nodes[2]),
            link(&nodes[2], RelationshipType::Contains, &nodes[3]),
            link(&nodes[5], RelationshipType::Uses, &nodes[1]),
        ];
        (GraphView::from_parts(nodes.clone(), edges), nodes)
    }

    #[test]
    fn orphans_have_no_edges() {
        let (view, nodes) = sample();
        assert_eq!(find_orphans(&view), vec![nodes[4].id.clone()]);
    }

    #[test]
    fn articulation_points_ranked_by_dependents() {
        let (view, nodes) = sample();
        let spofs = find_single_points_of_failure(&view);
        let ids: Vec<&NodeId> = spofs.iter().map(|s| &s.node_id).collect();
        // b strands {a, f} or {c, d}: largest piece is 2, so 2 dependents.
        // c strands d only.
        assert_eq!(ids, vec![&nodes[1].id, &nodes[2].id]);
        assert_eq!(spofs[0].dependents, 2);
        assert_eq!(spofs[0].partitions, 3);
        assert_eq!(spofs[1].dependents, 1);
        assert!((spofs[1].criticality - 0.25).abs() < 1e-9);
    }

    #[test]
    fn cycle_has_no_single_point_of_failure() {
        let (a, b, c) = (node("a"), node("b"), node("c"));
        let view = GraphView::from_parts(
            vec![a.clone(), b.clone(), c.clone()],
            vec![
                link(&a, RelationshipType::ConnectsTo, &b),
                link(&b, RelationshipType::ConnectsTo, &c),
                link(&c, RelationshipType::ConnectsTo, &a),
            ],
        );
        assert!(find_single_points_of_failure(&view).is_empty());
    }

    #[test]
    fn clusters_group_connected_nodes() {
        let (view, nodes) = sample();
        let clusters = find_clusters(&view, None);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 5);
        assert_eq!(clusters[1].members, vec![nodes[4].id.clone()]);
    }

    #[test]
    fn clusters_restricted_to_relationships() {
        let (view, nodes) = sample();
        let clusters = find_clusters(&view, Some(&[RelationshipType::DependsOn][..]));
        // {a, b, c}, {d}, {e}, {f}
        assert_eq!(clusters.len(), 4);
        assert_eq!(clusters[0].members, vec![nodes[0].id.clone(), nodes[1].id.clone(), nodes[2].id.clone()]);
        assert!(clusters[0].contains(&nodes[1].id));
        assert_eq!(clusters[1].members, vec![nodes[3].id.clone()]);
    }
}
