//! Petgraph-backed adjacency view of a node/edge subgraph.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::GraphError;
use crate::model::{GraphEdge, GraphNode, NodeId};
use crate::store::{EdgeFilter, GraphStorage, NodeFilter, Pagination, StoreResult};

use super::GraphResult;

/// Directed graph of nodes and the edges between them.
///
/// Edges whose endpoints are not both in the node set are dropped; the view
/// only ever describes the subgraph it was built from.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    graph: DiGraph<GraphNode, GraphEdge>,
    index: HashMap<NodeId, NodeIndex>,
}

impl GraphView {
    /// Build a view from nodes and edges in any order.
    pub fn from_parts(mut nodes: Vec<GraphNode>, mut edges: Vec<GraphEdge>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.dedup_by(|a, b| a.id == b.id);
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let id = node.id.clone();
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }
        for edge in edges {
            let (Some(&src), Some(&dst)) = (
                index.get(&edge.source_node_id),
                index.get(&edge.target_node_id),
            ) else {
                continue;
            };
            graph.add_edge(src, dst, edge);
        }
        Self { graph, index }
    }

    /// Load every node matching `filter` and the edges among them.
    ///
    /// Edges are restricted to the filter's tenant, if it names one.
    pub async fn load(storage: &dyn GraphStorage, filter: &NodeFilter) -> StoreResult<Self> {
        let nodes = storage.query_nodes(filter, &Pagination::all()).await?.items;
        let mut edge_filter = EdgeFilter::new();
        if let Some(tenant) = &filter.tenant_id {
            edge_filter = edge_filter.tenant(tenant.clone());
        }
        let edges = storage.query_edges(&edge_filter, &Pagination::all()).await?.items;
        tracing::debug!(nodes = nodes.len(), edges = edges.len(), "graph view loaded");
        Ok(Self::from_parts(nodes, edges))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.graph.edge_indices().map(move |idx| &self.graph[idx])
    }

    pub(crate) fn graph(&self) -> &DiGraph<GraphNode, GraphEdge> {
        &self.graph
    }

    pub(crate) fn index_of(&self, id: &NodeId) -> GraphResult<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound {
                node_id: id.to_string(),
            })
    }

    /// Edges leaving `id`, in edge id order.
    pub fn outgoing(&self, id: &NodeId) -> GraphResult<Vec<&GraphEdge>> {
        self.edges_directed(id, Direction::Outgoing)
    }

    /// Edges entering `id`, in edge id order.
    pub fn incoming(&self, id: &NodeId) -> GraphResult<Vec<&GraphEdge>> {
        self.edges_directed(id, Direction::Incoming)
    }

    fn edges_directed(&self, id: &NodeId, dir: Direction) -> GraphResult<Vec<&GraphEdge>> {
        let idx = self.index_of(id)?;
        let mut edges: Vec<&GraphEdge> = self.graph.edges_directed(idx, dir).map(|e| e.weight()).collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(edges)
    }

    /// Ids of nodes adjacent to `id` in either direction, sorted, without
    /// duplicates or `id` itself.
    pub fn neighbors(&self, id: &NodeId) -> GraphResult<Vec<NodeId>> {
        let idx = self.index_of(id)?;
        let mut out: Vec<NodeIndex> = self
            .graph
            .neighbors_undirected(idx)
            .filter(|n| *n != idx)
            .collect();
        out.sort();
        out.dedup();
        Ok(out.into_iter().map(|n| self.graph[n].id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationshipType, ResourceType};

    fn node(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
    }

    #[test]
    fn drops_edges_with_missing_endpoints() {
        let a = node("a");
        let b = node("b");
        let ghost = node("ghost");
        let edges = vec![
            GraphEdge::new(a.id.clone(), RelationshipType::Uses, b.id.clone()),
            GraphEdge::new(a.id.clone(), RelationshipType::Uses, ghost.id.clone()),
        ];
        let view = GraphView::from_parts(vec![b, a.clone()], edges);
        assert_eq!(view.node_count(), 2);
        assert_eq!(view.edge_count(), 1);
        assert_eq!(view.outgoing(&a.id).unwrap().len(), 1);
    }

    #[test]
    fn nodes_iterate_in_id_order() {
        let view = GraphView::from_parts(vec![node("c"), node("a"), node("b")], vec![]);
        let names: Vec<&str> = view.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_node_is_an_error() {
        let view = GraphView::from_parts(vec![node("a")], vec![]);
        assert!(matches!(
            view.neighbors(&NodeId::new("nope")),
            Err(GraphError::NodeNotFound { .. })
        ));
    }
}
