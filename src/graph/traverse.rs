//! Breadth-first traversal: shortest paths and reachability.

use std::collections::{BTreeSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, RelationshipType};

use super::view::GraphView;
use super::GraphResult;

/// Outcome of a shortest-path search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum PathResult {
    /// Node ids from source to target, both included.
    Found(Vec<NodeId>),
    Unreachable,
}

impl PathResult {
    /// Number of edges on the path.
    pub fn hops(&self) -> Option<usize> {
        match self {
            PathResult::Found(path) => Some(path.len().saturating_sub(1)),
            PathResult::Unreachable => None,
        }
    }
}

/// Sorted successor (or predecessor) indexes of `idx`, optionally restricted
/// to some relationships.
fn step(
    view: &GraphView,
    idx: NodeIndex,
    dir: Direction,
    follow: Option<&dyn Fn(RelationshipType) -> bool>,
) -> Vec<NodeIndex> {
    let mut next: Vec<NodeIndex> = view
        .graph()
        .edges_directed(idx, dir)
        .filter(|e| follow.is_none_or(|f| f(e.weight().relationship_type)))
        .map(|e| match dir {
            Direction::Outgoing => e.target(),
            Direction::Incoming => e.source(),
        })
        .collect();
    next.sort();
    next.dedup();
    next
}

/// Unweighted shortest directed path from `from` to `to`.
///
/// Among equally short paths the one whose nodes were discovered first wins;
/// since successors are expanded in id order that is the path through the
/// lowest ids.
pub fn shortest_path(view: &GraphView, from: &NodeId, to: &NodeId) -> GraphResult<PathResult> {
    let start = view.index_of(from)?;
    let goal = view.index_of(to)?;
    if start == goal {
        return Ok(PathResult::Found(vec![from.clone()]));
    }

    let mut prev: Vec<Option<NodeIndex>> = vec![None; view.node_count()];
    let mut seen = vec![false; view.node_count()];
    seen[start.index()] = true;
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        for next in step(view, current, Direction::Outgoing, None) {
            if seen[next.index()] {
                continue;
            }
            seen[next.index()] = true;
            prev[next.index()] = Some(current);
            if next == goal {
                let mut path = vec![view.graph()[goal].id.clone()];
                let mut cursor = goal;
                while let Some(p) = prev[cursor.index()] {
                    path.push(view.graph()[p].id.clone());
                    cursor = p;
                }
                path.reverse();
                return Ok(PathResult::Found(path));
            }
            queue.push_back(next);
        }
    }
    Ok(PathResult::Unreachable)
}

fn reachable(
    view: &GraphView,
    seed: &NodeId,
    dir: Direction,
    follow: Option<&dyn Fn(RelationshipType) -> bool>,
) -> GraphResult<BTreeSet<NodeId>> {
    let start = view.index_of(seed)?;
    let mut seen = vec![false; view.node_count()];
    seen[start.index()] = true;
    let mut queue = VecDeque::from([start]);
    let mut out = BTreeSet::new();

    while let Some(current) = queue.pop_front() {
        for next in step(view, current, dir, follow) {
            if !seen[next.index()] {
                seen[next.index()] = true;
                out.insert(view.graph()[next].id.clone());
                queue.push_back(next);
            }
        }
    }
    Ok(out)
}

/// Every node reachable from `seed` along outgoing edges, excluding `seed`.
pub fn downstream(
    view: &GraphView,
    seed: &NodeId,
    follow: Option<&dyn Fn(RelationshipType) -> bool>,
) -> GraphResult<BTreeSet<NodeId>> {
    reachable(view, seed, Direction::Outgoing, follow)
}

/// Every node that reaches `seed` along outgoing edges, excluding `seed`.
pub fn upstream(
    view: &GraphView,
    seed: &NodeId,
    follow: Option<&dyn Fn(RelationshipType) -> bool>,
) -> GraphResult<BTreeSet<NodeId>> {
    reachable(view, seed, Direction::Incoming, follow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::graph::is_dependency;
    use crate::model::{GraphEdge, GraphNode, ResourceType};

    fn node(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, native, native)
    }

    fn edge(a: &GraphNode, rel: RelationshipType, b: &GraphNode) -> GraphEdge {
        GraphEdge::new(a.id.clone(), rel, b.id.clone())
    }

    #[test]
    fn chain_path_and_unreachable() {
        let (a, b, c, d) = (node("a"), node("b"), node("c"), node("d"));
        let view = GraphView::from_parts(
            vec![a.clone(), b.clone(), c.clone(), d.clone()],
            vec![
                edge(&a, RelationshipType::DependsOn, &b),
                edge(&b, RelationshipType::DependsOn, &c),
            ],
        );
        assert_eq!(
            shortest_path(&view, &a.id, &c.id).unwrap(),
            PathResult::Found(vec![a.id.clone(), b.id.clone(), c.id.clone()])
        );
        assert_eq!(shortest_path(&view, &a.id, &d.id).unwrap(), PathResult::Unreachable);
        assert_eq!(shortest_path(&view, &c.id, &a.id).unwrap(), PathResult::Unreachable);
    }

    #[test]
    fn ties_resolve_to_lowest_id() {
        let (a, m1, m2, z) = (node("a"), node("m1"), node("m2"), node("z"));
        let view = GraphView::from_parts(
            vec![z.clone(), m2.clone(), m1.clone(), a.clone()],
            vec![
                edge(&a, RelationshipType::Uses, &m2),
                edge(&a, RelationshipType::Uses, &m1),
                edge(&m2, RelationshipType::Uses, &z),
                edge(&m1, RelationshipType::Uses, &z),
            ],
        );
        let path = shortest_path(&view, &a.id, &z.id).unwrap();
        assert_eq!(path, PathResult::Found(vec![a.id.clone(), m1.id.clone(), z.id.clone()]));
        assert_eq!(path.hops(), Some(2));
    }

    #[test]
    fn path_to_self_has_no_hops() {
        let a = node("a");
        let view = GraphView::from_parts(vec![a.clone()], vec![]);
        assert_eq!(shortest_path(&view, &a.id, &a.id).unwrap().hops(), Some(0));
    }

    #[test]
    fn unknown_endpoint_is_an_error() {
        let view = GraphView::from_parts(vec![node("a")], vec![]);
        let err = shortest_path(&view, &node("a").id, &NodeId::new("x")).unwrap_err();
        assert!(matches!(err, GraphError::NodeNotFound { .. }));
    }

    #[test]
    fn reachability_respects_relationship_filter() {
        let (app, db, vpc) = (node("app"), node("db"), node("vpc"));
        let view = GraphView::from_parts(
            vec![app.clone(), db.clone(), vpc.clone()],
            vec![
                edge(&app, RelationshipType::DependsOn, &db),
                edge(&vpc, RelationshipType::Contains, &app),
            ],
        );
        let deps = downstream(&view, &vpc.id, Some(&is_dependency)).unwrap();
        assert!(deps.is_empty());
        let all = downstream(&view, &vpc.id, None).unwrap();
        assert_eq!(all.len(), 2);
        let users = upstream(&view, &db.id, Some(&is_dependency)).unwrap();
        assert_eq!(users.into_iter().collect::<Vec<_>>(), vec![app.id]);
    }
}
