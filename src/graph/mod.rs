//! In-memory graph algorithms over a queried subgraph.
//!
//! A [`GraphView`] is built from the nodes and edges a storage query returned
//! (not the whole backend), indexed with `petgraph`. Nodes are inserted in id
//! order, so every algorithm that walks neighbors in index order resolves ties
//! by lowest node id.
//!
//! - [`traverse`]: BFS shortest path and reachability
//! - [`analytics`]: orphans, single points of failure, clusters

pub mod analytics;
pub mod traverse;
pub mod view;

use crate::error::GraphError;
use crate::model::RelationshipType;

pub use analytics::{Cluster, SinglePointOfFailure, find_clusters, find_orphans, find_single_points_of_failure};
pub use traverse::{PathResult, downstream, shortest_path, upstream};
pub use view::GraphView;

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Relationships along which a failure propagates from target to source.
pub fn is_dependency(relationship: RelationshipType) -> bool {
    matches!(
        relationship,
        RelationshipType::DependsOn
            | RelationshipType::Uses
            | RelationshipType::ConnectsTo
            | RelationshipType::RoutesTo
            | RelationshipType::ReadsFrom
            | RelationshipType::WritesTo
            | RelationshipType::AttachedTo
            | RelationshipType::Assumes
    )
}
