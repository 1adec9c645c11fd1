//! Stable content hashes for change detection.
//!
//! SHA-256 over the canonical JSON form of an entity with its timestamps
//! removed. `serde_json` maps are key-ordered, so equal content always
//! serializes to equal bytes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{GraphEdge, GraphNode};

const NODE_VOLATILE: &[&str] = &["discovered_at", "created_at", "updated_at", "last_seen_at"];
const EDGE_VOLATILE: &[&str] = &["created_at", "last_seen_at"];

fn hash_without<T: Serialize>(entity: &T, volatile: &[&str]) -> String {
    let mut value = serde_json::to_value(entity).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for field in volatile {
            map.remove(*field);
        }
    }
    let canonical = serde_json::to_vec(&value).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Content hash of a node, ignoring every timestamp.
pub fn node_hash(node: &GraphNode) -> String {
    hash_without(node, NODE_VOLATILE)
}

/// Content hash of an edge, ignoring `created_at` and `last_seen_at`.
pub fn edge_hash(edge: &GraphEdge) -> String {
    hash_without(edge, EDGE_VOLATILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, ResourceType};

    fn node() -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Storage, "bucket", "bucket")
    }

    #[test]
    fn timestamps_do_not_affect_hash() {
        let a = node().observed_at(1);
        let b = node().observed_at(99);
        assert_eq!(node_hash(&a), node_hash(&b));
        assert_eq!(node_hash(&a).len(), 64);
    }

    #[test]
    fn content_changes_affect_hash() {
        let a = node();
        assert_ne!(node_hash(&a), node_hash(&a.clone().with_tag("env", "prod")));
        assert_ne!(node_hash(&a), node_hash(&a.clone().with_status(NodeStatus::Disappeared)));
    }
}
