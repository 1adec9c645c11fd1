//! Export types for handing the graph to other tools.
//!
//! Both exports are pure read-only transforms of a [`GraphView`] and
//! serialize with `serde_json`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::GraphView;
use crate::model::{GraphEdge, GraphNode, Timestamp, now_millis};

/// Exported node: identity fields plus tags, without metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExport {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub resource_type: String,
    pub region: String,
    pub account: String,
    pub status: String,
    pub tenant_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub cost_monthly: Option<f64>,
}

impl From<&GraphNode> for NodeExport {
    fn from(node: &GraphNode) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name.clone(),
            provider: node.provider.to_string(),
            resource_type: node.resource_type.as_str().to_string(),
            region: node.region.clone(),
            account: node.account.clone(),
            status: node.status.as_str().to_string(),
            tenant_id: node.tenant_id.to_string(),
            tags: node.tags.clone(),
            cost_monthly: node.cost_monthly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeExport {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relationship: String,
    /// Confidence score in `[0, 1]`.
    pub confidence: f64,
    pub discovered_via: String,
}

impl From<&GraphEdge> for EdgeExport {
    fn from(edge: &GraphEdge) -> Self {
        Self {
            id: edge.id.to_string(),
            source: edge.source_node_id.to_string(),
            target: edge.target_node_id.to_string(),
            relationship: edge.relationship_type.as_str().to_string(),
            confidence: edge.confidence,
            discovered_via: edge.discovered_via.as_str().to_string(),
        }
    }
}

/// Generic node/edge interchange document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExport {
    pub exported_at: Timestamp,
    pub nodes: Vec<NodeExport>,
    pub edges: Vec<EdgeExport>,
}

impl GraphExport {
    pub fn from_graph(view: &GraphView) -> Self {
        Self {
            exported_at: now_millis(),
            nodes: view.nodes().map(NodeExport::from).collect(),
            edges: view.edges().map(EdgeExport::from).collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Node in a force-directed layout; `group` is the resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceNode {
    pub id: String,
    pub label: String,
    pub group: String,
}

/// Link in a force-directed layout; `value` is the edge confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceLink {
    pub source: String,
    pub target: String,
    pub value: f64,
    pub kind: String,
}

/// `{ nodes, links }` document in the shape d3-force style renderers expect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForceLayoutExport {
    pub nodes: Vec<ForceNode>,
    pub links: Vec<ForceLink>,
}

impl ForceLayoutExport {
    pub fn from_graph(view: &GraphView) -> Self {
        let nodes = view
            .nodes()
            .map(|n| ForceNode {
                id: n.id.to_string(),
                label: n.name.clone(),
                group: n.resource_type.as_str().to_string(),
            })
            .collect();
        let links = view
            .edges()
            .map(|e| ForceLink {
                source: e.source_node_id.to_string(),
                target: e.target_node_id.to_string(),
                value: e.confidence,
                kind: e.relationship_type.as_str().to_string(),
            })
            .collect();
        Self { nodes, links }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
