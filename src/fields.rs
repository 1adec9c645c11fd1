//! Dotted-path field resolution over nodes, edges and metadata bags.
//!
//! Queries and adapters address fields as `resourceType`, `tags.environment`
//! or `metadata.engine.version`. Static fields are resolved by name; the open
//! metadata bag is walked segment by segment with [`resolve_path`], which
//! distinguishes "not there" from "there, but not a container".

use std::fmt;

use serde_json::Value;

use crate::model::{GraphEdge, GraphNode, Metadata};

/// Outcome of walking a path through a metadata bag.
#[derive(Debug, Clone, PartialEq)]
pub enum PathLookup<'a> {
    Found(&'a Value),
    /// A segment named a key or index that does not exist.
    NotFound { segment: String },
    /// A segment tried to descend into a scalar value.
    WrongType { segment: String, found: &'static str },
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk `path` through `metadata`. Numeric segments index into arrays.
pub fn resolve_path<'a, S: AsRef<str>>(metadata: &'a Metadata, path: &[S]) -> PathLookup<'a> {
    let Some((first, rest)) = path.split_first() else {
        return PathLookup::NotFound {
            segment: String::new(),
        };
    };
    let Some(mut current) = metadata.get(first.as_ref()) else {
        return PathLookup::NotFound {
            segment: first.as_ref().to_string(),
        };
    };

    for segment in rest {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => {
                    return PathLookup::NotFound {
                        segment: segment.to_string(),
                    };
                }
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => {
                    return PathLookup::NotFound {
                        segment: segment.to_string(),
                    };
                }
            },
            other => {
                return PathLookup::WrongType {
                    segment: segment.to_string(),
                    found: json_kind(other),
                };
            }
        };
    }
    PathLookup::Found(current)
}

/// A resolved field value, loosely typed.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    /// Present but null (e.g. an unset `owner`).
    Null,
    /// Arrays and objects from metadata.
    Json(Value),
    /// The field or path does not exist on this entity.
    Missing,
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
            Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Json(other.clone()),
        }
    }

    fn from_lookup(lookup: PathLookup<'_>) -> Self {
        match lookup {
            PathLookup::Found(v) => FieldValue::from_json(v),
            PathLookup::NotFound { .. } | PathLookup::WrongType { .. } => FieldValue::Missing,
        }
    }

    /// Group key used by summaries.
    pub fn group_key(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null | FieldValue::Missing => "(none)".to_string(),
            FieldValue::Json(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.group_key())
    }
}

/// Static type of a field, used to type-check queries before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    /// Tag and metadata paths: typed only at the point of use.
    Dynamic,
}

/// Canonical form of a field name: lowercase with `_` removed, so that
/// `resourceType`, `resource_type` and `RESOURCETYPE` all match.
fn canonical(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Static kind of a node field path, or `None` when the field is unknown.
pub fn node_field_kind<S: AsRef<str>>(path: &[S]) -> Option<FieldKind> {
    let (head, rest) = path.split_first()?;
    match (canonical(head.as_ref()).as_str(), rest.len()) {
        ("tags" | "tag", 1) | ("metadata" | "meta", 1..) => Some(FieldKind::Dynamic),
        (
            "id" | "name" | "provider" | "resourcetype" | "type" | "nativeid" | "region"
            | "account" | "status" | "owner" | "tenant" | "tenantid",
            0,
        ) => Some(FieldKind::Text),
        (
            "costmonthly" | "cost" | "discoveredat" | "createdat" | "updatedat" | "lastseenat",
            0,
        ) => Some(FieldKind::Number),
        _ => None,
    }
}

/// Static kind of an edge field path, or `None` when the field is unknown.
pub fn edge_field_kind<S: AsRef<str>>(path: &[S]) -> Option<FieldKind> {
    let (head, rest) = path.split_first()?;
    match (canonical(head.as_ref()).as_str(), rest.len()) {
        ("metadata" | "meta", 1..) => Some(FieldKind::Dynamic),
        (
            "id" | "source" | "sourcenodeid" | "target" | "targetnodeid" | "relationshiptype"
            | "relationship" | "type" | "discoveredvia" | "tenant" | "tenantid",
            0,
        ) => Some(FieldKind::Text),
        ("confidence" | "createdat" | "lastseenat", 0) => Some(FieldKind::Number),
        _ => None,
    }
}

/// Resolve a field path on a node. Unknown fields resolve to `Missing`;
/// callers validate with [`node_field_kind`] first.
pub fn resolve_node_field<S: AsRef<str>>(node: &GraphNode, path: &[S]) -> FieldValue {
    let Some((head, rest)) = path.split_first() else {
        return FieldValue::Missing;
    };
    let text = |s: &str| FieldValue::Text(s.to_string());
    match canonical(head.as_ref()).as_str() {
        "tags" | "tag" => match rest {
            [key] => node
                .tags
                .get(key.as_ref())
                .map(|v| text(v))
                .unwrap_or(FieldValue::Missing),
            _ => FieldValue::Missing,
        },
        "metadata" | "meta" => FieldValue::from_lookup(resolve_path(&node.metadata, rest)),
        _ if !rest.is_empty() => FieldValue::Missing,
        "id" => text(node.id.as_str()),
        "name" => text(&node.name),
        "provider" => text(node.provider.as_str()),
        "resourcetype" | "type" => text(node.resource_type.as_str()),
        "nativeid" => text(&node.native_id),
        "region" => text(&node.region),
        "account" => text(&node.account),
        "status" => text(node.status.as_str()),
        "tenant" | "tenantid" => text(node.tenant_id.as_str()),
        "owner" => node.owner.as_deref().map(text).unwrap_or(FieldValue::Null),
        "costmonthly" | "cost" => node.cost_monthly.map(FieldValue::Number).unwrap_or(FieldValue::Null),
        "discoveredat" => FieldValue::Number(node.discovered_at as f64),
        "createdat" => FieldValue::Number(node.created_at as f64),
        "updatedat" => FieldValue::Number(node.updated_at as f64),
        "lastseenat" => FieldValue::Number(node.last_seen_at as f64),
        _ => FieldValue::Missing,
    }
}

/// Resolve a field path on an edge.
pub fn resolve_edge_field<S: AsRef<str>>(edge: &GraphEdge, path: &[S]) -> FieldValue {
    let Some((head, rest)) = path.split_first() else {
        return FieldValue::Missing;
    };
    let text = |s: &str| FieldValue::Text(s.to_string());
    match canonical(head.as_ref()).as_str() {
        "metadata" | "meta" => FieldValue::from_lookup(resolve_path(&edge.metadata, rest)),
        _ if !rest.is_empty() => FieldValue::Missing,
        "id" => text(edge.id.as_str()),
        "source" | "sourcenodeid" => text(edge.source_node_id.as_str()),
        "target" | "targetnodeid" => text(edge.target_node_id.as_str()),
        "relationshiptype" | "relationship" | "type" => text(edge.relationship_type.as_str()),
        "discoveredvia" => text(edge.discovered_via.as_str()),
        "tenant" | "tenantid" => text(edge.tenant_id.as_str()),
        "confidence" => FieldValue::Number(edge.confidence),
        "createdat" => FieldValue::Number(edge.created_at as f64),
        "lastseenat" => FieldValue::Number(edge.last_seen_at as f64),
        _ => FieldValue::Missing,
    }
}
