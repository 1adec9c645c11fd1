//! Evaluates parsed IQL against a [`GraphStorage`].
//!
//! Execution has three phases: validate the whole query (target, fields,
//! literal types, functions, regexes), precompute the graph-backed function
//! sets, then filter. Validation runs before any read, and nothing is
//! returned unless every phase succeeds.

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::Regex;
use serde::Serialize;

use crate::fields::{FieldKind, FieldValue, edge_field_kind, node_field_kind, resolve_edge_field, resolve_node_field};
use crate::graph::{self, GraphView, PathResult};
use crate::model::{GraphEdge, GraphNode, NodeId, ResourceType, TenantId};
use crate::store::{EdgeFilter, GraphStorage, NodeFilter, Pagination};
use crate::temporal::{GraphDiff, TemporalStore, diff_graphs};

use super::ast::{
    CompareOp, Condition, DiffQuery, FieldRef, FindQuery, Literal, LiteralValue, PathQuery, Query, Span,
    SummarizeQuery, Target,
};
use super::error::{IqlError, IqlResult};
use super::parser::parse;

/// Result of executing one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum QueryResult {
    Nodes(Vec<GraphNode>),
    Edges(Vec<GraphEdge>),
    Summary(Summary),
    Path(PathResult),
    Diff(GraphDiff),
}

impl QueryResult {
    /// Number of matches: entities found, entities summarized, hops on a
    /// path (0 when unreachable) or changed entities in a diff.
    pub fn match_count(&self) -> usize {
        match self {
            QueryResult::Nodes(nodes) => nodes.len(),
            QueryResult::Edges(edges) => edges.len(),
            QueryResult::Summary(summary) => summary.total,
            QueryResult::Path(path) => path.hops().unwrap_or(0),
            QueryResult::Diff(diff) => diff.change_count(),
        }
    }
}

/// Counts grouped by one or more fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub group_by: Vec<String>,
    /// Largest groups first; ties in key order.
    pub groups: Vec<SummaryGroup>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryGroup {
    pub key: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entity {
    Node,
    Edge,
}

#[derive(Debug, Clone, Copy)]
enum TargetKind {
    Nodes(Option<ResourceType>),
    Edges,
}

/// Graph functions callable in `WHERE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    IsOrphan,
    IsSpof,
    HasTag,
    ConnectedTo,
    InClusterWith,
    DependsOn,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        let canonical: String = name.chars().filter(|c| *c != '_').flat_map(char::to_lowercase).collect();
        Some(match canonical.as_str() {
            "isorphan" => Function::IsOrphan,
            "isspof" => Function::IsSpof,
            "hastag" => Function::HasTag,
            "connectedto" => Function::ConnectedTo,
            "inclusterwith" => Function::InClusterWith,
            "dependson" => Function::DependsOn,
            _ => return None,
        })
    }

    /// Accepted argument counts.
    fn arity(self) -> (usize, usize) {
        match self {
            Function::IsOrphan | Function::IsSpof => (0, 0),
            Function::HasTag => (1, 2),
            Function::ConnectedTo | Function::InClusterWith | Function::DependsOn => (1, 1),
        }
    }

    fn needs_graph(self) -> bool {
        self != Function::HasTag
    }
}

/// Per-query state built before filtering, keyed by the span start of the
/// literal or call it belongs to.
#[derive(Default)]
struct Prepared {
    regexes: HashMap<usize, Regex>,
    sets: HashMap<usize, HashSet<NodeId>>,
}

/// Runs IQL queries, optionally scoped to one tenant.
pub struct Executor<'a> {
    storage: &'a dyn GraphStorage,
    temporal: Option<&'a TemporalStore>,
    tenant: Option<TenantId>,
}

impl<'a> Executor<'a> {
    pub fn new(storage: &'a dyn GraphStorage) -> Self {
        Self {
            storage,
            temporal: None,
            tenant: None,
        }
    }

    /// Enable `DIFF` queries.
    pub fn with_temporal(mut self, temporal: &'a TemporalStore) -> Self {
        self.temporal = Some(temporal);
        self
    }

    /// Only see entities owned by `tenant`.
    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Parse and execute `src`.
    pub async fn run(&self, src: &str) -> IqlResult<QueryResult> {
        let query = parse(src)?;
        self.execute(&query, src).await
    }

    /// Execute an already parsed query. `src` is the text it was parsed
    /// from, used for diagnostics.
    pub async fn execute(&self, query: &Query, src: &str) -> IqlResult<QueryResult> {
        let result = match query {
            Query::Find(q) => self.find(q, src).await,
            Query::Summarize(q) => self.summarize(q, src).await,
            Query::Path(q) => self.path(q, src).await,
            Query::Diff(q) => self.diff(q, src).await,
        };
        match &result {
            Ok(r) => tracing::debug!(matches = r.match_count(), "iql query executed"),
            Err(e) => tracing::debug!(error = %e, "iql query failed"),
        }
        result
    }

    fn node_filter(&self) -> NodeFilter {
        match &self.tenant {
            Some(t) => NodeFilter::new().tenant(t.clone()),
            None => NodeFilter::new(),
        }
    }

    fn edge_filter(&self) -> EdgeFilter {
        match &self.tenant {
            Some(t) => EdgeFilter::new().tenant(t.clone()),
            None => EdgeFilter::new(),
        }
    }

    async fn load_view(&self) -> IqlResult<GraphView> {
        Ok(GraphView::load(self.storage, &self.node_filter().active_only()).await?)
    }

    async fn find(&self, q: &FindQuery, src: &str) -> IqlResult<QueryResult> {
        let target = resolve_target(src, &q.target)?;
        match target {
            TargetKind::Nodes(resource_type) => {
                let prepared = self.prepare(src, q.condition.as_ref(), Entity::Node).await?;
                let mut nodes = self.matching_nodes(resource_type, q.condition.as_ref(), &prepared).await?;
                if let Some(limit) = q.limit {
                    nodes.truncate(limit);
                }
                Ok(QueryResult::Nodes(nodes))
            }
            TargetKind::Edges => {
                let prepared = self.prepare(src, q.condition.as_ref(), Entity::Edge).await?;
                let mut edges = self.matching_edges(q.condition.as_ref(), &prepared).await?;
                if let Some(limit) = q.limit {
                    edges.truncate(limit);
                }
                Ok(QueryResult::Edges(edges))
            }
        }
    }

    async fn summarize(&self, q: &SummarizeQuery, src: &str) -> IqlResult<QueryResult> {
        let target = resolve_target(src, &q.target)?;
        let entity = match target {
            TargetKind::Nodes(_) => Entity::Node,
            TargetKind::Edges => Entity::Edge,
        };
        for field in &q.group_by {
            field_kind(src, field, entity)?;
        }
        let prepared = self.prepare(src, q.condition.as_ref(), entity).await?;

        let keys: Vec<Vec<String>> = match target {
            TargetKind::Nodes(resource_type) => self
                .matching_nodes(resource_type, q.condition.as_ref(), &prepared)
                .await?
                .iter()
                .map(|n| group_key(&q.group_by, |path| resolve_node_field(n, path)))
                .collect(),
            TargetKind::Edges => self
                .matching_edges(q.condition.as_ref(), &prepared)
                .await?
                .iter()
                .map(|e| group_key(&q.group_by, |path| resolve_edge_field(e, path)))
                .collect(),
        };

        let total = keys.len();
        let mut counts: BTreeMap<Vec<String>, usize> = BTreeMap::new();
        for key in keys {
            *counts.entry(key).or_default() += 1;
        }
        let mut groups: Vec<SummaryGroup> = counts.into_iter().map(|(key, count)| SummaryGroup { key, count }).collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

        Ok(QueryResult::Summary(Summary {
            group_by: q.group_by.iter().map(|f| f.to_string()).collect(),
            groups,
            total,
        }))
    }

    async fn path(&self, q: &PathQuery, src: &str) -> IqlResult<QueryResult> {
        let view = self.load_view().await?;
        let from = resolve_node_ref(src, &view, &q.from)?;
        let to = resolve_node_ref(src, &view, &q.to)?;
        let result = graph::shortest_path(&view, &from, &to)
            .map_err(|e| IqlError::from_graph(src, q.from.span.join(q.to.span), e))?;
        Ok(QueryResult::Path(result))
    }

    async fn diff(&self, q: &DiffQuery, src: &str) -> IqlResult<QueryResult> {
        let Some(temporal) = self.temporal else {
            return Err(IqlError::evaluation(src, q.span, "DIFF requires a temporal store"));
        };
        let until = q.until.unwrap_or_else(|| temporal.clock().now());
        if q.since > until {
            return Err(IqlError::evaluation(
                src,
                q.span,
                format!("DIFF range is reversed: {} is after {}", q.since, until),
            ));
        }
        let diff = match &self.tenant {
            None => temporal.diff_timestamps(q.since, until).await?,
            Some(tenant) => {
                let before = temporal.get_topology_at(q.since).await?;
                let after = temporal.get_topology_at(until).await?;
                let own_nodes = |nodes: Vec<GraphNode>| -> Vec<GraphNode> {
                    nodes.into_iter().filter(|n| &n.tenant_id == tenant).collect()
                };
                let own_edges = |edges: Vec<GraphEdge>| -> Vec<GraphEdge> {
                    edges.into_iter().filter(|e| &e.tenant_id == tenant).collect()
                };
                diff_graphs(
                    &own_nodes(before.nodes),
                    &own_edges(before.edges),
                    &own_nodes(after.nodes),
                    &own_edges(after.edges),
                )
            }
        };
        Ok(QueryResult::Diff(diff))
    }

    async fn matching_nodes(
        &self,
        resource_type: Option<ResourceType>,
        condition: Option<&Condition>,
        prepared: &Prepared,
    ) -> IqlResult<Vec<GraphNode>> {
        let mut filter = self.node_filter();
        if let Some(rt) = resource_type {
            filter = filter.resource_type(rt);
        }
        let nodes = self.storage.query_nodes(&filter, &Pagination::all()).await?.items;
        Ok(match condition {
            None => nodes,
            Some(cond) => nodes.into_iter().filter(|n| eval_node(cond, n, prepared)).collect(),
        })
    }

    async fn matching_edges(&self, condition: Option<&Condition>, prepared: &Prepared) -> IqlResult<Vec<GraphEdge>> {
        let edges = self.storage.query_edges(&self.edge_filter(), &Pagination::all()).await?.items;
        Ok(match condition {
            None => edges,
            Some(cond) => edges.into_iter().filter(|e| eval_edge(cond, e, prepared)).collect(),
        })
    }

    /// Validate a condition and build what evaluating it needs.
    async fn prepare(&self, src: &str, condition: Option<&Condition>, entity: Entity) -> IqlResult<Prepared> {
        let mut prepared = Prepared::default();
        let Some(condition) = condition else {
            return Ok(prepared);
        };
        validate(src, condition, entity, &mut prepared)?;

        let mut calls = Vec::new();
        condition.functions(&mut calls);
        let graph_calls: Vec<_> = calls
            .into_iter()
            .filter(|(name, _, _)| Function::lookup(name).is_some_and(Function::needs_graph))
            .collect();
        if graph_calls.is_empty() {
            return Ok(prepared);
        }

        let view = self.load_view().await?;
        for (name, args, span) in graph_calls {
            let Some(function) = Function::lookup(name) else {
                continue;
            };
            let set: HashSet<NodeId> = match function {
                Function::IsOrphan => graph::find_orphans(&view).into_iter().collect(),
                Function::IsSpof => graph::find_single_points_of_failure(&view)
                    .into_iter()
                    .map(|s| s.node_id)
                    .collect(),
                Function::ConnectedTo => {
                    let id = resolve_node_ref(src, &view, &args[0])?;
                    view.neighbors(&id)
                        .map_err(|e| IqlError::from_graph(src, span, e))?
                        .into_iter()
                        .collect()
                }
                Function::InClusterWith => {
                    let id = resolve_node_ref(src, &view, &args[0])?;
                    graph::find_clusters(&view, None)
                        .into_iter()
                        .find(|c| c.contains(&id))
                        .map(|c| c.members.into_iter().filter(|m| m != &id).collect())
                        .unwrap_or_default()
                }
                Function::DependsOn => {
                    let id = resolve_node_ref(src, &view, &args[0])?;
                    graph::upstream(&view, &id, Some(&graph::is_dependency))
                        .map_err(|e| IqlError::from_graph(src, span, e))?
                        .into_iter()
                        .collect()
                }
                Function::HasTag => continue,
            };
            prepared.sets.insert(span.start, set);
        }
        Ok(prepared)
    }
}

fn resolve_target(src: &str, target: &Target) -> IqlResult<TargetKind> {
    let name = target.name.to_lowercase();
    match name.as_str() {
        "*" | "node" | "nodes" | "resource" | "resources" => return Ok(TargetKind::Nodes(None)),
        "edge" | "edges" | "relationship" | "relationships" => return Ok(TargetKind::Edges),
        _ => {}
    }
    let singular = name.strip_suffix('s').unwrap_or(&name);
    name.parse::<ResourceType>()
        .or_else(|_| singular.parse::<ResourceType>())
        .map(|rt| TargetKind::Nodes(Some(rt)))
        .map_err(|_| {
            IqlError::evaluation(
                src,
                target.span,
                format!("unknown target `{}`: use nodes, edges, * or a resource type", target.name),
            )
        })
}

fn field_kind(src: &str, field: &FieldRef, entity: Entity) -> IqlResult<FieldKind> {
    let kind = match entity {
        Entity::Node => node_field_kind(&field.path),
        Entity::Edge => edge_field_kind(&field.path),
    };
    kind.ok_or_else(|| {
        let what = match entity {
            Entity::Node => "nodes",
            Entity::Edge => "edges",
        };
        IqlError::evaluation(src, field.span, format!("unknown field `{field}` for {what}"))
    })
}

fn validate(src: &str, condition: &Condition, entity: Entity, prepared: &mut Prepared) -> IqlResult<()> {
    match condition {
        Condition::And(a, b) | Condition::Or(a, b) => {
            validate(src, a, entity, prepared)?;
            validate(src, b, entity, prepared)
        }
        Condition::Not(inner) => validate(src, inner, entity, prepared),
        Condition::Compare { field, op, value } => {
            let kind = field_kind(src, field, entity)?;
            validate_compare(src, field, kind, *op, value, prepared)
        }
        Condition::Function { name, args, span } => validate_call(src, name, args, *span, entity),
    }
}

fn validate_compare(
    src: &str,
    field: &FieldRef,
    kind: FieldKind,
    op: CompareOp,
    value: &Literal,
    prepared: &mut Prepared,
) -> IqlResult<()> {
    let mismatch = |expected: &str| {
        IqlError::evaluation(
            src,
            value.span,
            format!(
                "`{field} {op}` expects {expected}, found {} literal",
                value.value.type_name()
            ),
        )
    };

    match op {
        CompareOp::Contains | CompareOp::Matches => {
            if kind == FieldKind::Number {
                return Err(IqlError::evaluation(
                    src,
                    field.span,
                    format!("{op} needs a text field, but `{field}` is numeric"),
                ));
            }
            let LiteralValue::Str(pattern) = &value.value else {
                return Err(mismatch("a string"));
            };
            if op == CompareOp::Matches {
                let regex = Regex::new(pattern)
                    .map_err(|e| IqlError::evaluation(src, value.span, format!("invalid regular expression: {e}")))?;
                prepared.regexes.insert(value.span.start, regex);
            }
            Ok(())
        }
        _ => {
            let null_ok = matches!(op, CompareOp::Eq | CompareOp::Ne);
            match (kind, &value.value) {
                (_, LiteralValue::Null) if null_ok => Ok(()),
                (_, LiteralValue::Null) => Err(mismatch("a non-null value")),
                (FieldKind::Number, LiteralValue::Number(_)) => Ok(()),
                (FieldKind::Number, _) => Err(mismatch("a number")),
                (FieldKind::Text, LiteralValue::Str(_)) => Ok(()),
                (FieldKind::Text, _) => Err(mismatch("a string")),
                (FieldKind::Dynamic, LiteralValue::Bool(_)) if op.is_ordering() => {
                    Err(mismatch("a string or number"))
                }
                (FieldKind::Dynamic, _) => Ok(()),
            }
        }
    }
}

fn validate_call(src: &str, name: &str, args: &[Literal], span: Span, entity: Entity) -> IqlResult<()> {
    let function = Function::lookup(name).ok_or_else(|| {
        IqlError::evaluation(
            src,
            span,
            format!(
                "unknown function `{name}`: expected is_orphan, is_spof, has_tag, connected_to, \
                 in_cluster_with or depends_on"
            ),
        )
    })?;
    if entity == Entity::Edge {
        return Err(IqlError::evaluation(src, span, format!("function `{name}` applies to nodes only")));
    }
    let (min, max) = function.arity();
    if args.len() < min || args.len() > max {
        let expected = if min == max { format!("{min}") } else { format!("{min} or {max}") };
        return Err(IqlError::evaluation(
            src,
            span,
            format!("`{name}` takes {expected} argument(s), found {}", args.len()),
        ));
    }
    if let Some(bad) = args.iter().find(|a| a.as_str().is_none()) {
        return Err(IqlError::evaluation(
            src,
            bad.span,
            format!("`{name}` expects string arguments, found {}", bad.value.type_name()),
        ));
    }
    Ok(())
}

/// Resolve a quoted node reference: an exact node id, else the first node
/// (in id order) with that native id, else with that name.
fn resolve_node_ref(src: &str, view: &GraphView, literal: &Literal) -> IqlResult<NodeId> {
    let text = literal.as_str().unwrap_or_default();
    let id = NodeId::new(text);
    if view.contains(&id) {
        return Ok(id);
    }
    view.nodes()
        .find(|n| n.native_id == text)
        .or_else(|| view.nodes().find(|n| n.name == text))
        .map(|n| n.id.clone())
        .ok_or_else(|| IqlError::evaluation(src, literal.span, format!("unknown node `{text}`")))
}

fn group_key(fields: &[FieldRef], resolve: impl Fn(&[String]) -> FieldValue) -> Vec<String> {
    fields.iter().map(|f| resolve(&f.path).group_key()).collect()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_node(condition: &Condition, node: &GraphNode, prepared: &Prepared) -> bool {
    match condition {
        Condition::And(a, b) => eval_node(a, node, prepared) && eval_node(b, node, prepared),
        Condition::Or(a, b) => eval_node(a, node, prepared) || eval_node(b, node, prepared),
        Condition::Not(inner) => !eval_node(inner, node, prepared),
        Condition::Compare { field, op, value } => {
            compare(&resolve_node_field(node, &field.path), *op, value, prepared)
        }
        Condition::Function { name, args, span } => match Function::lookup(name) {
            Some(Function::HasTag) => {
                let key = args.first().and_then(Literal::as_str).unwrap_or_default();
                match (node.tags.get(key), args.get(1).and_then(Literal::as_str)) {
                    (Some(actual), Some(expected)) => actual == expected,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            }
            Some(_) => prepared.sets.get(&span.start).is_some_and(|set| set.contains(&node.id)),
            None => false,
        },
    }
}

fn eval_edge(condition: &Condition, edge: &GraphEdge, prepared: &Prepared) -> bool {
    match condition {
        Condition::And(a, b) => eval_edge(a, edge, prepared) && eval_edge(b, edge, prepared),
        Condition::Or(a, b) => eval_edge(a, edge, prepared) || eval_edge(b, edge, prepared),
        Condition::Not(inner) => !eval_edge(inner, edge, prepared),
        Condition::Compare { field, op, value } => {
            compare(&resolve_edge_field(edge, &field.path), *op, value, prepared)
        }
        // Rejected by validation.
        Condition::Function { .. } => false,
    }
}

/// Text equality is exact, like [`NodeFilter`] tag and region matching.
fn equals(value: &FieldValue, literal: &LiteralValue) -> bool {
    match (value, literal) {
        (FieldValue::Text(a), LiteralValue::Str(b)) => a == b,
        (FieldValue::Number(a), LiteralValue::Number(b)) => a == b,
        (FieldValue::Bool(a), LiteralValue::Bool(b)) => a == b,
        (FieldValue::Null | FieldValue::Missing, LiteralValue::Null) => true,
        _ => false,
    }
}

/// Compare a resolved value with a literal. Values of a different type than
/// the literal never match (except through `!=`). Only `CONTAINS` ignores case.
fn compare(value: &FieldValue, op: CompareOp, literal: &Literal, prepared: &Prepared) -> bool {
    match op {
        CompareOp::Eq => equals(value, &literal.value),
        CompareOp::Ne => !equals(value, &literal.value),
        CompareOp::Contains => match (value, &literal.value) {
            (FieldValue::Text(s), LiteralValue::Str(needle)) => s.to_lowercase().contains(&needle.to_lowercase()),
            (FieldValue::Json(serde_json::Value::Array(items)), lit) => {
                items.iter().any(|item| equals(&FieldValue::from_json(item), lit))
            }
            _ => false,
        },
        CompareOp::Matches => match (value, prepared.regexes.get(&literal.span.start)) {
            (FieldValue::Text(s), Some(regex)) => regex.is_match(s),
            _ => false,
        },
        CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => {
            let ordering = match (value, &literal.value) {
                (FieldValue::Number(a), LiteralValue::Number(b)) => a.partial_cmp(b),
                (FieldValue::Text(a), LiteralValue::Str(b)) => Some(a.as_str().cmp(b.as_str())),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Ge => ordering.is_ge(),
                _ => ordering.is_le(),
            }
        }
    }
}
