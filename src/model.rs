//! Canonical data model: nodes, edges, versions, snapshots and sync records.
//!
//! Every storage backend, the sync engine and the query layer speak these
//! types. Merge rules for re-observed entities live here ([`GraphNode::absorb`],
//! [`GraphEdge::absorb`]) so that all backends resolve upserts identically.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

/// Open per-entity metadata bag, ordered by key for stable hashing.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of the tenant that owns an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self("default".into())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable node identifier.
///
/// Derived from `provider:account:region:resource_type:native_id`, so the same
/// resource always maps to the same id no matter which sync cycle saw it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the canonical id from the identifying fields of a resource.
    pub fn derive(
        provider: &Provider,
        account: &str,
        region: &str,
        resource_type: ResourceType,
        native_id: &str,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:{}:{}",
            provider.as_str(),
            account,
            region,
            resource_type.as_str(),
            native_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Deterministic edge identifier: `source|relationship|target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn derive(source: &NodeId, relationship: RelationshipType, target: &NodeId) -> Self {
        Self(format!("{}|{}|{}", source, relationship.as_str(), target))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the cloud or cluster provider a resource came from (`aws`, `gcp`,
/// `kubernetes`, ...). Normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provider(String);

impl Provider {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Generates `as_str`, `ALL`, `Display` and a lenient `FromStr` for a closed
/// enum whose wire form is snake_case.
macro_rules! closed_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
                let compact = normalized.replace('_', "");
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == normalized || v.as_str().replace('_', "") == compact)
                    .ok_or_else(|| ModelError::UnknownVariant {
                        kind: $what,
                        value: s.to_string(),
                    })
            }
        }
    };
}

/// Kind of infrastructure resource a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Compute,
    Container,
    Function,
    Database,
    Cache,
    Storage,
    Queue,
    Topic,
    Network,
    Subnet,
    LoadBalancer,
    Dns,
    Cdn,
    Gateway,
    Firewall,
    Identity,
    Role,
    Policy,
    Secret,
    Certificate,
    Cluster,
    Namespace,
    Pod,
    Service,
    Deployment,
    Volume,
    Monitoring,
    Other,
}

closed_enum!(ResourceType, "resource type", {
    Compute => "compute",
    Container => "container",
    Function => "function",
    Database => "database",
    Cache => "cache",
    Storage => "storage",
    Queue => "queue",
    Topic => "topic",
    Network => "network",
    Subnet => "subnet",
    LoadBalancer => "load_balancer",
    Dns => "dns",
    Cdn => "cdn",
    Gateway => "gateway",
    Firewall => "firewall",
    Identity => "identity",
    Role => "role",
    Policy => "policy",
    Secret => "secret",
    Certificate => "certificate",
    Cluster => "cluster",
    Namespace => "namespace",
    Pod => "pod",
    Service => "service",
    Deployment => "deployment",
    Volume => "volume",
    Monitoring => "monitoring",
    Other => "other",
});

/// Lifecycle status of a node.
///
/// `Disappeared` is the tombstone: the resource was not seen by the last
/// complete discovery pass but its history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Stopped,
    Pending,
    Degraded,
    Unknown,
    Disappeared,
}

closed_enum!(NodeStatus, "node status", {
    Running => "running",
    Stopped => "stopped",
    Pending => "pending",
    Degraded => "degraded",
    Unknown => "unknown",
    Disappeared => "disappeared",
});

/// Typed, directed relationship between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    DependsOn,
    Contains,
    ConnectsTo,
    RoutesTo,
    Uses,
    AttachedTo,
    MemberOf,
    ReadsFrom,
    WritesTo,
    Assumes,
    Manages,
    Exposes,
    Replicates,
    /// Relationship between entities owned by different tenants. Only ever
    /// produced by explicit cross-tenant discovery.
    CrossAccount,
}

closed_enum!(RelationshipType, "relationship type", {
    DependsOn => "depends_on",
    Contains => "contains",
    ConnectsTo => "connects_to",
    RoutesTo => "routes_to",
    Uses => "uses",
    AttachedTo => "attached_to",
    MemberOf => "member_of",
    ReadsFrom => "reads_from",
    WritesTo => "writes_to",
    Assumes => "assumes",
    Manages => "manages",
    Exposes => "exposes",
    Replicates => "replicates",
    CrossAccount => "cross_account",
});

/// How an edge was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredVia {
    ConfigScan,
    ApiField,
    RuntimeTrace,
    IacParse,
    EventStream,
    Manual,
}

closed_enum!(DiscoveredVia, "discovery method", {
    ConfigScan => "config_scan",
    ApiField => "api_field",
    RuntimeTrace => "runtime_trace",
    IacParse => "iac_parse",
    EventStream => "event_stream",
    Manual => "manual",
});

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// One discovered infrastructure resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub resource_type: ResourceType,
    pub native_id: String,
    pub name: String,
    pub region: String,
    pub account: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub cost_monthly: Option<f64>,
    pub owner: Option<String>,
    pub discovered_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_seen_at: Timestamp,
}

impl GraphNode {
    /// Create a running node with a derived id and all timestamps set to now.
    pub fn new(
        provider: impl AsRef<str>,
        account: impl Into<String>,
        region: impl Into<String>,
        resource_type: ResourceType,
        native_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let provider = Provider::new(provider);
        let account = account.into();
        let region = region.into();
        let native_id = native_id.into();
        let now = now_millis();
        Self {
            id: NodeId::derive(&provider, &account, &region, resource_type, &native_id),
            tenant_id: TenantId::default(),
            provider,
            resource_type,
            native_id,
            name: name.into(),
            region,
            account,
            status: NodeStatus::Running,
            tags: BTreeMap::new(),
            metadata: Metadata::new(),
            cost_monthly: None,
            owner: None,
            discovered_at: now,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
        }
    }

    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = tenant;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_cost(mut self, cost_monthly: f64) -> Self {
        self.cost_monthly = Some(cost_monthly);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set every timestamp to `at`.
    pub fn observed_at(mut self, at: Timestamp) -> Self {
        self.discovered_at = at;
        self.created_at = at;
        self.updated_at = at;
        self.last_seen_at = at;
        self
    }

    pub fn is_disappeared(&self) -> bool {
        self.status == NodeStatus::Disappeared
    }

    /// Merge a re-observation of this node into `self`.
    ///
    /// Scalars are last-write-wins; `created_at` and `discovered_at` keep the
    /// earliest value and `last_seen_at` the latest.
    pub fn absorb(&mut self, incoming: GraphNode) {
        let created_at = self.created_at.min(incoming.created_at);
        let discovered_at = self.discovered_at.min(incoming.discovered_at);
        let last_seen_at = self.last_seen_at.max(incoming.last_seen_at);
        *self = GraphNode {
            created_at,
            discovered_at,
            last_seen_at,
            ..incoming
        };
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Typed, directed relationship between two nodes with a confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: EdgeId,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub discovered_via: DiscoveredVia,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub last_seen_at: Timestamp,
}

impl GraphEdge {
    /// Create an edge with full confidence observed through an API field.
    pub fn new(source: NodeId, relationship: RelationshipType, target: NodeId) -> Self {
        let now = now_millis();
        Self {
            id: EdgeId::derive(&source, relationship, &target),
            tenant_id: TenantId::default(),
            source_node_id: source,
            target_node_id: target,
            relationship_type: relationship,
            confidence: 1.0,
            discovered_via: DiscoveredVia::ApiField,
            metadata: Metadata::new(),
            created_at: now,
            last_seen_at: now,
        }
    }

    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = tenant;
        self
    }

    /// Set the confidence, clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_via(mut self, via: DiscoveredVia) -> Self {
        self.discovered_via = via;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn observed_at(mut self, at: Timestamp) -> Self {
        self.created_at = at;
        self.last_seen_at = at;
        self
    }

    /// Whether `node` is one of this edge's endpoints.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source_node_id == node || &self.target_node_id == node
    }

    /// Merge a re-observation of this edge into `self`.
    ///
    /// Confidence takes the maximum, metadata is the union of both bags with
    /// incoming keys winning, `created_at` keeps the earliest value.
    pub fn absorb(&mut self, incoming: GraphEdge) {
        self.confidence = self.confidence.max(incoming.confidence.clamp(0.0, 1.0));
        self.discovered_via = incoming.discovered_via;
        self.metadata.extend(incoming.metadata);
        self.created_at = self.created_at.min(incoming.created_at);
        self.last_seen_at = self.last_seen_at.max(incoming.last_seen_at);
        self.tenant_id = incoming.tenant_id;
    }
}

/// What a storage upsert did to the stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

// ---------------------------------------------------------------------------
// Temporal entities
// ---------------------------------------------------------------------------

/// Kind of change recorded in a version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Disappeared,
    Deleted,
}

/// One entry of a node's append-only version chain.
///
/// `node` holds the full state after the change; for `Deleted` it is the last
/// state before removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub node_id: NodeId,
    pub version: u64,
    pub recorded_at: Timestamp,
    pub change: ChangeKind,
    pub node: GraphNode,
}

/// One entry of an edge's append-only version chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeVersion {
    pub edge_id: EdgeId,
    pub version: u64,
    pub recorded_at: Timestamp,
    pub change: ChangeKind,
    pub edge: GraphEdge,
}

/// Monotonically increasing snapshot sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot#{}", self.0)
    }
}

/// Immutable capture of the full graph at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub taken_at: Timestamp,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Snapshot {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            taken_at: self.taken_at,
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
        }
    }
}

/// Lightweight listing entry for a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub taken_at: Timestamp,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Persisted outcome of one discovery + reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub adapter_id: String,
    pub tenant_id: TenantId,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub created: usize,
    pub updated: usize,
    pub disappeared: usize,
    pub unchanged: usize,
    pub errors: Vec<String>,
    pub complete: bool,
    pub cancelled: bool,
}
