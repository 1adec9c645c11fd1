//! Multi-tenant registry and isolation.
//!
//! A [`Tenant`] owns cloud accounts and every node/edge stamped with its id.
//! [`TenantScopedStorage`] wraps any [`GraphStorage`] so that one tenant can
//! neither read nor write another tenant's entities. The only sanctioned
//! bridge between tenants is a [`RelationshipType::CrossAccount`] edge, and
//! only when both tenants' [`IsolationPolicy`] name each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;
use crate::model::{
    DiscoveredVia, EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Provider,
    RelationshipType, Snapshot, SnapshotId, SnapshotSummary, SyncRecord, TenantId, Timestamp,
    UpsertOutcome, now_millis,
};
use crate::store::{EdgeFilter, GraphStorage, NodeFilter, Page, Pagination, StoreResult};

const TENANT_META_PREFIX: &str = "tenant:";
const ACCOUNT_META_PREFIX: &str = "account:";

/// Confidence assigned to edges found by cross-tenant metadata scanning.
const CROSS_TENANT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Error, Diagnostic)]
pub enum TenantError {
    #[error("tenant {tenant} may not {operation} data owned by {other}")]
    #[diagnostic(
        code(infragraph::tenant::isolation_violation),
        help(
            "Tenants are isolated by default. Cross-tenant access needs a CrossAccount edge \
             and both tenants' isolation policies must permit each other."
        )
    )]
    IsolationViolation {
        tenant: String,
        other: String,
        operation: String,
    },

    #[error("unknown tenant: {tenant}")]
    #[diagnostic(
        code(infragraph::tenant::unknown),
        help("Register the tenant with AccountRegistry::register_tenant before using it.")
    )]
    UnknownTenant { tenant: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type TenantResult<T> = std::result::Result<T, TenantError>;

fn violation(tenant: &TenantId, other: &TenantId, operation: &str) -> TenantError {
    TenantError::IsolationViolation {
        tenant: tenant.to_string(),
        other: other.to_string(),
        operation: operation.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Registry entities
// ---------------------------------------------------------------------------

/// Which peers a tenant shares relationships with. Strict by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    #[serde(default)]
    pub allow_cross_tenant: bool,
    #[serde(default)]
    pub permitted_peers: BTreeSet<TenantId>,
}

impl IsolationPolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    /// Share with exactly these peers.
    pub fn sharing_with(peers: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            allow_cross_tenant: true,
            permitted_peers: peers.into_iter().collect(),
        }
    }

    pub fn permits(&self, peer: &TenantId) -> bool {
        self.allow_cross_tenant && self.permitted_peers.contains(peer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub policy: IsolationPolicy,
    pub created_at: Timestamp,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TenantId::new(id),
            name: name.into(),
            policy: IsolationPolicy::strict(),
            created_at: now_millis(),
        }
    }

    pub fn with_policy(mut self, policy: IsolationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Opaque pointer to credentials held elsewhere (a vault path, a profile
/// name). Never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A provider account owned by one tenant. Id is `provider:external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    pub id: String,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_account_id: String,
    pub name: String,
    pub credential: Option<CredentialRef>,
    pub created_at: Timestamp,
}

impl CloudAccount {
    pub fn new(
        tenant: TenantId,
        provider: impl AsRef<str>,
        external_account_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let provider = Provider::new(provider);
        let external_account_id = external_account_id.into();
        Self {
            id: format!("{}:{external_account_id}", provider.as_str()),
            tenant_id: tenant,
            provider,
            external_account_id,
            name: name.into(),
            credential: None,
            created_at: now_millis(),
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }
}

// ---------------------------------------------------------------------------
// AccountRegistry
// ---------------------------------------------------------------------------

/// Concurrent registry of tenants and their cloud accounts.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    tenants: DashMap<TenantId, Tenant>,
    accounts: DashMap<String, CloudAccount>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant.
    pub fn register_tenant(&self, tenant: Tenant) {
        tracing::debug!(tenant = %tenant.id, "registered tenant");
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn get_tenant(&self, id: &TenantId) -> Option<Tenant> {
        self.tenants.get(id).map(|t| t.value().clone())
    }

    pub fn contains_tenant(&self, id: &TenantId) -> bool {
        self.tenants.contains_key(id)
    }

    /// All tenants ordered by id.
    pub fn list_tenants(&self) -> Vec<Tenant> {
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    pub fn set_policy(&self, id: &TenantId, policy: IsolationPolicy) -> TenantResult<()> {
        let mut tenant = self.tenants.get_mut(id).ok_or_else(|| TenantError::UnknownTenant {
            tenant: id.to_string(),
        })?;
        tenant.policy = policy;
        Ok(())
    }

    /// Attach an account to its tenant. An account already owned by another
    /// tenant cannot be claimed.
    pub fn add_account(&self, account: CloudAccount) -> TenantResult<()> {
        if !self.contains_tenant(&account.tenant_id) {
            return Err(TenantError::UnknownTenant {
                tenant: account.tenant_id.to_string(),
            });
        }
        if let Some(existing) = self.accounts.get(&account.id)
            && existing.tenant_id != account.tenant_id
        {
            return Err(violation(&account.tenant_id, &existing.tenant_id, "claim an account of"));
        }
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    /// Accounts of one tenant ordered by id.
    pub fn accounts_for(&self, tenant: &TenantId) -> Vec<CloudAccount> {
        let mut accounts: Vec<CloudAccount> = self
            .accounts
            .iter()
            .filter(|a| &a.tenant_id == tenant)
            .map(|a| a.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    /// Owner of a provider account, if registered.
    pub fn tenant_of_account(&self, provider: &Provider, external_account_id: &str) -> Option<TenantId> {
        let id = format!("{}:{external_account_id}", provider.as_str());
        self.accounts.get(&id).map(|a| a.tenant_id.clone())
    }

    pub fn remove_account(&self, id: &str) -> Option<CloudAccount> {
        self.accounts.remove(id).map(|(_, a)| a)
    }

    /// Both tenants must list each other. A one-sided grant is not enough.
    pub fn cross_tenant_permitted(&self, a: &TenantId, b: &TenantId) -> bool {
        match (self.tenants.get(a), self.tenants.get(b)) {
            (Some(ta), Some(tb)) => ta.policy.permits(b) && tb.policy.permits(a),
            _ => false,
        }
    }

    /// Write every tenant and account into the storage meta area.
    pub async fn persist(&self, storage: &dyn GraphStorage) -> TenantResult<()> {
        for tenant in self.list_tenants() {
            let key = format!("{TENANT_META_PREFIX}{}", tenant.id);
            storage.put_meta(&key, &serde_json::to_vec(&tenant).map_err(StoreError::from)?).await?;
        }
        let accounts: Vec<CloudAccount> = self.accounts.iter().map(|a| a.value().clone()).collect();
        for account in &accounts {
            let key = format!("{ACCOUNT_META_PREFIX}{}", account.id);
            storage.put_meta(&key, &serde_json::to_vec(account).map_err(StoreError::from)?).await?;
        }
        tracing::debug!(tenants = self.tenants.len(), accounts = accounts.len(), "persisted account registry");
        Ok(())
    }

    /// Rebuild the registry by scanning the `tenant:` and `account:` prefixes.
    pub async fn restore(storage: &dyn GraphStorage) -> TenantResult<Self> {
        let registry = Self::new();
        for (_key, value) in storage.scan_meta_prefix(TENANT_META_PREFIX).await? {
            let tenant: Tenant = serde_json::from_slice(&value).map_err(StoreError::from)?;
            registry.tenants.insert(tenant.id.clone(), tenant);
        }
        for (_key, value) in storage.scan_meta_prefix(ACCOUNT_META_PREFIX).await? {
            let account: CloudAccount = serde_json::from_slice(&value).map_err(StoreError::from)?;
            registry.accounts.insert(account.id.clone(), account);
        }
        Ok(registry)
    }
}

// ---------------------------------------------------------------------------
// TenantScopedStorage
// ---------------------------------------------------------------------------

/// A [`GraphStorage`] view confined to one tenant.
///
/// Reads only ever see the tenant's entities; foreign ids surface as
/// [`TenantError::IsolationViolation`]. Meta keys are namespaced under
/// `tenant/{id}/`. Store-wide maintenance (pruning, snapshot writes) is not
/// available through a scope.
#[derive(Clone)]
pub struct TenantScopedStorage {
    inner: Arc<dyn GraphStorage>,
    tenant: TenantId,
    registry: Arc<AccountRegistry>,
}

impl std::fmt::Debug for TenantScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantScopedStorage").field("tenant", &self.tenant).finish_non_exhaustive()
    }
}

impl TenantScopedStorage {
    pub fn new(inner: Arc<dyn GraphStorage>, tenant: TenantId, registry: Arc<AccountRegistry>) -> Self {
        Self {
            inner,
            tenant,
            registry,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn ensure_owned(&self, owner: &TenantId, operation: &str) -> StoreResult<()> {
        if owner == &self.tenant {
            Ok(())
        } else {
            Err(violation(&self.tenant, owner, operation).into())
        }
    }

    fn global_operation(&self, operation: &str) -> StoreError {
        violation(&self.tenant, &TenantId::new("*"), operation).into()
    }

    fn meta_key(&self, key: &str) -> String {
        format!("tenant/{}/{key}", self.tenant)
    }

    async fn check_node_write(&self, node: &GraphNode) -> StoreResult<()> {
        self.ensure_owned(&node.tenant_id, "write")?;
        if let Some(existing) = self.inner.get_node(&node.id).await? {
            self.ensure_owned(&existing.tenant_id, "overwrite")?;
        }
        Ok(())
    }

    async fn check_edge_write(&self, edge: &GraphEdge) -> StoreResult<()> {
        self.ensure_owned(&edge.tenant_id, "write")?;
        if let Some(existing) = self.inner.get_edge(&edge.id).await? {
            self.ensure_owned(&existing.tenant_id, "overwrite")?;
        }
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            let Some(node) = self.inner.get_node(endpoint).await? else {
                // The backend reports the dangling edge.
                continue;
            };
            if node.tenant_id == self.tenant {
                continue;
            }
            let granted = edge.relationship_type == RelationshipType::CrossAccount
                && self.registry.cross_tenant_permitted(&self.tenant, &node.tenant_id);
            if !granted {
                return Err(violation(&self.tenant, &node.tenant_id, "link to").into());
            }
        }
        Ok(())
    }

    fn scoped_node_filter(&self, filter: &NodeFilter) -> StoreResult<NodeFilter> {
        if let Some(requested) = &filter.tenant_id {
            self.ensure_owned(requested, "query")?;
        }
        let mut scoped = filter.clone();
        scoped.tenant_id = Some(self.tenant.clone());
        Ok(scoped)
    }

    fn scoped_edge_filter(&self, filter: &EdgeFilter) -> StoreResult<EdgeFilter> {
        if let Some(requested) = &filter.tenant_id {
            self.ensure_owned(requested, "query")?;
        }
        let mut scoped = filter.clone();
        scoped.tenant_id = Some(self.tenant.clone());
        Ok(scoped)
    }

    fn scope_snapshot(&self, mut snapshot: Snapshot) -> Snapshot {
        snapshot.nodes.retain(|n| n.tenant_id == self.tenant);
        snapshot.edges.retain(|e| e.tenant_id == self.tenant);
        snapshot
    }
}

#[async_trait]
impl GraphStorage for TenantScopedStorage {
    async fn initialize(&self) -> StoreResult<()> {
        self.inner.initialize().await
    }

    /// The scope does not own the backend; closing it is a no-op.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome> {
        self.check_node_write(&node).await?;
        self.inner.upsert_node(node).await
    }

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        // Validate the whole batch before touching the backend.
        for node in &nodes {
            self.check_node_write(node).await?;
        }
        self.inner.upsert_nodes(nodes).await
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome> {
        self.check_edge_write(&edge).await?;
        self.inner.upsert_edge(edge).await
    }

    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        for edge in &edges {
            self.check_edge_write(edge).await?;
        }
        self.inner.upsert_edges(edges).await
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>> {
        match self.inner.get_node(id).await? {
            Some(node) => {
                self.ensure_owned(&node.tenant_id, "read")?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>> {
        match self.inner.get_node_by_native_id(account, provider, native_id).await? {
            Some(node) => {
                self.ensure_owned(&node.tenant_id, "read")?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>> {
        match self.inner.get_edge(id).await? {
            Some(edge) => {
                self.ensure_owned(&edge.tenant_id, "read")?;
                Ok(Some(edge))
            }
            None => Ok(None),
        }
    }

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>> {
        let scoped = self.scoped_node_filter(filter)?;
        self.inner.query_nodes(&scoped, page).await
    }

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>> {
        let scoped = self.scoped_edge_filter(filter)?;
        self.inner.query_edges(&scoped, page).await
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool> {
        match self.inner.get_node(id).await? {
            Some(node) => {
                self.ensure_owned(&node.tenant_id, "delete")?;
                self.inner.delete_node(id).await
            }
            None => Ok(false),
        }
    }

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool> {
        match self.inner.get_edge(id).await? {
            Some(edge) => {
                self.ensure_owned(&edge.tenant_id, "delete")?;
                self.inner.delete_edge(id).await
            }
            None => Ok(false),
        }
    }

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()> {
        self.ensure_owned(&version.node.tenant_id, "record history for")?;
        self.inner.append_node_version(version).await
    }

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()> {
        self.ensure_owned(&version.edge.tenant_id, "record history for")?;
        self.inner.append_edge_version(version).await
    }

    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>> {
        let mut versions = self.inner.node_versions(id).await?;
        versions.retain(|v| v.node.tenant_id == self.tenant);
        Ok(versions)
    }

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>> {
        let mut versions = self.inner.edge_versions(id).await?;
        versions.retain(|v| v.edge.tenant_id == self.tenant);
        Ok(versions)
    }

    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>> {
        let mut versions = self.inner.node_versions_until(t).await?;
        versions.retain(|v| v.node.tenant_id == self.tenant);
        Ok(versions)
    }

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>> {
        let mut versions = self.inner.edge_versions_until(t).await?;
        versions.retain(|v| v.edge.tenant_id == self.tenant);
        Ok(versions)
    }

    async fn prune_versions_before(&self, _t: Timestamp) -> StoreResult<usize> {
        Err(self.global_operation("prune history of"))
    }

    async fn save_snapshot(&self, _snapshot: &Snapshot) -> StoreResult<()> {
        Err(self.global_operation("write snapshots of"))
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>> {
        Ok(self.inner.get_snapshot(id).await?.map(|s| self.scope_snapshot(s)))
    }

    /// Counts cover only this tenant's share of each snapshot.
    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        let mut scoped = Vec::new();
        for summary in self.inner.list_snapshots().await? {
            if let Some(snapshot) = self.inner.get_snapshot(summary.id).await? {
                scoped.push(self.scope_snapshot(snapshot).summary());
            }
        }
        Ok(scoped)
    }

    async fn delete_snapshot(&self, _id: SnapshotId) -> StoreResult<bool> {
        Err(self.global_operation("delete snapshots of"))
    }

    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)> {
        let (mut nodes, mut edges) = self.inner.capture_state().await?;
        nodes.retain(|n| n.tenant_id == self.tenant);
        edges.retain(|e| e.tenant_id == self.tenant);
        Ok((nodes, edges))
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        self.ensure_owned(&record.tenant_id, "record syncs for")?;
        self.inner.save_sync_record(record).await
    }

    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        let mut records = self.inner.list_sync_records(adapter_id).await?;
        records.retain(|r| r.tenant_id == self.tenant);
        Ok(records)
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner.put_meta(&self.meta_key(key), value).await
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get_meta(&self.meta_key(key)).await
    }

    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let namespace = self.meta_key("");
        let entries = self.inner.scan_meta_prefix(&self.meta_key(prefix)).await?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key.strip_prefix(&namespace).unwrap_or(&key).to_string(), value))
            .collect())
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        self.inner.next_sequence(&self.meta_key(key)).await
    }
}

// ---------------------------------------------------------------------------
// TenantManager
// ---------------------------------------------------------------------------

/// Counts from one cross-tenant discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTenantReport {
    pub edges_created: usize,
    pub edges_updated: usize,
    pub edges_unchanged: usize,
}

/// Entry point for tenant-scoped access and cross-tenant discovery.
#[derive(Clone)]
pub struct TenantManager {
    storage: Arc<dyn GraphStorage>,
    registry: Arc<AccountRegistry>,
}

impl std::fmt::Debug for TenantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantManager").field("registry", &self.registry).finish_non_exhaustive()
    }
}

impl TenantManager {
    pub fn new(storage: Arc<dyn GraphStorage>, registry: Arc<AccountRegistry>) -> Self {
        Self { storage, registry }
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    /// Storage confined to a registered tenant.
    pub fn for_tenant(&self, tenant: &TenantId) -> TenantResult<TenantScopedStorage> {
        if !self.registry.contains_tenant(tenant) {
            return Err(TenantError::UnknownTenant {
                tenant: tenant.to_string(),
            });
        }
        Ok(TenantScopedStorage::new(
            Arc::clone(&self.storage),
            tenant.clone(),
            Arc::clone(&self.registry),
        ))
    }

    /// Refuse to sync an account that is registered to a different tenant.
    /// Unregistered accounts are allowed.
    pub fn check_account_owner(&self, tenant: &TenantId, provider: &Provider, account: &str) -> TenantResult<()> {
        match self.registry.tenant_of_account(provider, account) {
            Some(owner) if &owner != tenant => Err(violation(tenant, &owner, "sync an account owned by")),
            _ => Ok(()),
        }
    }

    /// Link two tenants' graphs where one side's metadata names a native id
    /// on the other side.
    ///
    /// Each match becomes a [`RelationshipType::CrossAccount`] edge from the
    /// referencing node to the referenced node, owned by the referencing
    /// tenant. Both policies must permit the peer.
    pub async fn discover_cross_tenant(&self, a: &TenantId, b: &TenantId) -> TenantResult<CrossTenantReport> {
        for tenant in [a, b] {
            if !self.registry.contains_tenant(tenant) {
                return Err(TenantError::UnknownTenant {
                    tenant: tenant.to_string(),
                });
            }
        }
        if a == b || !self.registry.cross_tenant_permitted(a, b) {
            return Err(violation(a, b, "discover relationships with"));
        }

        let nodes_a = self.active_nodes(a).await?;
        let nodes_b = self.active_nodes(b).await?;

        let mut edges = cross_references(&nodes_a, &nodes_b, b);
        edges.extend(cross_references(&nodes_b, &nodes_a, a));

        let mut report = CrossTenantReport::default();
        for outcome in self.storage.upsert_edges(edges).await? {
            match outcome {
                UpsertOutcome::Created => report.edges_created += 1,
                UpsertOutcome::Updated => report.edges_updated += 1,
                UpsertOutcome::Unchanged => report.edges_unchanged += 1,
            }
        }
        tracing::info!(
            tenant = %a,
            peer = %b,
            created = report.edges_created,
            updated = report.edges_updated,
            "cross-tenant discovery complete"
        );
        Ok(report)
    }

    async fn active_nodes(&self, tenant: &TenantId) -> TenantResult<Vec<GraphNode>> {
        let filter = NodeFilter::new().tenant(tenant.clone()).active_only();
        Ok(self.storage.query_nodes(&filter, &Pagination::all()).await?.items)
    }
}

/// Edges from `from` nodes whose metadata mentions a `to` node's native id.
fn cross_references(from: &[GraphNode], to: &[GraphNode], peer: &TenantId) -> Vec<GraphEdge> {
    let by_native: HashMap<&str, &GraphNode> = to.iter().map(|n| (n.native_id.as_str(), n)).collect();
    let mut edges = Vec::new();
    for node in from {
        let mut referenced = BTreeSet::new();
        for value in node.metadata.values() {
            collect_strings(value, &mut |s| {
                if let Some(target) = by_native.get(s) {
                    referenced.insert(target.id.clone());
                }
            });
        }
        for target in referenced {
            edges.push(
                GraphEdge::new(node.id.clone(), RelationshipType::CrossAccount, target)
                    .with_tenant(node.tenant_id.clone())
                    .with_confidence(CROSS_TENANT_CONFIDENCE)
                    .with_via(DiscoveredVia::ConfigScan)
                    .with_metadata("peer_tenant", serde_json::Value::String(peer.to_string())),
            );
        }
    }
    edges
}

fn collect_strings<'a>(value: &'a serde_json::Value, visit: &mut impl FnMut(&'a str)) {
    match value {
        serde_json::Value::String(s) => visit(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, visit)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, visit)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;
    use crate::store::MemStore;

    fn acme() -> TenantId {
        TenantId::new("acme")
    }

    fn globex() -> TenantId {
        TenantId::new("globex")
    }

    fn node(tenant: &TenantId, native: &str) -> GraphNode {
        GraphNode::new("aws", tenant.as_str(), "us-east-1", ResourceType::Compute, native, native)
            .with_tenant(tenant.clone())
    }

    fn setup(share: bool) -> (Arc<dyn GraphStorage>, TenantManager) {
        let storage: Arc<dyn GraphStorage> = Arc::new(MemStore::new());
        let registry = Arc::new(AccountRegistry::new());
        let (pa, pg) = if share {
            (IsolationPolicy::sharing_with([globex()]), IsolationPolicy::sharing_with([acme()]))
        } else {
            (IsolationPolicy::strict(), IsolationPolicy::strict())
        };
        registry.register_tenant(Tenant::new("acme", "Acme").with_policy(pa));
        registry.register_tenant(Tenant::new("globex", "Globex").with_policy(pg));
        let manager = TenantManager::new(Arc::clone(&storage), registry);
        (storage, manager)
    }

    fn is_violation(err: &StoreError) -> bool {
        matches!(err, StoreError::Tenant(e) if matches!(**e, TenantError::IsolationViolation { .. }))
    }

    #[tokio::test]
    async fn scoped_snapshot_list_counts_only_own_nodes() {
        let (storage, manager) = setup(false);
        storage
            .upsert_nodes(vec![node(&acme(), "a1"), node(&globex(), "g1"), node(&globex(), "g2")])
            .await
            .unwrap();
        let (nodes, edges) = storage.capture_state().await.unwrap();
        storage
            .save_snapshot(&Snapshot {
                id: SnapshotId(1),
                taken_at: 5,
                nodes,
                edges,
            })
            .await
            .unwrap();

        let summaries = manager.for_tenant(&acme()).unwrap().list_snapshots().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!((summaries[0].id, summaries[0].node_count), (SnapshotId(1), 1));
        let summaries = manager.for_tenant(&globex()).unwrap().list_snapshots().await.unwrap();
        assert_eq!(summaries[0].node_count, 2);
        assert_eq!(storage.list_snapshots().await.unwrap()[0].node_count, 3);
    }

    #[test]
    fn sync_of_a_claimed_account_is_refused() {
        let (_, manager) = setup(false);
        manager
            .registry()
            .add_account(CloudAccount::new(acme(), "aws", "111", "prod"))
            .unwrap();
        let aws = Provider::new("aws");
        assert!(manager.check_account_owner(&acme(), &aws, "111").is_ok());
        assert!(manager.check_account_owner(&globex(), &aws, "999").is_ok());
        let err = manager.check_account_owner(&globex(), &aws, "111").unwrap_err();
        assert!(matches!(err, TenantError::IsolationViolation { ref other, .. } if other == "acme"));
    }

    #[test]
    fn account_cannot_be_claimed_twice() {
        let registry = AccountRegistry::new();
        registry.register_tenant(Tenant::new("acme", "Acme"));
        registry.register_tenant(Tenant::new("globex", "Globex"));
        registry.add_account(CloudAccount::new(acme(), "aws", "111", "prod")).unwrap();

        let err = registry.add_account(CloudAccount::new(globex(), "aws", "111", "stolen")).unwrap_err();
        assert!(matches!(err, TenantError::IsolationViolation { .. }));
        assert_eq!(registry.tenant_of_account(&Provider::new("aws"), "111"), Some(acme()));
    }

    #[test]
    fn account_requires_registered_tenant() {
        let registry = AccountRegistry::new();
        let err = registry.add_account(CloudAccount::new(acme(), "aws", "111", "prod")).unwrap_err();
        assert!(matches!(err, TenantError::UnknownTenant { .. }));
    }

    #[test]
    fn one_sided_grant_is_not_enough() {
        let registry = AccountRegistry::new();
        registry.register_tenant(Tenant::new("acme", "Acme").with_policy(IsolationPolicy::sharing_with([globex()])));
        registry.register_tenant(Tenant::new("globex", "Globex"));
        assert!(!registry.cross_tenant_permitted(&acme(), &globex()));

        registry.set_policy(&globex(), IsolationPolicy::sharing_with([acme()])).unwrap();
        assert!(registry.cross_tenant_permitted(&acme(), &globex()));
    }

    #[tokio::test]
    async fn persist_and_restore() {
        let storage = MemStore::new();
        let registry = AccountRegistry::new();
        registry.register_tenant(Tenant::new("acme", "Acme"));
        registry
            .add_account(
                CloudAccount::new(acme(), "gcp", "proj-1", "main").with_credential(CredentialRef::new("vault://gcp/main")),
            )
            .unwrap();
        registry.persist(&storage).await.unwrap();

        let restored = AccountRegistry::restore(&storage).await.unwrap();
        assert_eq!(restored.list_tenants().len(), 1);
        let accounts = restored.accounts_for(&acme());
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "gcp:proj-1");
        assert_eq!(accounts[0].credential.as_ref().map(|c| c.as_str()), Some("vault://gcp/main"));
    }

    #[tokio::test]
    async fn scoped_reads_never_see_foreign_nodes() {
        let (storage, manager) = setup(false);
        let theirs = node(&globex(), "i-g");
        storage.upsert_node(node(&acme(), "i-a")).await.unwrap();
        storage.upsert_node(theirs.clone()).await.unwrap();

        let scope = manager.for_tenant(&acme()).unwrap();
        let page = scope.query_nodes(&NodeFilter::new(), &Pagination::all()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].tenant_id, acme());

        let err = scope.get_node(&theirs.id).await.unwrap_err();
        assert!(is_violation(&err));

        let err = scope
            .query_nodes(&NodeFilter::new().tenant(globex()), &Pagination::all())
            .await
            .unwrap_err();
        assert!(is_violation(&err));
    }

    #[tokio::test]
    async fn scoped_writes_reject_foreign_entities() {
        let (storage, manager) = setup(false);
        let theirs = node(&globex(), "i-g");
        storage.upsert_node(theirs.clone()).await.unwrap();
        let scope = manager.for_tenant(&acme()).unwrap();

        assert!(is_violation(&scope.upsert_node(node(&globex(), "i-x")).await.unwrap_err()));
        // Same id, relabelled as ours: still a takeover.
        let hijack = theirs.clone().with_tenant(acme());
        assert!(is_violation(&scope.upsert_node(hijack).await.unwrap_err()));
        assert!(is_violation(&scope.delete_node(&theirs.id).await.unwrap_err()));
        assert!(storage.get_node(&theirs.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cross_tenant_edge_needs_cross_account_and_grant() {
        let (storage, manager) = setup(true);
        let ours = node(&acme(), "i-a");
        let theirs = node(&globex(), "i-g");
        storage.upsert_node(ours.clone()).await.unwrap();
        storage.upsert_node(theirs.clone()).await.unwrap();
        let scope = manager.for_tenant(&acme()).unwrap();

        let plain = GraphEdge::new(ours.id.clone(), RelationshipType::DependsOn, theirs.id.clone()).with_tenant(acme());
        assert!(is_violation(&scope.upsert_edge(plain).await.unwrap_err()));

        let bridge = GraphEdge::new(ours.id.clone(), RelationshipType::CrossAccount, theirs.id.clone()).with_tenant(acme());
        assert_eq!(scope.upsert_edge(bridge).await.unwrap(), UpsertOutcome::Created);
    }

    #[tokio::test]
    async fn meta_is_namespaced_per_tenant() {
        let (storage, manager) = setup(false);
        let a = manager.for_tenant(&acme()).unwrap();
        let g = manager.for_tenant(&globex()).unwrap();
        a.put_meta("k", b"a").await.unwrap();
        g.put_meta("k", b"g").await.unwrap();

        assert_eq!(a.get_meta("k").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(g.scan_meta_prefix("").await.unwrap(), vec![("k".to_string(), b"g".to_vec())]);
        assert_eq!(storage.get_meta("tenant/acme/k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn unknown_tenant_has_no_scope() {
        let (_storage, manager) = setup(false);
        assert!(matches!(
            manager.for_tenant(&TenantId::new("initech")),
            Err(TenantError::UnknownTenant { .. })
        ));
    }

    #[tokio::test]
    async fn discovery_links_metadata_references() {
        let (storage, manager) = setup(true);
        let peer_db = node(&globex(), "db-shared");
        let app = node(&acme(), "app-1")
            .with_metadata("env", serde_json::json!({ "DATABASE": "db-shared", "CACHE": "redis-9" }));
        storage.upsert_node(peer_db.clone()).await.unwrap();
        storage.upsert_node(app.clone()).await.unwrap();

        let report = manager.discover_cross_tenant(&acme(), &globex()).await.unwrap();
        assert_eq!(report.edges_created, 1);

        let edges = storage
            .query_edges(&EdgeFilter::new().relationship(RelationshipType::CrossAccount), &Pagination::all())
            .await
            .unwrap()
            .items;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_node_id, app.id);
        assert_eq!(edges[0].target_node_id, peer_db.id);
        assert_eq!(edges[0].tenant_id, acme());
        assert_eq!(edges[0].confidence, CROSS_TENANT_CONFIDENCE);

        let again = manager.discover_cross_tenant(&acme(), &globex()).await.unwrap();
        assert_eq!(again.edges_created, 0);
    }

    #[tokio::test]
    async fn discovery_refused_without_mutual_grant() {
        let (_storage, manager) = setup(false);
        let err = manager.discover_cross_tenant(&acme(), &globex()).await.unwrap_err();
        assert!(matches!(err, TenantError::IsolationViolation { .. }));
    }
}
