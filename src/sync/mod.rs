//! Incremental synchronization of storage with discovery adapter output.
//!
//! One call to [`SyncEngine::run_cycle`] is one discovery + reconciliation
//! cycle for one adapter:
//!
//! 1. Each discovery scope (one per requested resource type, or a single
//!    unscoped pass) is drained with [`pool::process_paginated`]; scopes run
//!    concurrently through [`pool::process_pooled`], capped at `concurrency`.
//! 2. Candidates are stamped with tenant and time, hashed without volatile
//!    fields, and compared with the hash cache (primed from storage on a
//!    miss). Presence and ownership are always checked against storage: a
//!    record held by another tenant is skipped with an ownership issue.
//!    Only changed entities are written, in `batch_size` chunks via
//!    [`pool::process_batched`], each change appending a temporal version.
//! 3. Only when every page of every scope loaded and the cycle was not
//!    cancelled, known nodes of the adapter's provider/account that were not
//!    seen are marked `Disappeared`. They are never removed.
//! 4. A [`SyncRecord`] is persisted.
//!
//! Page and record failures are collected as [`SyncIssue`]s; storage errors
//! end the cycle.

pub mod adapter;
pub mod cancel;
pub mod error;
pub mod hash;
pub mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{
    ChangeKind, GraphEdge, GraphNode, NodeId, NodeStatus, ResourceType, SyncRecord, TenantId,
    Timestamp, UpsertOutcome,
};
use crate::store::{GraphStorage, NodeFilter, Pagination};
use crate::temporal::TemporalStore;

pub use adapter::{AdapterRegistry, DiscoveryAdapter, DiscoveryBatch, DiscoveryOptions};
pub use cancel::CancelToken;
pub use error::{DiscoveryError, IssueKind, SyncError, SyncIssue, SyncResult};

const SYNC_SEQUENCE_KEY: &str = "seq:sync";

/// Per-cycle knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub tenant: TenantId,
    /// Discovery scopes; empty means one unscoped pass.
    pub resource_types: Vec<ResourceType>,
    pub batch_size: usize,
    /// Maximum concurrent discovery scopes.
    pub concurrency: usize,
    /// Turn the first recorded issue into [`SyncError::Aborted`].
    pub fail_fast: bool,
    pub page_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            tenant: TenantId::default(),
            resource_types: Vec::new(),
            batch_size: 500,
            concurrency: 4,
            fail_fast: false,
            page_limit: 1000,
        }
    }
}

impl SyncOptions {
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant,
            ..Self::default()
        }
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalSyncResult {
    pub adapter_id: String,
    pub created: usize,
    pub updated: usize,
    pub disappeared: usize,
    pub unchanged: usize,
    pub edges_created: usize,
    pub edges_updated: usize,
    /// Candidate nodes received from the adapter.
    pub nodes_processed: usize,
    pub duration_ms: u64,
    pub errors: Vec<SyncIssue>,
    /// Every page of every scope loaded.
    pub complete: bool,
    pub cancelled: bool,
}

impl IncrementalSyncResult {
    /// Number of entity writes the cycle performed.
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.disappeared + self.edges_created + self.edges_updated
    }
}

/// Everything one discovery scope produced.
#[derive(Debug, Default)]
struct ScopeOutcome {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    issues: Vec<SyncIssue>,
    complete: bool,
    cancelled: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteCounts {
    created: usize,
    updated: usize,
    unchanged: usize,
}

impl WriteCounts {
    fn add(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn merge(mut self, other: WriteCounts) -> Self {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self
    }
}

/// Reconciles storage with discovery adapters.
pub struct SyncEngine {
    storage: Arc<dyn GraphStorage>,
    temporal: Arc<TemporalStore>,
    /// Last written content hash per `tenant␟kind␟id`.
    hashes: DashMap<String, String>,
}

impl SyncEngine {
    pub fn new(storage: Arc<dyn GraphStorage>, temporal: Arc<TemporalStore>) -> Self {
        Self {
            storage,
            temporal,
            hashes: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn GraphStorage> {
        &self.storage
    }

    /// Forget cached hashes; the next cycle re-primes from storage.
    pub fn clear_hash_cache(&self) {
        self.hashes.clear();
    }

    fn hash_key(tenant: &TenantId, kind: &str, id: &str) -> String {
        format!("{tenant}\u{1f}{kind}\u{1f}{id}")
    }

    /// Run one discovery + reconciliation cycle for `adapter`.
    pub async fn run_cycle(
        &self,
        adapter: Arc<dyn DiscoveryAdapter>,
        options: &SyncOptions,
        cancel: &CancelToken,
    ) -> SyncResult<IncrementalSyncResult> {
        let timer = Instant::now();
        let started_at = self.temporal.clock().now();
        let adapter_id = adapter.id().to_string();
        tracing::info!(adapter = %adapter_id, tenant = %options.tenant, "sync cycle starting");

        // -- discovery ------------------------------------------------------
        let scopes: Vec<Option<ResourceType>> = if options.resource_types.is_empty() {
            vec![None]
        } else {
            options.resource_types.iter().copied().map(Some).collect()
        };
        let page_limit = options.page_limit;
        let scope_cancel = cancel.clone();
        let discover_adapter = Arc::clone(&adapter);
        let outcomes = pool::process_pooled(scopes, options.concurrency, cancel, move |scope| {
            drain_scope(Arc::clone(&discover_adapter), scope, page_limit, scope_cancel.clone())
        })
        .await?;

        let mut result = IncrementalSyncResult {
            adapter_id: adapter_id.clone(),
            complete: true,
            ..Default::default()
        };
        let mut node_candidates: BTreeMap<NodeId, GraphNode> = BTreeMap::new();
        let mut edge_candidates = BTreeMap::new();
        for outcome in outcomes {
            result.complete &= outcome.complete;
            result.cancelled |= outcome.cancelled;
            result.nodes_processed += outcome.nodes.len();
            result.errors.extend(outcome.issues);
            for node in outcome.nodes {
                node_candidates.insert(node.id.clone(), node);
            }
            for edge in outcome.edges {
                edge_candidates.insert(edge.id.clone(), edge);
            }
        }
        if cancel.is_cancelled() {
            result.cancelled = true;
        }
        for issue in &result.errors {
            tracing::warn!(adapter = %adapter_id, issue = %issue, "sync issue recorded");
        }
        self.check_fail_fast(&adapter_id, options, started_at, &result).await?;

        // -- nodes ------------------------------------------------------------
        let now = self.temporal.clock().now();
        let seen: BTreeSet<NodeId> = node_candidates.keys().cloned().collect();
        let mut changed_nodes = Vec::new();
        for (_, mut node) in node_candidates {
            stamp_node(&mut node, &options.tenant, now);
            let digest = hash::node_hash(&node);
            let key = Self::hash_key(&options.tenant, "node", node.id.as_str());
            match self.stored_node_hash(&key, &options.tenant, &node.id).await? {
                StoredHash::Foreign(owner) => {
                    result.errors.push(foreign_issue("node", node.id.as_str(), &owner));
                }
                StoredHash::Known(stored) if stored == digest => result.unchanged += 1,
                _ => changed_nodes.push((node, digest, key)),
            }
        }
        self.check_fail_fast(&adapter_id, options, started_at, &result).await?;

        let written = pool::process_batched(changed_nodes, options.batch_size, cancel, |batch| {
            self.write_node_batch(batch)
        })
        .await?;
        let counts = written
            .results
            .into_iter()
            .fold(WriteCounts::default(), WriteCounts::merge);
        result.created += counts.created;
        result.updated += counts.updated;
        result.unchanged += counts.unchanged;
        result.cancelled |= written.cancelled;

        // -- edges ------------------------------------------------------------
        if !result.cancelled {
            let mut changed_edges = Vec::new();
            for (_, mut edge) in edge_candidates {
                edge.tenant_id = options.tenant.clone();
                edge.created_at = now;
                edge.last_seen_at = now;
                if let Some(missing) = self.missing_endpoint(&edge, &seen).await? {
                    result.errors.push(SyncIssue {
                        kind: IssueKind::Edge,
                        scope: None,
                        cursor: None,
                        message: format!("edge {} references missing node {missing}", edge.id),
                        recoverable: true,
                    });
                    continue;
                }
                let digest = hash::edge_hash(&edge);
                let key = Self::hash_key(&options.tenant, "edge", edge.id.as_str());
                match self.stored_edge_hash(&key, &options.tenant, &edge).await? {
                    StoredHash::Foreign(owner) => {
                        result.errors.push(foreign_issue("edge", edge.id.as_str(), &owner));
                    }
                    StoredHash::Known(stored) if stored == digest => {}
                    _ => changed_edges.push((edge, digest, key)),
                }
            }
            self.check_fail_fast(&adapter_id, options, started_at, &result).await?;

            let written = pool::process_batched(changed_edges, options.batch_size, cancel, |batch| {
                self.write_edge_batch(batch)
            })
            .await?;
            let counts = written
                .results
                .into_iter()
                .fold(WriteCounts::default(), WriteCounts::merge);
            result.edges_created += counts.created;
            result.edges_updated += counts.updated;
            result.cancelled |= written.cancelled;
        }

        // -- disappearance sweep ----------------------------------------------
        if result.cancelled {
            result.complete = false;
        } else if result.complete {
            result.disappeared = self
                .sweep_disappeared(adapter.as_ref(), options, &seen, now, cancel)
                .await?;
        } else {
            tracing::info!(adapter = %adapter_id, "discovery incomplete, skipping disappearance sweep");
        }

        result.duration_ms = timer.elapsed().as_millis() as u64;
        self.save_record(&result, &options.tenant, started_at).await?;
        tracing::info!(
            adapter = %adapter_id,
            created = result.created,
            updated = result.updated,
            disappeared = result.disappeared,
            unchanged = result.unchanged,
            errors = result.errors.len(),
            complete = result.complete,
            cancelled = result.cancelled,
            duration_ms = result.duration_ms,
            "sync cycle complete"
        );
        Ok(result)
    }

    async fn check_fail_fast(
        &self,
        adapter_id: &str,
        options: &SyncOptions,
        started_at: Timestamp,
        result: &IncrementalSyncResult,
    ) -> SyncResult<()> {
        if !options.fail_fast {
            return Ok(());
        }
        let Some(first) = result.errors.first() else {
            return Ok(());
        };
        let mut aborted = result.clone();
        aborted.complete = false;
        self.save_record(&aborted, &options.tenant, started_at).await?;
        Err(SyncError::Aborted {
            adapter_id: adapter_id.to_string(),
            issue: first.to_string(),
        })
    }

    /// Hash of the stored node, from the cache when it is warm.
    ///
    /// Presence and ownership are always read from storage, so nodes deleted
    /// or reassigned behind the engine's back are not mistaken for unchanged.
    async fn stored_node_hash(&self, key: &str, tenant: &TenantId, id: &NodeId) -> SyncResult<StoredHash> {
        let Some(stored) = self.storage.get_node(id).await? else {
            self.hashes.remove(key);
            return Ok(StoredHash::Missing);
        };
        if &stored.tenant_id != tenant {
            self.hashes.remove(key);
            return Ok(StoredHash::Foreign(stored.tenant_id));
        }
        Ok(StoredHash::Known(self.prime(key, || hash::node_hash(&stored))))
    }

    async fn stored_edge_hash(&self, key: &str, tenant: &TenantId, edge: &GraphEdge) -> SyncResult<StoredHash> {
        let Some(stored) = self.storage.get_edge(&edge.id).await? else {
            self.hashes.remove(key);
            return Ok(StoredHash::Missing);
        };
        if &stored.tenant_id != tenant {
            self.hashes.remove(key);
            return Ok(StoredHash::Foreign(stored.tenant_id));
        }
        Ok(StoredHash::Known(self.prime(key, || hash::edge_hash(&stored))))
    }

    fn prime(&self, key: &str, digest: impl FnOnce() -> String) -> String {
        self.hashes.entry(key.to_string()).or_insert_with(digest).value().clone()
    }

    /// First endpoint of `edge` that is neither a candidate of this cycle nor stored.
    async fn missing_endpoint(&self, edge: &GraphEdge, seen: &BTreeSet<NodeId>) -> SyncResult<Option<NodeId>> {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if seen.contains(endpoint) {
                continue;
            }
            if self.storage.get_node(endpoint).await?.is_none() {
                return Ok(Some(endpoint.clone()));
            }
        }
        Ok(None)
    }

    async fn write_node_batch(&self, batch: Vec<(GraphNode, String, String)>) -> SyncResult<WriteCounts> {
        let nodes: Vec<GraphNode> = batch.iter().map(|(n, _, _)| n.clone()).collect();
        let outcomes = self.storage.upsert_nodes(nodes).await?;
        let mut counts = WriteCounts::default();
        for ((node, digest, key), outcome) in batch.into_iter().zip(outcomes) {
            counts.add(outcome);
            let change = match outcome {
                UpsertOutcome::Created => Some(ChangeKind::Created),
                UpsertOutcome::Updated => Some(ChangeKind::Updated),
                UpsertOutcome::Unchanged => None,
            };
            if let Some(change) = change {
                let stored = self.storage.get_node(&node.id).await?.unwrap_or(node);
                self.temporal.record_node_change(&stored, change).await?;
            }
            self.hashes.insert(key, digest);
        }
        tracing::debug!(created = counts.created, updated = counts.updated, "node batch written");
        Ok(counts)
    }

    async fn write_edge_batch(&self, batch: Vec<(GraphEdge, String, String)>) -> SyncResult<WriteCounts> {
        let edges: Vec<GraphEdge> = batch.iter().map(|(e, _, _)| e.clone()).collect();
        let outcomes = self.storage.upsert_edges(edges).await?;
        let mut counts = WriteCounts::default();
        for ((edge, digest, key), outcome) in batch.into_iter().zip(outcomes) {
            counts.add(outcome);
            let change = match outcome {
                UpsertOutcome::Created => Some(ChangeKind::Created),
                UpsertOutcome::Updated => Some(ChangeKind::Updated),
                UpsertOutcome::Unchanged => None,
            };
            if let Some(change) = change {
                let stored = self.storage.get_edge(&edge.id).await?.unwrap_or(edge);
                self.temporal.record_edge_change(&stored, change).await?;
            }
            self.hashes.insert(key, digest);
        }
        tracing::debug!(created = counts.created, updated = counts.updated, "edge batch written");
        Ok(counts)
    }

    /// Mark known, active nodes in the adapter's scope that were not seen.
    async fn sweep_disappeared(
        &self,
        adapter: &dyn DiscoveryAdapter,
        options: &SyncOptions,
        seen: &BTreeSet<NodeId>,
        now: Timestamp,
        cancel: &CancelToken,
    ) -> SyncResult<usize> {
        let mut filter = NodeFilter::new()
            .tenant(options.tenant.clone())
            .account(adapter.account())
            .active_only();
        filter.provider = Some(adapter.provider());
        filter.resource_types = options.resource_types.iter().copied().collect();

        let known = self.storage.query_nodes(&filter, &Pagination::all()).await?;
        let vanished: Vec<GraphNode> = known
            .items
            .into_iter()
            .filter(|n| !seen.contains(&n.id))
            .map(|mut n| {
                n.status = NodeStatus::Disappeared;
                n.updated_at = now;
                n
            })
            .collect();

        let tenant = options.tenant.clone();
        let swept = pool::process_batched(vanished, options.batch_size, cancel, |batch| {
            let tenant = tenant.clone();
            async move {
                let outcomes = self.storage.upsert_nodes(batch.clone()).await?;
                let mut count = 0;
                for (node, outcome) in batch.into_iter().zip(outcomes) {
                    if outcome == UpsertOutcome::Unchanged {
                        continue;
                    }
                    count += 1;
                    self.temporal.record_node_change(&node, ChangeKind::Disappeared).await?;
                    self.hashes.insert(
                        Self::hash_key(&tenant, "node", node.id.as_str()),
                        hash::node_hash(&node),
                    );
                }
                Ok::<usize, SyncError>(count)
            }
        })
        .await?;
        Ok(swept.results.into_iter().sum())
    }

    async fn save_record(
        &self,
        result: &IncrementalSyncResult,
        tenant: &TenantId,
        started_at: Timestamp,
    ) -> SyncResult<()> {
        let seq = self.storage.next_sequence(SYNC_SEQUENCE_KEY).await?;
        let record = SyncRecord {
            id: format!("{tenant}-{}-{started_at}-{seq}", result.adapter_id),
            adapter_id: result.adapter_id.clone(),
            tenant_id: tenant.clone(),
            started_at,
            finished_at: self.temporal.clock().now(),
            created: result.created,
            updated: result.updated,
            disappeared: result.disappeared,
            unchanged: result.unchanged,
            errors: result.errors.iter().map(ToString::to_string).collect(),
            complete: result.complete,
            cancelled: result.cancelled,
        };
        self.storage.save_sync_record(&record).await?;
        Ok(())
    }
}

/// What storage holds for a candidate.
enum StoredHash {
    Missing,
    Foreign(TenantId),
    Known(String),
}

fn foreign_issue(kind: &str, id: &str, owner: &TenantId) -> SyncIssue {
    SyncIssue {
        kind: IssueKind::Ownership,
        scope: None,
        cursor: None,
        message: format!("{kind} {id} belongs to tenant {owner}"),
        recoverable: true,
    }
}

/// Stamp a candidate with its tenant and the cycle time. Merging keeps the
/// stored creation times, so stamping `created_at` only matters for new nodes.
fn stamp_node(node: &mut GraphNode, tenant: &TenantId, now: Timestamp) {
    node.tenant_id = tenant.clone();
    node.discovered_at = now;
    node.created_at = now;
    node.updated_at = now;
    node.last_seen_at = now;
}

/// Drain every page of one discovery scope.
async fn drain_scope(
    adapter: Arc<dyn DiscoveryAdapter>,
    scope: Option<ResourceType>,
    page_limit: usize,
    cancel: CancelToken,
) -> ScopeOutcome {
    let scope_name = scope.map(|rt| rt.as_str().to_string());
    let paginated = pool::process_paginated(&cancel, |cursor| {
        let adapter = Arc::clone(&adapter);
        let options = DiscoveryOptions {
            resource_type: scope,
            cursor,
            page_limit,
        };
        async move {
            let batch = adapter.discover(&options).await?;
            let next = batch.next_cursor.clone();
            Ok((batch, next))
        }
    })
    .await;

    let mut outcome = ScopeOutcome {
        complete: paginated.complete,
        cancelled: paginated.cancelled,
        ..Default::default()
    };
    for failure in &paginated.failures {
        outcome.issues.push(SyncIssue::from_discovery(
            IssueKind::Page,
            scope_name.clone(),
            failure.cursor.clone(),
            &failure.error,
        ));
    }
    for batch in paginated.pages {
        for error in &batch.errors {
            // A record the adapter could not read may still exist upstream.
            outcome.complete = false;
            outcome.issues.push(SyncIssue::from_discovery(
                IssueKind::Record,
                scope_name.clone(),
                None,
                error,
            ));
        }
        outcome.nodes.extend(batch.nodes);
        outcome.edges.extend(batch.edges);
    }
    outcome
}
