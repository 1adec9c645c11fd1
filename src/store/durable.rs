//! Embedded ACID-durable graph store backed by redb.
//!
//! One table per entity kind (`nodes`, `edges`, `node_versions`,
//! `edge_versions`, `snapshots`, `sync_records`) plus secondary index tables
//! for `(provider, resource_type)`, `account`, native ids, edge endpoints and
//! version timestamps. Entities are stored as JSON because metadata bags are
//! self-describing values.
//!
//! redb is synchronous, so every operation runs under
//! `tokio::task::spawn_blocking`; each upsert is one write transaction and
//! reads use MVCC snapshots.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::model::{
    EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Provider, Snapshot, SnapshotId,
    SnapshotSummary, SyncRecord, Timestamp, UpsertOutcome,
};

use super::{
    EdgeFilter, GraphStorage, NodeFilter, Page, Pagination, StoreResult, decode_u64, merge_edge,
    merge_node, paginate,
};

const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");
const NODE_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_versions");
const EDGE_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("edge_versions");
const SNAPSHOTS: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshots");
const SNAPSHOT_SUMMARIES: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshot_summaries");
const SYNC_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_records");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// `account␟provider␟native_id` → node id.
const IDX_NATIVE: TableDefinition<&str, &str> = TableDefinition::new("idx_native");
/// `provider␟resource_type␟node_id`.
const IDX_PROVIDER_TYPE: TableDefinition<&str, ()> = TableDefinition::new("idx_provider_type");
/// `account␟node_id`.
const IDX_ACCOUNT: TableDefinition<&str, ()> = TableDefinition::new("idx_account");
/// `node_id␟edge_id` for both endpoints of every edge.
const IDX_EDGE_ENDPOINT: TableDefinition<&str, ()> = TableDefinition::new("idx_edge_endpoint");
/// `recorded_at␟node_id␟version`.
const IDX_NODE_VERSION_TIME: TableDefinition<&str, ()> = TableDefinition::new("idx_node_version_time");
/// `recorded_at␟edge_id␟version`.
const IDX_EDGE_VERSION_TIME: TableDefinition<&str, ()> = TableDefinition::new("idx_edge_version_time");

/// Separator for composite keys; never appears in ids.
const SEP: char = '\u{1f}';

fn redb_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{context} failed: {e}"),
    }
}

fn key2(a: &str, b: &str) -> String {
    format!("{a}{SEP}{b}")
}

fn key3(a: &str, b: &str, c: &str) -> String {
    format!("{a}{SEP}{b}{SEP}{c}")
}

fn version_key(entity: &str, version: u64) -> String {
    format!("{entity}{SEP}{version:020}")
}

fn time_key(at: Timestamp, entity: &str, version: u64) -> String {
    format!("{at:020}{SEP}{entity}{SEP}{version:020}")
}

/// Split a `recorded_at␟entity␟version` index key back into `(entity, version)`.
fn parse_time_key(key: &str) -> Option<(String, u64)> {
    let mut parts = key.splitn(2, SEP);
    let _at = parts.next()?;
    let rest = parts.next()?;
    let (entity, version) = rest.rsplit_once(SEP)?;
    Some((entity.to_string(), version.parse().ok()?))
}

/// Keys of an index table starting with `prefix`, in key order.
fn scan_index(table: &impl ReadableTable<&'static str, ()>, prefix: &str) -> StoreResult<Vec<String>> {
    let mut keys = Vec::new();
    for item in table.range(prefix..).map_err(redb_err("range"))? {
        let (k, _) = item.map_err(redb_err("range item"))?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

/// `(key, value)` pairs of a byte table whose key starts with `prefix`.
fn scan_bytes(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for item in table.range(prefix..).map_err(redb_err("range"))? {
        let (k, v) = item.map_err(redb_err("range item"))?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.to_string(), v.value().to_vec()));
    }
    Ok(out)
}

fn strip_prefix_owned(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}

/// ACID-durable graph store using redb.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        Self::open_file(&data_dir.join("infragraph.redb"))
    }

    /// Open or create a durable store at an explicit file path.
    pub fn open_file(db_path: &Path) -> StoreResult<Self> {
        let db = Database::create(db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` against the database on the blocking thread pool.
    async fn blocking<T, F>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Backend {
                message: format!("{op}: {e}"),
            })?
    }

    fn create_tables(db: &Database) -> StoreResult<()> {
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            txn.open_table(EDGES).map_err(redb_err("open edges"))?;
            txn.open_table(NODE_VERSIONS).map_err(redb_err("open node_versions"))?;
            txn.open_table(EDGE_VERSIONS).map_err(redb_err("open edge_versions"))?;
            txn.open_table(SNAPSHOTS).map_err(redb_err("open snapshots"))?;
            txn.open_table(SNAPSHOT_SUMMARIES).map_err(redb_err("open snapshot_summaries"))?;
            txn.open_table(SYNC_RECORDS).map_err(redb_err("open sync_records"))?;
            txn.open_table(META).map_err(redb_err("open meta"))?;
            txn.open_table(IDX_NATIVE).map_err(redb_err("open idx_native"))?;
            txn.open_table(IDX_PROVIDER_TYPE).map_err(redb_err("open idx_provider_type"))?;
            txn.open_table(IDX_ACCOUNT).map_err(redb_err("open idx_account"))?;
            txn.open_table(IDX_EDGE_ENDPOINT).map_err(redb_err("open idx_edge_endpoint"))?;
            txn.open_table(IDX_NODE_VERSION_TIME).map_err(redb_err("open idx_node_version_time"))?;
            txn.open_table(IDX_EDGE_VERSION_TIME).map_err(redb_err("open idx_edge_version_time"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn write_nodes(db: &Database, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        let mut outcomes = Vec::with_capacity(nodes.len());
        {
            let mut table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            let mut native = txn.open_table(IDX_NATIVE).map_err(redb_err("open idx_native"))?;
            let mut by_type = txn
                .open_table(IDX_PROVIDER_TYPE)
                .map_err(redb_err("open idx_provider_type"))?;
            let mut by_account = txn.open_table(IDX_ACCOUNT).map_err(redb_err("open idx_account"))?;

            for node in nodes {
                let existing = match table.get(node.id.as_str()).map_err(redb_err("get node"))? {
                    Some(guard) => Some(serde_json::from_slice::<GraphNode>(guard.value())?),
                    None => None,
                };
                if let Some(old) = &existing {
                    native
                        .remove(key3(&old.account, old.provider.as_str(), &old.native_id).as_str())
                        .map_err(redb_err("remove idx_native"))?;
                    by_type
                        .remove(key3(old.provider.as_str(), old.resource_type.as_str(), old.id.as_str()).as_str())
                        .map_err(redb_err("remove idx_provider_type"))?;
                    by_account
                        .remove(key2(&old.account, old.id.as_str()).as_str())
                        .map_err(redb_err("remove idx_account"))?;
                }
                let (merged, outcome) = merge_node(existing, node);
                outcomes.push(outcome);

                let encoded = serde_json::to_vec(&merged)?;
                table
                    .insert(merged.id.as_str(), encoded.as_slice())
                    .map_err(redb_err("insert node"))?;
                native
                    .insert(
                        key3(&merged.account, merged.provider.as_str(), &merged.native_id).as_str(),
                        merged.id.as_str(),
                    )
                    .map_err(redb_err("insert idx_native"))?;
                by_type
                    .insert(
                        key3(merged.provider.as_str(), merged.resource_type.as_str(), merged.id.as_str())
                            .as_str(),
                        (),
                    )
                    .map_err(redb_err("insert idx_provider_type"))?;
                by_account
                    .insert(key2(&merged.account, merged.id.as_str()).as_str(), ())
                    .map_err(redb_err("insert idx_account"))?;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(outcomes)
    }

    fn write_edges(db: &Database, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        let mut outcomes = Vec::with_capacity(edges.len());
        {
            let nodes = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            let mut table = txn.open_table(EDGES).map_err(redb_err("open edges"))?;
            let mut endpoints = txn
                .open_table(IDX_EDGE_ENDPOINT)
                .map_err(redb_err("open idx_edge_endpoint"))?;

            for edge in edges {
                for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                    if nodes
                        .get(endpoint.as_str())
                        .map_err(redb_err("get node"))?
                        .is_none()
                    {
                        return Err(StoreError::DanglingEdge {
                            edge_id: edge.id.to_string(),
                            missing: endpoint.to_string(),
                        });
                    }
                }
                let existing = match table.get(edge.id.as_str()).map_err(redb_err("get edge"))? {
                    Some(guard) => Some(serde_json::from_slice::<GraphEdge>(guard.value())?),
                    None => None,
                };
                let (merged, outcome) = merge_edge(existing, edge);
                outcomes.push(outcome);

                let encoded = serde_json::to_vec(&merged)?;
                table
                    .insert(merged.id.as_str(), encoded.as_slice())
                    .map_err(redb_err("insert edge"))?;
                for endpoint in [&merged.source_node_id, &merged.target_node_id] {
                    endpoints
                        .insert(key2(endpoint.as_str(), merged.id.as_str()).as_str(), ())
                        .map_err(redb_err("insert idx_edge_endpoint"))?;
                }
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(outcomes)
    }

    fn remove_edge_in(
        edges: &mut redb::Table<'_, &'static str, &'static [u8]>,
        endpoints: &mut redb::Table<'_, &'static str, ()>,
        edge_id: &str,
    ) -> StoreResult<bool> {
        let removed = match edges.remove(edge_id).map_err(redb_err("remove edge"))? {
            Some(guard) => Some(serde_json::from_slice::<GraphEdge>(guard.value())?),
            None => None,
        };
        let Some(edge) = removed else {
            return Ok(false);
        };
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            endpoints
                .remove(key2(endpoint.as_str(), edge_id).as_str())
                .map_err(redb_err("remove idx_edge_endpoint"))?;
        }
        Ok(true)
    }

    fn read_nodes(db: &Database, filter: &NodeFilter) -> StoreResult<Vec<GraphNode>> {
        let txn = db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;

        // Narrow the candidate set through the most selective index available.
        let candidate_ids: Option<Vec<String>> = match (&filter.provider, &filter.account) {
            (Some(provider), _) if filter.resource_types.len() == 1 => {
                let index = txn
                    .open_table(IDX_PROVIDER_TYPE)
                    .map_err(redb_err("open idx_provider_type"))?;
                let mut ids = Vec::new();
                for rt in &filter.resource_types {
                    let prefix = format!("{}{SEP}{}{SEP}", provider.as_str(), rt.as_str());
                    ids.extend(scan_index(&index, &prefix)?.iter().map(|k| strip_prefix_owned(k, &prefix)));
                }
                Some(ids)
            }
            (Some(provider), _) => {
                let index = txn
                    .open_table(IDX_PROVIDER_TYPE)
                    .map_err(redb_err("open idx_provider_type"))?;
                let prefix = format!("{}{SEP}", provider.as_str());
                Some(
                    scan_index(&index, &prefix)?
                        .iter()
                        .filter_map(|k| k.rsplit_once(SEP).map(|(_, id)| id.to_string()))
                        .collect(),
                )
            }
            (None, Some(account)) => {
                let index = txn.open_table(IDX_ACCOUNT).map_err(redb_err("open idx_account"))?;
                let prefix = format!("{account}{SEP}");
                Some(
                    scan_index(&index, &prefix)?
                        .iter()
                        .map(|k| strip_prefix_owned(k, &prefix))
                        .collect(),
                )
            }
            (None, None) => None,
        };

        let mut out = Vec::new();
        match candidate_ids {
            Some(ids) => {
                for id in ids {
                    if let Some(guard) = table.get(id.as_str()).map_err(redb_err("get node"))? {
                        let node: GraphNode = serde_json::from_slice(guard.value())?;
                        if filter.matches(&node) {
                            out.push(node);
                        }
                    }
                }
            }
            None => {
                for item in table.iter().map_err(redb_err("iter nodes"))? {
                    let (_, v) = item.map_err(redb_err("iter item"))?;
                    let node: GraphNode = serde_json::from_slice(v.value())?;
                    if filter.matches(&node) {
                        out.push(node);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn read_edges(db: &Database, filter: &EdgeFilter) -> StoreResult<Vec<GraphEdge>> {
        let txn = db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(EDGES).map_err(redb_err("open edges"))?;

        let anchor = filter
            .source
            .as_ref()
            .or(filter.target.as_ref())
            .or(filter.touching.as_ref());

        let mut out = Vec::new();
        match anchor {
            Some(node) => {
                let index = txn
                    .open_table(IDX_EDGE_ENDPOINT)
                    .map_err(redb_err("open idx_edge_endpoint"))?;
                let prefix = format!("{}{SEP}", node.as_str());
                for key in scan_index(&index, &prefix)? {
                    let edge_id = strip_prefix_owned(&key, &prefix);
                    if let Some(guard) = table.get(edge_id.as_str()).map_err(redb_err("get edge"))? {
                        let edge: GraphEdge = serde_json::from_slice(guard.value())?;
                        if filter.matches(&edge) {
                            out.push(edge);
                        }
                    }
                }
            }
            None => {
                for item in table.iter().map_err(redb_err("iter edges"))? {
                    let (_, v) = item.map_err(redb_err("iter item"))?;
                    let edge: GraphEdge = serde_json::from_slice(v.value())?;
                    if filter.matches(&edge) {
                        out.push(edge);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out.dedup_by(|a, b| a.id == b.id);
        Ok(out)
    }

    /// Shared implementation of version appends for nodes and edges.
    #[allow(clippy::too_many_arguments)]
    fn put_version(
        db: &Database,
        versions: TableDefinition<'static, &'static str, &'static [u8]>,
        time_index: TableDefinition<'static, &'static str, ()>,
        entity: &str,
        version: u64,
        recorded_at: Timestamp,
        encoded: Vec<u8>,
        recorded_at_of: fn(&[u8]) -> StoreResult<Timestamp>,
    ) -> StoreResult<()> {
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(versions).map_err(redb_err("open versions"))?;
            let mut times = txn.open_table(time_index).map_err(redb_err("open version time index"))?;
            let key = version_key(entity, version);
            let previous_at = match table.get(key.as_str()).map_err(redb_err("get version"))? {
                Some(guard) => Some(recorded_at_of(guard.value())?),
                None => None,
            };
            if let Some(previous_at) = previous_at {
                times
                    .remove(time_key(previous_at, entity, version).as_str())
                    .map_err(redb_err("remove version time"))?;
            }
            table
                .insert(key.as_str(), encoded.as_slice())
                .map_err(redb_err("insert version"))?;
            times
                .insert(time_key(recorded_at, entity, version).as_str(), ())
                .map_err(redb_err("insert version time"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    /// Raw encoded versions recorded at or before `t`.
    fn versions_until(
        db: &Database,
        versions: TableDefinition<'static, &'static str, &'static [u8]>,
        time_index: TableDefinition<'static, &'static str, ()>,
        t: Timestamp,
    ) -> StoreResult<Vec<Vec<u8>>> {
        let txn = db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(versions).map_err(redb_err("open versions"))?;
        let times = txn.open_table(time_index).map_err(redb_err("open version time index"))?;
        let upper = format!("{:020}", t.saturating_add(1));
        let mut out = Vec::new();
        for item in times.range(..upper.as_str()).map_err(redb_err("range"))? {
            let (k, _) = item.map_err(redb_err("range item"))?;
            let Some((entity, version)) = parse_time_key(k.value()) else {
                continue;
            };
            if let Some(guard) = table
                .get(version_key(&entity, version).as_str())
                .map_err(redb_err("get version"))?
            {
                out.push(guard.value().to_vec());
            }
        }
        Ok(out)
    }

    fn prune_before(
        db: &Database,
        versions: TableDefinition<'static, &'static str, &'static [u8]>,
        time_index: TableDefinition<'static, &'static str, ()>,
        t: Timestamp,
    ) -> StoreResult<usize> {
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        let removed;
        {
            let mut table = txn.open_table(versions).map_err(redb_err("open versions"))?;
            let mut times = txn.open_table(time_index).map_err(redb_err("open version time index"))?;
            let upper = format!("{t:020}");
            let mut expired = Vec::new();
            for item in times.range(..upper.as_str()).map_err(redb_err("range"))? {
                let (k, _) = item.map_err(redb_err("range item"))?;
                expired.push(k.value().to_string());
            }
            for key in &expired {
                times.remove(key.as_str()).map_err(redb_err("remove version time"))?;
                if let Some((entity, version)) = parse_time_key(key) {
                    table
                        .remove(version_key(&entity, version).as_str())
                        .map_err(redb_err("remove version"))?;
                }
            }
            removed = expired.len();
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(removed)
    }
}

fn node_version_time(bytes: &[u8]) -> StoreResult<Timestamp> {
    Ok(serde_json::from_slice::<NodeVersion>(bytes)?.recorded_at)
}

fn edge_version_time(bytes: &[u8]) -> StoreResult<Timestamp> {
    Ok(serde_json::from_slice::<EdgeVersion>(bytes)?.recorded_at)
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}

#[async_trait]
impl GraphStorage for DurableStore {
    async fn initialize(&self) -> StoreResult<()> {
        self.blocking("initialize", Self::create_tables).await
    }

    async fn close(&self) -> StoreResult<()> {
        // redb flushes on every commit; dropping the handle releases the file lock.
        Ok(())
    }

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome> {
        let outcomes = self
            .blocking("upsert_node", move |db| Self::write_nodes(db, vec![node]))
            .await?;
        Ok(outcomes.into_iter().next().unwrap_or(UpsertOutcome::Unchanged))
    }

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        self.blocking("upsert_nodes", move |db| Self::write_nodes(db, nodes))
            .await
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome> {
        let outcomes = self
            .blocking("upsert_edge", move |db| Self::write_edges(db, vec![edge]))
            .await?;
        Ok(outcomes.into_iter().next().unwrap_or(UpsertOutcome::Unchanged))
    }

    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        self.blocking("upsert_edges", move |db| Self::write_edges(db, edges))
            .await
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>> {
        let id = id.clone();
        self.blocking("get_node", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            match table.get(id.as_str()).map_err(redb_err("get node"))? {
                Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>> {
        let key = key3(account, provider.as_str(), native_id);
        self.blocking("get_node_by_native_id", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let index = txn.open_table(IDX_NATIVE).map_err(redb_err("open idx_native"))?;
            let Some(id) = index
                .get(key.as_str())
                .map_err(redb_err("get idx_native"))?
                .map(|guard| guard.value().to_string())
            else {
                return Ok(None);
            };
            let table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            match table.get(id.as_str()).map_err(redb_err("get node"))? {
                Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>> {
        let id = id.clone();
        self.blocking("get_edge", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn.open_table(EDGES).map_err(redb_err("open edges"))?;
            match table.get(id.as_str()).map_err(redb_err("get edge"))? {
                Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>> {
        let filter = filter.clone();
        let matches = self
            .blocking("query_nodes", move |db| Self::read_nodes(db, &filter))
            .await?;
        Ok(paginate(matches, page, |n| n.id.as_str()))
    }

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>> {
        let filter = filter.clone();
        let matches = self
            .blocking("query_edges", move |db| Self::read_edges(db, &filter))
            .await?;
        Ok(paginate(matches, page, |e| e.id.as_str()))
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool> {
        let id = id.clone();
        self.blocking("delete_node", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            let existed;
            {
                let mut table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
                let removed = match table.remove(id.as_str()).map_err(redb_err("remove node"))? {
                    Some(guard) => Some(serde_json::from_slice::<GraphNode>(guard.value())?),
                    None => None,
                };
                existed = removed.is_some();
                if let Some(old) = removed {
                    let mut native = txn.open_table(IDX_NATIVE).map_err(redb_err("open idx_native"))?;
                    native
                        .remove(key3(&old.account, old.provider.as_str(), &old.native_id).as_str())
                        .map_err(redb_err("remove idx_native"))?;
                    let mut by_type = txn
                        .open_table(IDX_PROVIDER_TYPE)
                        .map_err(redb_err("open idx_provider_type"))?;
                    by_type
                        .remove(key3(old.provider.as_str(), old.resource_type.as_str(), old.id.as_str()).as_str())
                        .map_err(redb_err("remove idx_provider_type"))?;
                    let mut by_account = txn.open_table(IDX_ACCOUNT).map_err(redb_err("open idx_account"))?;
                    by_account
                        .remove(key2(&old.account, old.id.as_str()).as_str())
                        .map_err(redb_err("remove idx_account"))?;

                    let mut edges = txn.open_table(EDGES).map_err(redb_err("open edges"))?;
                    let mut endpoints = txn
                        .open_table(IDX_EDGE_ENDPOINT)
                        .map_err(redb_err("open idx_edge_endpoint"))?;
                    let prefix = format!("{}{SEP}", id.as_str());
                    for key in scan_index(&endpoints, &prefix)? {
                        let edge_id = strip_prefix_owned(&key, &prefix);
                        Self::remove_edge_in(&mut edges, &mut endpoints, &edge_id)?;
                    }
                }
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(existed)
        })
        .await
    }

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool> {
        let id = id.clone();
        self.blocking("delete_edge", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            let existed;
            {
                let mut edges = txn.open_table(EDGES).map_err(redb_err("open edges"))?;
                let mut endpoints = txn
                    .open_table(IDX_EDGE_ENDPOINT)
                    .map_err(redb_err("open idx_edge_endpoint"))?;
                existed = Self::remove_edge_in(&mut edges, &mut endpoints, id.as_str())?;
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(existed)
        })
        .await
    }

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()> {
        let encoded = serde_json::to_vec(&version)?;
        self.blocking("append_node_version", move |db| {
            Self::put_version(
                db,
                NODE_VERSIONS,
                IDX_NODE_VERSION_TIME,
                version.node_id.as_str(),
                version.version,
                version.recorded_at,
                encoded,
                node_version_time,
            )
        })
        .await
    }

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()> {
        let encoded = serde_json::to_vec(&version)?;
        self.blocking("append_edge_version", move |db| {
            Self::put_version(
                db,
                EDGE_VERSIONS,
                IDX_EDGE_VERSION_TIME,
                version.edge_id.as_str(),
                version.version,
                version.recorded_at,
                encoded,
                edge_version_time,
            )
        })
        .await
    }

    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>> {
        let prefix = format!("{}{SEP}", id.as_str());
        let raw = self
            .blocking("node_versions", move |db| {
                let txn = db.begin_read().map_err(redb_err("begin_read"))?;
                let table = txn.open_table(NODE_VERSIONS).map_err(redb_err("open node_versions"))?;
                scan_bytes(&table, &prefix)
            })
            .await?;
        let mut chain = raw
            .iter()
            .map(|(_, v)| serde_json::from_slice::<NodeVersion>(v))
            .collect::<Result<Vec<_>, _>>()?;
        chain.sort_by_key(|v| (v.recorded_at, v.version));
        Ok(chain)
    }

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>> {
        let prefix = format!("{}{SEP}", id.as_str());
        let raw = self
            .blocking("edge_versions", move |db| {
                let txn = db.begin_read().map_err(redb_err("begin_read"))?;
                let table = txn.open_table(EDGE_VERSIONS).map_err(redb_err("open edge_versions"))?;
                scan_bytes(&table, &prefix)
            })
            .await?;
        let mut chain = raw
            .iter()
            .map(|(_, v)| serde_json::from_slice::<EdgeVersion>(v))
            .collect::<Result<Vec<_>, _>>()?;
        chain.sort_by_key(|v| (v.recorded_at, v.version));
        Ok(chain)
    }

    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>> {
        let raw = self
            .blocking("node_versions_until", move |db| {
                Self::versions_until(db, NODE_VERSIONS, IDX_NODE_VERSION_TIME, t)
            })
            .await?;
        let mut out = raw
            .iter()
            .map(|v| serde_json::from_slice::<NodeVersion>(v))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| (&a.node_id, a.version).cmp(&(&b.node_id, b.version)));
        Ok(out)
    }

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>> {
        let raw = self
            .blocking("edge_versions_until", move |db| {
                Self::versions_until(db, EDGE_VERSIONS, IDX_EDGE_VERSION_TIME, t)
            })
            .await?;
        let mut out = raw
            .iter()
            .map(|v| serde_json::from_slice::<EdgeVersion>(v))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| (&a.edge_id, a.version).cmp(&(&b.edge_id, b.version)));
        Ok(out)
    }

    async fn prune_versions_before(&self, t: Timestamp) -> StoreResult<usize> {
        self.blocking("prune_versions_before", move |db| {
            let nodes = Self::prune_before(db, NODE_VERSIONS, IDX_NODE_VERSION_TIME, t)?;
            let edges = Self::prune_before(db, EDGE_VERSIONS, IDX_EDGE_VERSION_TIME, t)?;
            Ok(nodes + edges)
        })
        .await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let id = snapshot.id.0;
        let encoded = serde_json::to_vec(snapshot)?;
        let summary = serde_json::to_vec(&snapshot.summary())?;
        self.blocking("save_snapshot", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            {
                let mut table = txn.open_table(SNAPSHOTS).map_err(redb_err("open snapshots"))?;
                table
                    .insert(id, encoded.as_slice())
                    .map_err(redb_err("insert snapshot"))?;
                let mut summaries = txn
                    .open_table(SNAPSHOT_SUMMARIES)
                    .map_err(redb_err("open snapshot_summaries"))?;
                summaries
                    .insert(id, summary.as_slice())
                    .map_err(redb_err("insert snapshot summary"))?;
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(())
        })
        .await
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>> {
        self.blocking("get_snapshot", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn.open_table(SNAPSHOTS).map_err(redb_err("open snapshots"))?;
            match table.get(id.0).map_err(redb_err("get snapshot"))? {
                Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        self.blocking("list_snapshots", |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn
                .open_table(SNAPSHOT_SUMMARIES)
                .map_err(redb_err("open snapshot_summaries"))?;
            let mut out = Vec::new();
            for item in table.iter().map_err(redb_err("iter snapshots"))? {
                let (_, v) = item.map_err(redb_err("iter item"))?;
                out.push(serde_json::from_slice(v.value())?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_snapshot(&self, id: SnapshotId) -> StoreResult<bool> {
        self.blocking("delete_snapshot", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            let existed;
            {
                let mut table = txn.open_table(SNAPSHOTS).map_err(redb_err("open snapshots"))?;
                existed = table.remove(id.0).map_err(redb_err("remove snapshot"))?.is_some();
                let mut summaries = txn
                    .open_table(SNAPSHOT_SUMMARIES)
                    .map_err(redb_err("open snapshot_summaries"))?;
                summaries
                    .remove(id.0)
                    .map_err(redb_err("remove snapshot summary"))?;
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(existed)
        })
        .await
    }

    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)> {
        self.blocking("capture_state", |db| {
            // A single read transaction gives one MVCC view of both tables.
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let nodes_table = txn.open_table(NODES).map_err(redb_err("open nodes"))?;
            let edges_table = txn.open_table(EDGES).map_err(redb_err("open edges"))?;
            let mut nodes = Vec::new();
            for item in nodes_table.iter().map_err(redb_err("iter nodes"))? {
                let (_, v) = item.map_err(redb_err("iter item"))?;
                nodes.push(serde_json::from_slice::<GraphNode>(v.value())?);
            }
            let mut edges = Vec::new();
            for item in edges_table.iter().map_err(redb_err("iter edges"))? {
                let (_, v) = item.map_err(redb_err("iter item"))?;
                edges.push(serde_json::from_slice::<GraphEdge>(v.value())?);
            }
            Ok((nodes, edges))
        })
        .await
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        let key = format!("{:020}{SEP}{}", record.started_at, record.id);
        let encoded = serde_json::to_vec(record)?;
        self.blocking("save_sync_record", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            {
                let mut table = txn.open_table(SYNC_RECORDS).map_err(redb_err("open sync_records"))?;
                table
                    .insert(key.as_str(), encoded.as_slice())
                    .map_err(redb_err("insert sync record"))?;
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(())
        })
        .await
    }

    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        let raw = self
            .blocking("list_sync_records", |db| {
                let txn = db.begin_read().map_err(redb_err("begin_read"))?;
                let table = txn.open_table(SYNC_RECORDS).map_err(redb_err("open sync_records"))?;
                scan_bytes(&table, "")
            })
            .await?;
        let records = raw
            .iter()
            .map(|(_, v)| serde_json::from_slice::<SyncRecord>(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records
            .into_iter()
            .filter(|r| adapter_id.is_none_or(|a| r.adapter_id == a))
            .collect())
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_vec();
        self.blocking("put_meta", move |db| {
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            {
                let mut table = txn.open_table(META).map_err(redb_err("open meta"))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(redb_err("insert meta"))?;
            }
            txn.commit().map_err(redb_err("commit"))?;
            Ok(())
        })
        .await
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking("get_meta", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn.open_table(META).map_err(redb_err("open meta"))?;
            let value = table.get(key.as_str()).map_err(redb_err("get meta"))?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
        .await
    }

    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.blocking("scan_meta_prefix", move |db| {
            let txn = db.begin_read().map_err(redb_err("begin_read"))?;
            let table = txn.open_table(META).map_err(redb_err("open meta"))?;
            scan_bytes(&table, &prefix)
        })
        .await
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let key = key.to_string();
        self.blocking("next_sequence", move |db| {
            // redb serializes write transactions, so read and bump are atomic.
            let txn = db.begin_write().map_err(redb_err("begin_write"))?;
            let next = {
                let mut table = txn.open_table(META).map_err(redb_err("open meta"))?;
                let current = match table.get(key.as_str()).map_err(redb_err("get meta"))? {
                    Some(guard) => decode_u64(guard.value())?,
                    None => 0,
                };
                let next = current + 1;
                table
                    .insert(key.as_str(), next.to_be_bytes().as_slice())
                    .map_err(redb_err("insert meta"))?;
                next
            };
            txn.commit().map_err(redb_err("commit"))?;
            Ok(next)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationshipType, ResourceType};
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> DurableStore {
        let store = DurableStore::open(dir.path()).unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn db(native: &str) -> GraphNode {
        GraphNode::new("aws", "111", "us-east-1", ResourceType::Database, native, native)
    }

    #[tokio::test]
    async fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let node = db("db-1");
        {
            let store = open(&dir).await;
            store.upsert_node(node.clone()).await.unwrap();
            store.put_meta("seq:snapshot", &7u64.to_be_bytes()).await.unwrap();
        }
        let store = open(&dir).await;
        assert_eq!(store.get_node(&node.id).await.unwrap(), Some(node));
        assert_eq!(
            store.get_meta("seq:snapshot").await.unwrap(),
            Some(7u64.to_be_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn provider_type_index_narrows_queries() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.upsert_node(db("db-1")).await.unwrap();
        store
            .upsert_node(GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, "i-1", "web"))
            .await
            .unwrap();
        store
            .upsert_node(GraphNode::new("gcp", "p1", "europe-west1", ResourceType::Database, "sql-1", "sql"))
            .await
            .unwrap();

        let filter = NodeFilter::new().provider("aws").resource_type(ResourceType::Database);
        let page = store.query_nodes(&filter, &Pagination::all()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].native_id, "db-1");

        let page = store
            .query_nodes(&NodeFilter::new().account("p1"), &Pagination::all())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn rewritten_version_moves_time_index() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let node = db("db-1");
        let version = NodeVersion {
            node_id: node.id.clone(),
            version: 1,
            recorded_at: 100,
            change: crate::model::ChangeKind::Created,
            node,
        };
        store.append_node_version(version.clone()).await.unwrap();
        store
            .append_node_version(NodeVersion {
                recorded_at: 500,
                ..version
            })
            .await
            .unwrap();
        assert!(store.node_versions_until(200).await.unwrap().is_empty());
        assert_eq!(store.node_versions_until(500).await.unwrap().len(), 1);
        assert_eq!(store.prune_versions_before(500).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_node_cascades_edges() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let a = db("a");
        let b = db("b");
        store.upsert_nodes(vec![a.clone(), b.clone()]).await.unwrap();
        store
            .upsert_edge(GraphEdge::new(a.id.clone(), RelationshipType::Replicates, b.id.clone()))
            .await
            .unwrap();
        assert!(store.delete_node(&a.id).await.unwrap());
        let edges = store
            .query_edges(&EdgeFilter::new(), &Pagination::all())
            .await
            .unwrap();
        assert!(edges.items.is_empty());
        let incident = store
            .query_edges(&EdgeFilter::new().touching(b.id.clone()), &Pagination::all())
            .await
            .unwrap();
        assert!(incident.items.is_empty());
    }
}
