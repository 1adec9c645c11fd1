//! Networked SQL graph store through sqlx's `Any` driver.
//!
//! MySQL for shared deployments, SQLite (`sqlite://path?mode=rwc`) for local
//! use and tests. Identity and index columns are real columns so filters can
//! be pushed down; the full entity is kept in a `body` TEXT column as JSON.
//!
//! ```sql
//! CREATE TABLE ig_nodes (
//!   id VARCHAR(512) PRIMARY KEY,
//!   tenant_id, provider, resource_type, account, region, native_id, status,
//!   body LONGTEXT NOT NULL,
//!   INDEX idx_nodes_provider_type (provider, resource_type),
//!   INDEX idx_nodes_account (account),
//!   INDEX idx_nodes_native (account, provider, native_id)
//! )
//! ```
//!
//! ## sqlx Any driver quirks
//!
//! The Any driver has no unsigned integers, so timestamps and versions are
//! bound as `i64`. MySQL TEXT columns can come back as bytes, so text columns
//! are read as `String` with a `Vec<u8>` fallback.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{
    EdgeId, EdgeVersion, GraphEdge, GraphNode, NodeId, NodeVersion, Provider, Snapshot, SnapshotId,
    SnapshotSummary, SyncRecord, Timestamp, UpsertOutcome,
};

use super::{
    EdgeFilter, GraphStorage, NodeFilter, Page, Pagination, StoreResult, decode_u64, merge_edge,
    merge_node, paginate,
};

// sqlx `Any` requires runtime driver installation.
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn sql_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Sql {
        message: format!("{context}: {e}"),
    }
}

/// Read a text column, tolerating drivers that hand TEXT back as bytes.
fn text(row: &AnyRow, column: &str) -> StoreResult<String> {
    if let Ok(s) = row.try_get::<String, _>(column) {
        return Ok(s);
    }
    row.try_get::<Vec<u8>, _>(column)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(sql_err("read text column"))
}

fn int(row: &AnyRow, column: &str) -> StoreResult<i64> {
    row.try_get::<i64, _>(column).map_err(sql_err("read integer column"))
}

fn decode<T: serde::de::DeserializeOwned>(row: &AnyRow) -> StoreResult<T> {
    Ok(serde_json::from_str(&text(row, "body")?)?)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Graph store over a sqlx `AnyPool`.
pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    /// Serializes read-merge-write cycles issued from this process.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("is_sqlite", &self.is_sqlite)
            .finish()
    }
}

impl SqlStore {
    /// Connect to `url` (`mysql://...` or `sqlite://...`).
    ///
    /// `sqlite::memory:` gives every pooled connection its own database, so
    /// use `max_connections = 1` with it.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        install_drivers();
        let is_sqlite = url.starts_with("sqlite:");
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .map_err(sql_err("connect"))?;
        tracing::info!(sqlite = is_sqlite, max_connections, "connected SQL graph store");
        Ok(Self {
            pool,
            is_sqlite,
            write_lock: Mutex::new(()),
        })
    }

    fn schema(&self) -> Vec<&'static str> {
        if self.is_sqlite {
            vec![
                "CREATE TABLE IF NOT EXISTS ig_nodes (
                    id TEXT PRIMARY KEY, tenant_id TEXT NOT NULL, provider TEXT NOT NULL,
                    resource_type TEXT NOT NULL, account TEXT NOT NULL, region TEXT NOT NULL,
                    native_id TEXT NOT NULL, status TEXT NOT NULL, body TEXT NOT NULL)",
                "CREATE INDEX IF NOT EXISTS idx_nodes_provider_type ON ig_nodes (provider, resource_type)",
                "CREATE INDEX IF NOT EXISTS idx_nodes_account ON ig_nodes (account)",
                "CREATE INDEX IF NOT EXISTS idx_nodes_native ON ig_nodes (account, provider, native_id)",
                "CREATE TABLE IF NOT EXISTS ig_edges (
                    id TEXT PRIMARY KEY, source_id TEXT NOT NULL, target_id TEXT NOT NULL,
                    relationship_type TEXT NOT NULL, tenant_id TEXT NOT NULL, body TEXT NOT NULL)",
                "CREATE INDEX IF NOT EXISTS idx_edges_source ON ig_edges (source_id)",
                "CREATE INDEX IF NOT EXISTS idx_edges_target ON ig_edges (target_id)",
                "CREATE TABLE IF NOT EXISTS ig_node_versions (
                    node_id TEXT NOT NULL, version INTEGER NOT NULL, recorded_at INTEGER NOT NULL,
                    body TEXT NOT NULL, PRIMARY KEY (node_id, version))",
                "CREATE INDEX IF NOT EXISTS idx_node_versions_time ON ig_node_versions (recorded_at)",
                "CREATE TABLE IF NOT EXISTS ig_edge_versions (
                    edge_id TEXT NOT NULL, version INTEGER NOT NULL, recorded_at INTEGER NOT NULL,
                    body TEXT NOT NULL, PRIMARY KEY (edge_id, version))",
                "CREATE INDEX IF NOT EXISTS idx_edge_versions_time ON ig_edge_versions (recorded_at)",
                "CREATE TABLE IF NOT EXISTS ig_snapshots (
                    id INTEGER PRIMARY KEY, taken_at INTEGER NOT NULL, node_count INTEGER NOT NULL,
                    edge_count INTEGER NOT NULL, body TEXT NOT NULL)",
                "CREATE TABLE IF NOT EXISTS ig_sync_records (
                    id TEXT PRIMARY KEY, adapter_id TEXT NOT NULL, started_at INTEGER NOT NULL,
                    body TEXT NOT NULL)",
                "CREATE TABLE IF NOT EXISTS ig_meta (k TEXT PRIMARY KEY, v BLOB NOT NULL)",
            ]
        } else {
            vec![
                "CREATE TABLE IF NOT EXISTS ig_nodes (
                    id VARCHAR(512) PRIMARY KEY, tenant_id VARCHAR(128) NOT NULL,
                    provider VARCHAR(64) NOT NULL, resource_type VARCHAR(32) NOT NULL,
                    account VARCHAR(128) NOT NULL, region VARCHAR(64) NOT NULL,
                    native_id VARCHAR(255) NOT NULL, status VARCHAR(16) NOT NULL, body LONGTEXT NOT NULL,
                    INDEX idx_nodes_provider_type (provider, resource_type),
                    INDEX idx_nodes_account (account),
                    INDEX idx_nodes_native (account, provider, native_id))",
                "CREATE TABLE IF NOT EXISTS ig_edges (
                    id VARCHAR(768) PRIMARY KEY, source_id VARCHAR(512) NOT NULL,
                    target_id VARCHAR(512) NOT NULL, relationship_type VARCHAR(32) NOT NULL,
                    tenant_id VARCHAR(128) NOT NULL, body LONGTEXT NOT NULL,
                    INDEX idx_edges_source (source_id),
                    INDEX idx_edges_target (target_id))",
                "CREATE TABLE IF NOT EXISTS ig_node_versions (
                    node_id VARCHAR(512) NOT NULL, version BIGINT NOT NULL, recorded_at BIGINT NOT NULL,
                    body LONGTEXT NOT NULL, PRIMARY KEY (node_id, version),
                    INDEX idx_node_versions_time (recorded_at))",
                "CREATE TABLE IF NOT EXISTS ig_edge_versions (
                    edge_id VARCHAR(768) NOT NULL, version BIGINT NOT NULL, recorded_at BIGINT NOT NULL,
                    body LONGTEXT NOT NULL, PRIMARY KEY (edge_id, version),
                    INDEX idx_edge_versions_time (recorded_at))",
                "CREATE TABLE IF NOT EXISTS ig_snapshots (
                    id BIGINT PRIMARY KEY, taken_at BIGINT NOT NULL, node_count BIGINT NOT NULL,
                    edge_count BIGINT NOT NULL, body LONGTEXT NOT NULL)",
                "CREATE TABLE IF NOT EXISTS ig_sync_records (
                    id VARCHAR(255) PRIMARY KEY, adapter_id VARCHAR(255) NOT NULL,
                    started_at BIGINT NOT NULL, body LONGTEXT NOT NULL,
                    INDEX idx_sync_started (started_at))",
                "CREATE TABLE IF NOT EXISTS ig_meta (k VARCHAR(512) PRIMARY KEY, v MEDIUMBLOB NOT NULL)",
            ]
        }
    }

    /// Dialect-specific upsert statement keyed on `keys`.
    fn upsert_sql(&self, table: &str, columns: &[&str], keys: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<&str> = columns.iter().copied().filter(|c| !keys.contains(c)).collect();
        if self.is_sqlite {
            let set = updates
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT({}) DO UPDATE SET {set}",
                columns.join(", "),
                keys.join(", ")
            )
        } else {
            let set = updates
                .iter()
                .map(|c| format!("{c} = VALUES({c})"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON DUPLICATE KEY UPDATE {set}",
                columns.join(", ")
            )
        }
    }

    /// Row lock suffix for read-merge-write selects.
    fn for_update(&self) -> &'static str {
        if self.is_sqlite { "" } else { " FOR UPDATE" }
    }

    async fn write_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        let _guard = self.write_lock.lock().await;
        let select = format!("SELECT body FROM ig_nodes WHERE id = ?{}", self.for_update());
        let upsert = self.upsert_sql(
            "ig_nodes",
            &[
                "id", "tenant_id", "provider", "resource_type", "account", "region", "native_id",
                "status", "body",
            ],
            &["id"],
        );

        let mut tx = self.pool.begin().await.map_err(sql_err("begin"))?;
        let mut outcomes = Vec::with_capacity(nodes.len());
        for node in nodes {
            let existing = match sqlx::query(&select)
                .bind(node.id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(sql_err("select node"))?
            {
                Some(row) => Some(decode::<GraphNode>(&row)?),
                None => None,
            };
            let (merged, outcome) = merge_node(existing, node);
            outcomes.push(outcome);
            if outcome == UpsertOutcome::Unchanged {
                continue;
            }
            let body = serde_json::to_string(&merged)?;
            sqlx::query(&upsert)
                .bind(merged.id.as_str())
                .bind(merged.tenant_id.as_str())
                .bind(merged.provider.as_str())
                .bind(merged.resource_type.as_str())
                .bind(merged.account.as_str())
                .bind(merged.region.as_str())
                .bind(merged.native_id.as_str())
                .bind(merged.status.as_str())
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(sql_err("upsert node"))?;
        }
        tx.commit().await.map_err(sql_err("commit"))?;
        Ok(outcomes)
    }

    async fn write_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        let _guard = self.write_lock.lock().await;
        let select = format!("SELECT body FROM ig_edges WHERE id = ?{}", self.for_update());
        let upsert = self.upsert_sql(
            "ig_edges",
            &["id", "source_id", "target_id", "relationship_type", "tenant_id", "body"],
            &["id"],
        );

        let mut tx = self.pool.begin().await.map_err(sql_err("begin"))?;
        let mut outcomes = Vec::with_capacity(edges.len());
        for edge in edges {
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                let found = sqlx::query("SELECT id FROM ig_nodes WHERE id = ?")
                    .bind(endpoint.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(sql_err("select endpoint"))?;
                if found.is_none() {
                    return Err(StoreError::DanglingEdge {
                        edge_id: edge.id.to_string(),
                        missing: endpoint.to_string(),
                    });
                }
            }
            let existing = match sqlx::query(&select)
                .bind(edge.id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(sql_err("select edge"))?
            {
                Some(row) => Some(decode::<GraphEdge>(&row)?),
                None => None,
            };
            let (merged, outcome) = merge_edge(existing, edge);
            outcomes.push(outcome);
            if outcome == UpsertOutcome::Unchanged {
                continue;
            }
            let body = serde_json::to_string(&merged)?;
            sqlx::query(&upsert)
                .bind(merged.id.as_str())
                .bind(merged.source_node_id.as_str())
                .bind(merged.target_node_id.as_str())
                .bind(merged.relationship_type.as_str())
                .bind(merged.tenant_id.as_str())
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(sql_err("upsert edge"))?;
        }
        tx.commit().await.map_err(sql_err("commit"))?;
        Ok(outcomes)
    }

    async fn fetch_bodies<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        binds: Vec<String>,
    ) -> StoreResult<Vec<T>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(sql_err("select"))?;
        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl GraphStorage for SqlStore {
    async fn initialize(&self) -> StoreResult<()> {
        if self.is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&self.pool)
                .await
                .map_err(sql_err("enable WAL mode"))?;
        }
        for statement in self.schema() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(sql_err("init schema"))?;
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn upsert_node(&self, node: GraphNode) -> StoreResult<UpsertOutcome> {
        let outcomes = self.write_nodes(vec![node]).await?;
        Ok(outcomes.into_iter().next().unwrap_or(UpsertOutcome::Unchanged))
    }

    async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<UpsertOutcome>> {
        self.write_nodes(nodes).await
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> StoreResult<UpsertOutcome> {
        let outcomes = self.write_edges(vec![edge]).await?;
        Ok(outcomes.into_iter().next().unwrap_or(UpsertOutcome::Unchanged))
    }

    async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> StoreResult<Vec<UpsertOutcome>> {
        self.write_edges(edges).await
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<GraphNode>> {
        let mut found = self
            .fetch_bodies("SELECT body FROM ig_nodes WHERE id = ?", vec![id.to_string()])
            .await?;
        Ok(found.pop())
    }

    async fn get_node_by_native_id(
        &self,
        account: &str,
        provider: &Provider,
        native_id: &str,
    ) -> StoreResult<Option<GraphNode>> {
        let mut found = self
            .fetch_bodies(
                "SELECT body FROM ig_nodes WHERE account = ? AND provider = ? AND native_id = ? ORDER BY id",
                vec![account.to_string(), provider.to_string(), native_id.to_string()],
            )
            .await?;
        Ok(if found.is_empty() { None } else { Some(found.remove(0)) })
    }

    async fn get_edge(&self, id: &EdgeId) -> StoreResult<Option<GraphEdge>> {
        let mut found = self
            .fetch_bodies("SELECT body FROM ig_edges WHERE id = ?", vec![id.to_string()])
            .await?;
        Ok(found.pop())
    }

    async fn query_nodes(&self, filter: &NodeFilter, page: &Pagination) -> StoreResult<Page<GraphNode>> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(tenant) = &filter.tenant_id {
            clauses.push("tenant_id = ?".to_string());
            binds.push(tenant.to_string());
        }
        if let Some(provider) = &filter.provider {
            clauses.push("provider = ?".to_string());
            binds.push(provider.to_string());
        }
        if !filter.resource_types.is_empty() {
            let marks = vec!["?"; filter.resource_types.len()].join(", ");
            clauses.push(format!("resource_type IN ({marks})"));
            binds.extend(filter.resource_types.iter().map(|rt| rt.as_str().to_string()));
        }
        if let Some(account) = &filter.account {
            clauses.push("account = ?".to_string());
            binds.push(account.clone());
        }
        if let Some(region) = &filter.region {
            clauses.push("region = ?".to_string());
            binds.push(region.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            binds.push(status.as_str().to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT body FROM ig_nodes{where_clause} ORDER BY id");
        let candidates: Vec<GraphNode> = self.fetch_bodies(&sql, binds).await?;
        // Tags and name substring are evaluated in process.
        let mut matches: Vec<GraphNode> = candidates.into_iter().filter(|n| filter.matches(n)).collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(matches, page, |n| n.id.as_str()))
    }

    async fn query_edges(&self, filter: &EdgeFilter, page: &Pagination) -> StoreResult<Page<GraphEdge>> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(source) = &filter.source {
            clauses.push("source_id = ?".to_string());
            binds.push(source.to_string());
        }
        if let Some(target) = &filter.target {
            clauses.push("target_id = ?".to_string());
            binds.push(target.to_string());
        }
        if let Some(node) = &filter.touching {
            clauses.push("(source_id = ? OR target_id = ?)".to_string());
            binds.push(node.to_string());
            binds.push(node.to_string());
        }
        if let Some(tenant) = &filter.tenant_id {
            clauses.push("tenant_id = ?".to_string());
            binds.push(tenant.to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT body FROM ig_edges{where_clause} ORDER BY id");
        let candidates: Vec<GraphEdge> = self.fetch_bodies(&sql, binds).await?;
        let mut matches: Vec<GraphEdge> = candidates.into_iter().filter(|e| filter.matches(e)).collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(matches, page, |e| e.id.as_str()))
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(sql_err("begin"))?;
        let removed = sqlx::query("DELETE FROM ig_nodes WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(sql_err("delete node"))?
            .rows_affected();
        sqlx::query("DELETE FROM ig_edges WHERE source_id = ? OR target_id = ?")
            .bind(id.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(sql_err("delete incident edges"))?;
        tx.commit().await.map_err(sql_err("commit"))?;
        Ok(removed > 0)
    }

    async fn delete_edge(&self, id: &EdgeId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = sqlx::query("DELETE FROM ig_edges WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(sql_err("delete edge"))?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn append_node_version(&self, version: NodeVersion) -> StoreResult<()> {
        let sql = self.upsert_sql(
            "ig_node_versions",
            &["node_id", "version", "recorded_at", "body"],
            &["node_id", "version"],
        );
        let body = serde_json::to_string(&version)?;
        sqlx::query(&sql)
            .bind(version.node_id.as_str())
            .bind(to_i64(version.version))
            .bind(to_i64(version.recorded_at))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(sql_err("append node version"))?;
        Ok(())
    }

    async fn append_edge_version(&self, version: EdgeVersion) -> StoreResult<()> {
        let sql = self.upsert_sql(
            "ig_edge_versions",
            &["edge_id", "version", "recorded_at", "body"],
            &["edge_id", "version"],
        );
        let body = serde_json::to_string(&version)?;
        sqlx::query(&sql)
            .bind(version.edge_id.as_str())
            .bind(to_i64(version.version))
            .bind(to_i64(version.recorded_at))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(sql_err("append edge version"))?;
        Ok(())
    }

    async fn node_versions(&self, id: &NodeId) -> StoreResult<Vec<NodeVersion>> {
        self.fetch_bodies(
            "SELECT body FROM ig_node_versions WHERE node_id = ? ORDER BY recorded_at, version",
            vec![id.to_string()],
        )
        .await
    }

    async fn edge_versions(&self, id: &EdgeId) -> StoreResult<Vec<EdgeVersion>> {
        self.fetch_bodies(
            "SELECT body FROM ig_edge_versions WHERE edge_id = ? ORDER BY recorded_at, version",
            vec![id.to_string()],
        )
        .await
    }

    async fn node_versions_until(&self, t: Timestamp) -> StoreResult<Vec<NodeVersion>> {
        let rows = sqlx::query(
            "SELECT body FROM ig_node_versions WHERE recorded_at <= ? ORDER BY node_id, version",
        )
        .bind(to_i64(t))
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err("select node versions"))?;
        let mut out = rows.iter().map(decode).collect::<StoreResult<Vec<NodeVersion>>>()?;
        // Collation may differ from byte order on MySQL.
        out.sort_by(|a, b| (&a.node_id, a.version).cmp(&(&b.node_id, b.version)));
        Ok(out)
    }

    async fn edge_versions_until(&self, t: Timestamp) -> StoreResult<Vec<EdgeVersion>> {
        let rows = sqlx::query(
            "SELECT body FROM ig_edge_versions WHERE recorded_at <= ? ORDER BY edge_id, version",
        )
        .bind(to_i64(t))
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err("select edge versions"))?;
        let mut out = rows.iter().map(decode).collect::<StoreResult<Vec<EdgeVersion>>>()?;
        out.sort_by(|a, b| (&a.edge_id, a.version).cmp(&(&b.edge_id, b.version)));
        Ok(out)
    }

    async fn prune_versions_before(&self, t: Timestamp) -> StoreResult<usize> {
        let mut removed = 0u64;
        for table in ["ig_node_versions", "ig_edge_versions"] {
            removed += sqlx::query(&format!("DELETE FROM {table} WHERE recorded_at < ?"))
                .bind(to_i64(t))
                .execute(&self.pool)
                .await
                .map_err(sql_err("prune versions"))?
                .rows_affected();
        }
        Ok(removed as usize)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let sql = self.upsert_sql(
            "ig_snapshots",
            &["id", "taken_at", "node_count", "edge_count", "body"],
            &["id"],
        );
        let body = serde_json::to_string(snapshot)?;
        sqlx::query(&sql)
            .bind(to_i64(snapshot.id.0))
            .bind(to_i64(snapshot.taken_at))
            .bind(snapshot.nodes.len() as i64)
            .bind(snapshot.edges.len() as i64)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(sql_err("save snapshot"))?;
        Ok(())
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query("SELECT body FROM ig_snapshots WHERE id = ?")
            .bind(to_i64(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err("get snapshot"))?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        let rows = sqlx::query("SELECT id, taken_at, node_count, edge_count FROM ig_snapshots ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err("list snapshots"))?;
        rows.iter()
            .map(|row| {
                Ok(SnapshotSummary {
                    id: SnapshotId(int(row, "id")? as u64),
                    taken_at: int(row, "taken_at")? as u64,
                    node_count: int(row, "node_count")? as usize,
                    edge_count: int(row, "edge_count")? as usize,
                })
            })
            .collect()
    }

    async fn delete_snapshot(&self, id: SnapshotId) -> StoreResult<bool> {
        let removed = sqlx::query("DELETE FROM ig_snapshots WHERE id = ?")
            .bind(to_i64(id.0))
            .execute(&self.pool)
            .await
            .map_err(sql_err("delete snapshot"))?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn capture_state(&self) -> StoreResult<(Vec<GraphNode>, Vec<GraphEdge>)> {
        // One transaction for both reads; the write lock also keeps in-process
        // writers from interleaving on backends with weaker read isolation.
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(sql_err("begin"))?;
        let node_rows = sqlx::query("SELECT body FROM ig_nodes ORDER BY id")
            .fetch_all(&mut *tx)
            .await
            .map_err(sql_err("capture nodes"))?;
        let edge_rows = sqlx::query("SELECT body FROM ig_edges ORDER BY id")
            .fetch_all(&mut *tx)
            .await
            .map_err(sql_err("capture edges"))?;
        tx.commit().await.map_err(sql_err("commit"))?;

        let mut nodes: Vec<GraphNode> = node_rows.iter().map(decode).collect::<StoreResult<_>>()?;
        let mut edges: Vec<GraphEdge> = edge_rows.iter().map(decode).collect::<StoreResult<_>>()?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((nodes, edges))
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        let sql = self.upsert_sql(
            "ig_sync_records",
            &["id", "adapter_id", "started_at", "body"],
            &["id"],
        );
        let body = serde_json::to_string(record)?;
        sqlx::query(&sql)
            .bind(record.id.as_str())
            .bind(record.adapter_id.as_str())
            .bind(to_i64(record.started_at))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(sql_err("save sync record"))?;
        Ok(())
    }

    async fn list_sync_records(&self, adapter_id: Option<&str>) -> StoreResult<Vec<SyncRecord>> {
        match adapter_id {
            Some(adapter) => {
                self.fetch_bodies(
                    "SELECT body FROM ig_sync_records WHERE adapter_id = ? ORDER BY started_at, id",
                    vec![adapter.to_string()],
                )
                .await
            }
            None => {
                self.fetch_bodies("SELECT body FROM ig_sync_records ORDER BY started_at, id", Vec::new())
                    .await
            }
        }
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let sql = self.upsert_sql("ig_meta", &["k", "v"], &["k"]);
        sqlx::query(&sql)
            .bind(key)
            .bind(value.to_vec())
            .execute(&self.pool)
            .await
            .map_err(sql_err("put meta"))?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT v FROM ig_meta WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err("get meta"))?;
        row.map(|r| r.try_get::<Vec<u8>, _>("v").map_err(sql_err("read meta value")))
            .transpose()
    }

    async fn scan_meta_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query("SELECT k, v FROM ig_meta WHERE k >= ? ORDER BY k")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err("scan meta"))?;
        let mut out = Vec::new();
        for row in &rows {
            let key = text(row, "k")?;
            if key.starts_with(prefix) {
                let value = row.try_get::<Vec<u8>, _>("v").map_err(sql_err("read meta value"))?;
                out.push((key, value));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(sql_err("begin"))?;
        // Write first so the transaction holds the write lock before it reads.
        let seed = if self.is_sqlite {
            "INSERT INTO ig_meta (k, v) VALUES (?, ?) ON CONFLICT(k) DO NOTHING"
        } else {
            "INSERT IGNORE INTO ig_meta (k, v) VALUES (?, ?)"
        };
        let select = format!("SELECT v FROM ig_meta WHERE k = ?{}", self.for_update());
        sqlx::query(seed)
            .bind(key)
            .bind(0u64.to_be_bytes().to_vec())
            .execute(&mut *tx)
            .await
            .map_err(sql_err("seed sequence"))?;
        let row = sqlx::query(&select)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(sql_err("read sequence"))?;
        let current = decode_u64(&row.try_get::<Vec<u8>, _>("v").map_err(sql_err("read meta value"))?)?;
        let next = current + 1;
        sqlx::query("UPDATE ig_meta SET v = ? WHERE k = ?")
            .bind(next.to_be_bytes().to_vec())
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(sql_err("bump sequence"))?;
        tx.commit().await.map_err(sql_err("commit"))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationshipType, ResourceType};
    use tempfile::TempDir;

    async fn sqlite(dir: &TempDir) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("graph.db").display());
        let store = SqlStore::connect(&url, 4).await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_sql_uses_dialect_specific_conflict_clause() {
        let dir = TempDir::new().unwrap();
        let store = sqlite(&dir).await;
        let sql = store.upsert_sql("ig_meta", &["k", "v"], &["k"]);
        assert!(sql.contains("ON CONFLICT(k) DO UPDATE SET v = excluded.v"));
    }

    #[tokio::test]
    async fn pushdown_filters_and_tag_post_filter() {
        let dir = TempDir::new().unwrap();
        let store = sqlite(&dir).await;
        store
            .upsert_node(
                GraphNode::new("aws", "111", "us-east-1", ResourceType::Database, "db-1", "orders")
                    .with_tag("env", "prod"),
            )
            .await
            .unwrap();
        store
            .upsert_node(
                GraphNode::new("aws", "111", "us-east-1", ResourceType::Database, "db-2", "scratch")
                    .with_tag("env", "dev"),
            )
            .await
            .unwrap();
        let filter = NodeFilter::new()
            .provider("aws")
            .resource_type(ResourceType::Database)
            .tag("env", "prod");
        let page = store.query_nodes(&filter, &Pagination::all()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "orders");
    }

    #[tokio::test]
    async fn dangling_edge_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = sqlite(&dir).await;
        let a = GraphNode::new("aws", "111", "us-east-1", ResourceType::Compute, "i-1", "web");
        store.upsert_node(a.clone()).await.unwrap();
        let err = store
            .upsert_edge(GraphEdge::new(a.id.clone(), RelationshipType::Uses, NodeId::new("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DanglingEdge { .. }));
    }
}
