//! Engine facade: top-level API for infragraph.
//!
//! The `Engine` owns storage (behind the read cache), temporal history, the
//! tenant registry, the discovery adapters and the sync engine, and exposes
//! them per tenant.

use std::sync::Arc;

use crate::cache::CachedStorage;
use crate::config::{EngineConfig, open_storage};
use crate::error::InfraResult;
use crate::graph::GraphView;
use crate::iql::{Executor, QueryResult};
use crate::model::{Snapshot, TenantId};
use crate::monitor::Scheduler;
use crate::store::{GraphStorage, NodeFilter};
use crate::sync::{
    AdapterRegistry, CancelToken, DiscoveryAdapter, IncrementalSyncResult, SyncEngine, SyncError,
    SyncOptions,
};
use crate::temporal::{Clock, RetentionReport, SystemClock, TemporalStore};
use crate::tenant::{
    AccountRegistry, CloudAccount, CrossTenantReport, Tenant, TenantManager, TenantScopedStorage,
};

/// The infragraph engine.
pub struct Engine {
    config: EngineConfig,
    storage: Arc<dyn GraphStorage>,
    cache: Option<Arc<CachedStorage>>,
    temporal: Arc<TemporalStore>,
    sync: Arc<SyncEngine>,
    adapters: Arc<AdapterRegistry>,
    tenants: TenantManager,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the configured backend and restore the tenant registry.
    pub async fn open(config: EngineConfig) -> InfraResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`Engine::open`], with an explicit clock for history timestamps.
    pub async fn open_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> InfraResult<Self> {
        config.validate()?;
        tracing::info!(storage = ?config.storage, cache = config.cache.capacity, "initializing infragraph engine");

        let base = open_storage(&config.storage).await?;
        let registry = Arc::new(AccountRegistry::restore(base.as_ref()).await?);
        if !registry.contains_tenant(&TenantId::default()) {
            registry.register_tenant(Tenant::new(TenantId::default().as_str(), "Default"));
        }

        let (storage, cache) = if config.cache.capacity > 0 {
            let cached = Arc::new(CachedStorage::new(base, config.cache.capacity, config.cache.ttl()));
            let storage: Arc<dyn GraphStorage> = cached.clone();
            (storage, Some(cached))
        } else {
            (base, None)
        };

        let temporal = Arc::new(TemporalStore::with_clock(Arc::clone(&storage), clock));
        let sync = Arc::new(SyncEngine::new(Arc::clone(&storage), Arc::clone(&temporal)));
        let tenants = TenantManager::new(Arc::clone(&storage), registry);

        Ok(Self {
            config,
            storage,
            cache,
            temporal,
            sync,
            adapters: Arc::new(AdapterRegistry::new()),
            tenants,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Unscoped storage. Prefer [`Engine::for_tenant`] for tenant data.
    pub fn storage(&self) -> &Arc<dyn GraphStorage> {
        &self.storage
    }

    /// The read cache, when enabled.
    pub fn cache(&self) -> Option<&Arc<CachedStorage>> {
        self.cache.as_ref()
    }

    pub fn temporal(&self) -> &Arc<TemporalStore> {
        &self.temporal
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        self.tenants.registry()
    }

    pub fn register_adapter(&self, adapter: Arc<dyn DiscoveryAdapter>) {
        self.adapters.register(adapter);
    }

    /// Register (or replace) a tenant and persist the registry.
    pub async fn register_tenant(&self, tenant: Tenant) -> InfraResult<()> {
        self.registry().register_tenant(tenant);
        self.registry().persist(self.storage.as_ref()).await?;
        Ok(())
    }

    pub async fn add_account(&self, account: CloudAccount) -> InfraResult<()> {
        self.registry().add_account(account)?;
        self.registry().persist(self.storage.as_ref()).await?;
        Ok(())
    }

    /// Storage confined to one registered tenant.
    pub fn for_tenant(&self, tenant: &TenantId) -> InfraResult<TenantScopedStorage> {
        Ok(self.tenants.for_tenant(tenant)?)
    }

    /// Run an IQL query over one tenant's graph.
    pub async fn query(&self, tenant: &TenantId, text: &str) -> InfraResult<QueryResult> {
        let scoped = self.for_tenant(tenant)?;
        let result = Executor::new(&scoped)
            .with_temporal(&self.temporal)
            .for_tenant(tenant.clone())
            .run(text)
            .await?;
        Ok(result)
    }

    /// In-memory graph of one tenant's nodes and edges.
    pub async fn graph_view(&self, tenant: &TenantId) -> InfraResult<GraphView> {
        let scoped = self.for_tenant(tenant)?;
        let filter = NodeFilter::new().tenant(tenant.clone());
        Ok(GraphView::load(&scoped, &filter).await?)
    }

    /// Sync options from the config, for `tenant`.
    pub fn sync_options(&self, tenant: &TenantId) -> SyncOptions {
        SyncOptions {
            tenant: tenant.clone(),
            ..self.config.sync.options()
        }
    }

    /// Run one sync cycle of a registered adapter into `tenant`'s graph.
    /// The tenant in `options` is replaced by `tenant`.
    pub async fn sync(
        &self,
        tenant: &TenantId,
        adapter_id: &str,
        options: SyncOptions,
        cancel: &CancelToken,
    ) -> InfraResult<IncrementalSyncResult> {
        // Fails for unregistered tenants.
        self.for_tenant(tenant)?;
        let adapter = self.adapters.get(adapter_id).ok_or_else(|| SyncError::AdapterNotFound {
            adapter_id: adapter_id.to_string(),
        })?;
        self.tenants
            .check_account_owner(tenant, &adapter.provider(), adapter.account())?;
        let options = SyncOptions {
            tenant: tenant.clone(),
            ..options
        };
        Ok(self.sync.run_cycle(adapter, &options, cancel).await?)
    }

    pub async fn take_snapshot(&self) -> InfraResult<Snapshot> {
        Ok(self.temporal.take_snapshot().await?)
    }

    /// Apply the configured retention policy.
    pub async fn apply_retention(&self) -> InfraResult<RetentionReport> {
        let policy = self.config.retention.policy();
        Ok(self.temporal.apply_retention(&policy).await?)
    }

    pub async fn discover_cross_tenant(&self, a: &TenantId, b: &TenantId) -> InfraResult<CrossTenantReport> {
        Ok(self.tenants.discover_cross_tenant(a, b).await?)
    }

    /// A scheduler sharing this engine's sync engine and adapters, timed by
    /// the `monitor` config section. Jobs are added by the caller.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.sync),
            Arc::clone(&self.temporal),
            Arc::clone(&self.adapters),
            self.config.monitor.scheduler(),
        )
    }

    /// Persist the registry and close the backend.
    pub async fn close(&self) -> InfraResult<()> {
        self.registry().persist(self.storage.as_ref()).await?;
        self.storage.close().await?;
        tracing::info!("infragraph engine closed");
        Ok(())
    }
}
