//! Periodic sync scheduling and query-based alerting.
//!
//! A [`Scheduler`] runs one tokio task per registered [`ScheduledJob`]. Each
//! tick runs a sync cycle for the job's adapter, optionally takes a snapshot,
//! then evaluates the job's [`MonitorRule`]s and publishes any [`Alert`]s on a
//! broadcast channel. The outcome of each job's latest tick, including rules
//! that failed to evaluate, is kept as a [`JobStatus`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::iql::{Executor, IqlError};
use crate::model::{TenantId, Timestamp};
use crate::store::GraphStorage;
use crate::sync::{AdapterRegistry, CancelToken, SyncEngine, SyncError, SyncOptions, SyncResult};
use crate::temporal::TemporalStore;

const ALERT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// When a rule's match count raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Threshold {
    AnyMatch,
    CountAbove(usize),
    CountBelow(usize),
}

impl Threshold {
    pub fn breached(self, count: usize) -> bool {
        match self {
            Threshold::AnyMatch => count > 0,
            Threshold::CountAbove(n) => count > n,
            Threshold::CountBelow(n) => count < n,
        }
    }
}

/// An IQL query watched against a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRule {
    pub name: String,
    pub query: String,
    pub threshold: Threshold,
}

impl MonitorRule {
    pub fn new(name: impl Into<String>, query: impl Into<String>, threshold: Threshold) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule: String,
    pub tenant: Option<TenantId>,
    pub threshold: Threshold,
    pub match_count: usize,
    pub raised_at: Timestamp,
}

/// A rule whose query could not be evaluated.
#[derive(Debug)]
pub struct RuleFailure {
    pub rule: String,
    pub error: IqlError,
}

impl RuleFailure {
    fn report(&self) -> FailedRule {
        FailedRule {
            rule: self.rule.clone(),
            message: self.error.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleEvaluation {
    pub alerts: Vec<Alert>,
    pub failures: Vec<RuleFailure>,
}

/// Evaluate `rules` once. A failing rule is reported and does not stop the
/// others.
pub async fn evaluate_rules(
    storage: &dyn GraphStorage,
    temporal: Option<&TemporalStore>,
    tenant: Option<&TenantId>,
    rules: &[MonitorRule],
    now: Timestamp,
) -> RuleEvaluation {
    let mut executor = Executor::new(storage);
    if let Some(temporal) = temporal {
        executor = executor.with_temporal(temporal);
    }
    if let Some(tenant) = tenant {
        executor = executor.for_tenant(tenant.clone());
    }

    let mut evaluation = RuleEvaluation::default();
    for rule in rules {
        match executor.run(&rule.query).await {
            Ok(result) => {
                let count = result.match_count();
                if rule.threshold.breached(count) {
                    tracing::info!(rule = %rule.name, count, "monitor rule breached");
                    evaluation.alerts.push(Alert {
                        rule: rule.name.clone(),
                        tenant: tenant.cloned(),
                        threshold: rule.threshold,
                        match_count: count,
                        raised_at: now,
                    });
                }
            }
            Err(error) => {
                tracing::warn!(rule = %rule.name, error = %error, "monitor rule failed");
                evaluation.failures.push(RuleFailure {
                    rule: rule.name.clone(),
                    error,
                });
            }
        }
    }
    evaluation
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Timing knobs for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between cycles of one job (default: 5 min).
    pub interval: Duration,
    /// Take a snapshot after every completed cycle.
    pub snapshot_every_cycle: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            snapshot_every_cycle: false,
        }
    }
}

/// One (tenant, adapter) pair synced on every tick.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub adapter_id: String,
    pub options: SyncOptions,
    pub rules: Vec<MonitorRule>,
}

impl ScheduledJob {
    pub fn new(tenant: TenantId, adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            options: SyncOptions::for_tenant(tenant),
            rules: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rule(mut self, rule: MonitorRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// A rule failure as kept in a [`JobStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRule {
    pub rule: String,
    pub message: String,
}

/// Outcome of a job's most recent tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub adapter_id: String,
    pub tenant: TenantId,
    pub ticks: u64,
    pub last_tick_at: Option<Timestamp>,
    /// Set when the sync cycle itself failed.
    pub sync_error: Option<String>,
    pub alerts_raised: usize,
    pub rule_failures: Vec<FailedRule>,
}

impl JobStatus {
    fn idle(job: &ScheduledJob) -> Self {
        Self {
            adapter_id: job.adapter_id.clone(),
            tenant: job.options.tenant.clone(),
            ticks: 0,
            last_tick_at: None,
            sync_error: None,
            alerts_raised: 0,
            rule_failures: Vec::new(),
        }
    }
}

/// Owns the background sync tasks and their cancellation token.
pub struct Scheduler {
    sync: Arc<SyncEngine>,
    temporal: Arc<TemporalStore>,
    adapters: Arc<AdapterRegistry>,
    config: SchedulerConfig,
    jobs: Vec<ScheduledJob>,
    alerts: broadcast::Sender<Alert>,
    status: Arc<RwLock<Vec<JobStatus>>>,
    running: Option<(CancelToken, JoinSet<()>)>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("jobs", &self.jobs.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        sync: Arc<SyncEngine>,
        temporal: Arc<TemporalStore>,
        adapters: Arc<AdapterRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            sync,
            temporal,
            adapters,
            config,
            jobs: Vec::new(),
            alerts,
            status: Arc::new(RwLock::new(Vec::new())),
            running: None,
        }
    }

    /// Register a job. Takes effect on the next `start`.
    pub fn add_job(&mut self, job: ScheduledJob) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Latest tick outcome per job, in job order. Empty until `start`.
    pub fn job_status(&self) -> Vec<JobStatus> {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn one task per job. Every job's adapter must be registered.
    /// Starting a running scheduler is a no-op.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let mut resolved = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let adapter = self.adapters.get(&job.adapter_id).ok_or_else(|| SyncError::AdapterNotFound {
                adapter_id: job.adapter_id.clone(),
            })?;
            resolved.push((job.clone(), adapter));
        }

        *self.status.write() = self.jobs.iter().map(JobStatus::idle).collect();
        let cancel = CancelToken::new();
        let mut tasks = JoinSet::new();
        for (index, (job, adapter)) in resolved.into_iter().enumerate() {
            let worker = JobWorker {
                sync: Arc::clone(&self.sync),
                temporal: Arc::clone(&self.temporal),
                adapter,
                job,
                snapshot_every_cycle: self.config.snapshot_every_cycle,
                alerts: self.alerts.clone(),
                status: Arc::clone(&self.status),
                index,
            };
            tasks.spawn(worker.run(self.config.interval, cancel.clone()));
        }
        tracing::info!(jobs = tasks.len(), interval_ms = self.config.interval.as_millis() as u64, "scheduler started");
        self.running = Some((cancel, tasks));
        Ok(())
    }

    /// Cancel all jobs and wait for them to finish.
    pub async fn stop(&mut self) {
        let Some((cancel, mut tasks)) = self.running.take() else {
            return;
        };
        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "scheduler job ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

struct JobWorker {
    sync: Arc<SyncEngine>,
    temporal: Arc<TemporalStore>,
    adapter: Arc<dyn crate::sync::DiscoveryAdapter>,
    job: ScheduledJob,
    snapshot_every_cycle: bool,
    alerts: broadcast::Sender<Alert>,
    status: Arc<RwLock<Vec<JobStatus>>>,
    index: usize,
}

impl JobWorker {
    async fn run(self, interval: Duration, cancel: CancelToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.tick(&cancel).await,
            }
        }
        tracing::debug!(adapter = %self.job.adapter_id, tenant = %self.job.options.tenant, "scheduler job exiting");
    }

    async fn tick(&self, cancel: &CancelToken) {
        let tenant = &self.job.options.tenant;
        let mut sync_error = None;
        match self.sync.run_cycle(Arc::clone(&self.adapter), &self.job.options, cancel).await {
            Ok(result) => {
                tracing::debug!(
                    adapter = %self.job.adapter_id,
                    tenant = %tenant,
                    writes = result.writes(),
                    complete = result.complete,
                    "scheduled cycle finished"
                );
                if self.snapshot_every_cycle
                    && result.complete
                    && let Err(e) = self.temporal.take_snapshot().await
                {
                    tracing::warn!(error = %e, "scheduled snapshot failed");
                }
            }
            Err(e) => {
                tracing::warn!(adapter = %self.job.adapter_id, tenant = %tenant, error = %e, "scheduled cycle failed");
                sync_error = Some(e.to_string());
            }
        }

        let now = self.temporal.clock().now();
        let evaluation = if cancel.is_cancelled() || self.job.rules.is_empty() {
            RuleEvaluation::default()
        } else {
            evaluate_rules(
                self.sync.storage().as_ref(),
                Some(self.temporal.as_ref()),
                Some(tenant),
                &self.job.rules,
                now,
            )
            .await
        };
        self.record(now, sync_error, &evaluation);
        for alert in evaluation.alerts {
            // No subscribers is not an error.
            let _ = self.alerts.send(alert);
        }
    }

    fn record(&self, now: Timestamp, sync_error: Option<String>, evaluation: &RuleEvaluation) {
        let mut status = self.status.write();
        let Some(entry) = status.get_mut(self.index) else {
            return;
        };
        entry.ticks += 1;
        entry.last_tick_at = Some(now);
        entry.sync_error = sync_error;
        entry.alerts_raised = evaluation.alerts.len();
        entry.rule_failures = evaluation.failures.iter().map(RuleFailure::report).collect();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::model::{GraphNode, Provider, ResourceType};
    use crate::store::MemStore;
    use crate::sync::{DiscoveryAdapter, DiscoveryBatch, DiscoveryError, DiscoveryOptions};

    struct TwoDatabases;

    #[async_trait]
    impl DiscoveryAdapter for TwoDatabases {
        fn id(&self) -> &str {
            "dbs"
        }
        fn provider(&self) -> Provider {
            Provider::new("aws")
        }
        fn account(&self) -> &str {
            "111"
        }
        async fn discover(&self, _options: &DiscoveryOptions) -> Result<DiscoveryBatch, DiscoveryError> {
            let nodes = ["db-1", "db-2"]
                .into_iter()
                .map(|n| GraphNode::new("aws", "111", "us-east-1", ResourceType::Database, n, n))
                .collect();
            Ok(DiscoveryBatch::new(nodes, Vec::new()))
        }
    }

    fn parts() -> (Arc<SyncEngine>, Arc<TemporalStore>, Arc<AdapterRegistry>) {
        let store: Arc<dyn GraphStorage> = Arc::new(MemStore::new());
        let temporal = Arc::new(TemporalStore::new(Arc::clone(&store)));
        let sync = Arc::new(SyncEngine::new(store, Arc::clone(&temporal)));
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(Arc::new(TwoDatabases));
        (sync, temporal, adapters)
    }

    #[test]
    fn thresholds() {
        assert!(Threshold::AnyMatch.breached(1));
        assert!(!Threshold::AnyMatch.breached(0));
        assert!(Threshold::CountAbove(2).breached(3));
        assert!(!Threshold::CountAbove(2).breached(2));
        assert!(Threshold::CountBelow(1).breached(0));
    }

    #[tokio::test]
    async fn evaluate_reports_alerts_and_failures() {
        let store = MemStore::new();
        store
            .upsert_node(GraphNode::new("aws", "111", "us-east-1", ResourceType::Database, "db", "db"))
            .await
            .unwrap();
        let rules = [
            MonitorRule::new("any-db", "FIND database", Threshold::AnyMatch),
            MonitorRule::new("many-db", "FIND database", Threshold::CountAbove(5)),
            MonitorRule::new("broken", "FIND database WHERE", Threshold::AnyMatch),
        ];
        let evaluation = evaluate_rules(&store, None, None, &rules, 42).await;
        assert_eq!(evaluation.alerts.len(), 1);
        assert_eq!(evaluation.alerts[0].rule, "any-db");
        assert_eq!(evaluation.alerts[0].match_count, 1);
        assert_eq!(evaluation.alerts[0].raised_at, 42);
        assert_eq!(evaluation.failures.len(), 1);
        assert_eq!(evaluation.failures[0].rule, "broken");
    }

    #[tokio::test]
    async fn scheduled_cycle_publishes_alert() {
        let (sync, temporal, adapters) = parts();
        let mut scheduler = Scheduler::new(
            Arc::clone(&sync),
            temporal,
            adapters,
            SchedulerConfig {
                interval: Duration::from_millis(20),
                snapshot_every_cycle: true,
            },
        );
        scheduler.add_job(
            ScheduledJob::new(TenantId::default(), "dbs").with_rule(MonitorRule::new(
                "two-dbs",
                "FIND database",
                Threshold::CountAbove(1),
            )),
        );
        let mut alerts = scheduler.subscribe();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.rule, "two-dbs");
        assert_eq!(alert.match_count, 2);
        assert_eq!(alert.tenant, Some(TenantId::default()));

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert!(!sync.storage().list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_rule_shows_in_job_status() {
        let (sync, temporal, adapters) = parts();
        let mut scheduler = Scheduler::new(
            sync,
            temporal,
            adapters,
            SchedulerConfig {
                interval: Duration::from_millis(20),
                snapshot_every_cycle: false,
            },
        );
        scheduler.add_job(
            ScheduledJob::new(TenantId::default(), "dbs")
                .with_rule(MonitorRule::new("ok", "FIND database", Threshold::AnyMatch))
                .with_rule(MonitorRule::new("broken", "FIND database WHERE", Threshold::AnyMatch)),
        );
        assert!(scheduler.job_status().is_empty());
        scheduler.start().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(status) = scheduler.job_status().into_iter().find(|s| s.ticks > 0) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        scheduler.stop().await;

        assert_eq!(status.adapter_id, "dbs");
        assert!(status.sync_error.is_none());
        assert_eq!(status.alerts_raised, 1);
        assert_eq!(status.rule_failures.len(), 1);
        assert_eq!(status.rule_failures[0].rule, "broken");
        assert!(!status.rule_failures[0].message.is_empty());
    }

    #[tokio::test]
    async fn start_rejects_unknown_adapter() {
        let (sync, temporal, adapters) = parts();
        let mut scheduler = Scheduler::new(sync, temporal, adapters, SchedulerConfig::default());
        scheduler.add_job(ScheduledJob::new(TenantId::default(), "missing"));
        assert!(matches!(scheduler.start(), Err(SyncError::AdapterNotFound { .. })));
        assert!(!scheduler.is_running());
    }
}
