//! Per-kind sync handlers
//!
//! Each reconciler pops `namespace/name` keys from its work queue, looks up
//! the current snapshot and drives external state toward it. Reconcilers
//! are idempotent; a failed sync is re-queued with backoff up to the retry
//! budget, then dropped.

pub mod data_source;
pub mod deps;
pub mod generation_query;
pub mod presto_table;
pub mod report;
pub mod scheduled_report;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use tally_common::{Clock, Result};

use crate::crd::{
    PrestoTable, Report, ReportDataSource, ReportGenerationQuery, ReportPrometheusQuery,
    ScheduledReport, StorageLocation,
};
use crate::hive::HiveQueryer;
use crate::presto::PrestoQueryer;
use crate::status::StatusWriter;
use crate::store::Store;
use crate::workqueue::WorkQueue;

/// Rate-limited retries before a key is dropped from its queue.
pub const MAX_SYNC_RETRIES: u32 = 5;

/// One cache per resource kind, shared between reconcilers and collectors.
#[derive(Clone)]
pub struct Stores {
    pub reports: Arc<Store<Report>>,
    pub scheduled_reports: Arc<Store<ScheduledReport>>,
    pub data_sources: Arc<Store<ReportDataSource>>,
    pub generation_queries: Arc<Store<ReportGenerationQuery>>,
    pub prometheus_queries: Arc<Store<ReportPrometheusQuery>>,
    pub storage_locations: Arc<Store<StorageLocation>>,
    pub presto_tables: Arc<Store<PrestoTable>>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            reports: Store::new(),
            scheduled_reports: Store::new(),
            data_sources: Store::new(),
            generation_queries: Store::new(),
            prometheus_queries: Store::new(),
            storage_locations: Store::new(),
            presto_tables: Store::new(),
        }
    }

    pub fn all_synced(&self) -> bool {
        self.reports.has_synced()
            && self.scheduled_reports.has_synced()
            && self.data_sources.has_synced()
            && self.generation_queries.has_synced()
            && self.prometheus_queries.has_synced()
            && self.storage_locations.has_synced()
            && self.presto_tables.has_synced()
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a sync handler needs: caches, clients and the status writer.
pub struct Ctx {
    pub namespace: String,
    pub stores: Stores,
    pub hive: Arc<dyn HiveQueryer>,
    pub presto: Arc<dyn PrestoQueryer>,
    pub status: Arc<dyn StatusWriter>,
    pub clock: Arc<dyn Clock>,
    /// Echo rendered report bodies
    pub log_report: bool,
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn sync(&self, key: &str) -> Result<()>;

    /// Called when a key exhausts its retry budget and is dropped.
    async fn on_drop(&self, key: &str) {
        let _ = key;
    }
}

/// Reconciler for kinds the operator only tracks; ReportPrometheusQuery
/// and StorageLocation are read by other reconcilers, never acted on.
pub struct TrackingReconciler<K> {
    kind: &'static str,
    store: Arc<Store<K>>,
}

impl<K> TrackingReconciler<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, store: Arc<Store<K>>) -> Arc<Self> {
        Arc::new(Self { kind, store })
    }
}

#[async_trait]
impl<K> Reconciler for TrackingReconciler<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn sync(&self, key: &str) -> Result<()> {
        if let Some(parsed) = crate::store::ObjectKey::parse(key) {
            let present = self.store.get(&parsed.namespace, &parsed.name).is_some();
            tracing::debug!(kind = self.kind, key, present, "tracked resource synced");
        }
        Ok(())
    }
}

/// Worker loop: pop keys, sync, apply the retry policy, until the queue
/// shuts down.
pub async fn run_worker(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconciler>) {
    let kind = reconciler.kind();
    while let Some(key) = queue.get().await {
        match reconciler.sync(&key).await {
            Ok(()) => queue.forget(&key),
            Err(err) => {
                if queue.num_requeues(&key) < MAX_SYNC_RETRIES {
                    warn!(kind, key = %key, error = %err, "error syncing, adding back to queue");
                    queue.add_rate_limited(&key);
                } else {
                    queue.forget(&key);
                    info!(kind, key = %key, error = %err, "dropping out of the queue");
                    reconciler.on_drop(&key).await;
                }
            }
        }
        queue.done(&key);
    }
}
