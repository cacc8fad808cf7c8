//! Orchestrator
//!
//! Wires stores, queues, clients, reconcilers and collectors together and
//! sequences startup: watches first, then Hive and Presto connections in
//! parallel, the Prometheus client, cache sync, the Presto write probe,
//! and only then the worker pools. Shutdown drains the queues and joins
//! every worker fiber.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kube::api::Api;
use kube::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tally_common::{Clock, Config, Error};

use crate::crd::{
    PrestoTable, Report, ReportDataSource, ReportGenerationQuery, ReportPrometheusQuery,
    ScheduledReport, StorageLocation,
};
use crate::hive::thrift::ThriftConnector;
use crate::hive::HiveClient;
use crate::http::{self, AppState};
use crate::presto::PrestoClient;
use crate::prom::PrometheusClient;
use crate::promsum::PromsumCollector;
use crate::reconcile::data_source::DataSourceReconciler;
use crate::reconcile::generation_query::GenerationQueryReconciler;
use crate::reconcile::presto_table::{run_partition_worker, PrestoTableReconciler};
use crate::reconcile::report::ReportReconciler;
use crate::reconcile::scheduled_report::{CancelRunnerOnDelete, ScheduledReportReconciler};
use crate::reconcile::{run_worker, Ctx, Reconciler, Stores, TrackingReconciler};
use crate::runner::ScheduledReportRunner;
use crate::status::KubeStatusWriter;
use crate::store::{run_watch, EnqueueHook};
use crate::workqueue::WorkQueue;

/// Worker fibers per resource-kind queue.
const THREADINESS: usize = 2;

/// One work queue per resource kind.
pub struct Queues {
    pub reports: Arc<WorkQueue>,
    pub scheduled_reports: Arc<WorkQueue>,
    pub data_sources: Arc<WorkQueue>,
    pub generation_queries: Arc<WorkQueue>,
    pub prometheus_queries: Arc<WorkQueue>,
    pub storage_locations: Arc<WorkQueue>,
    pub presto_tables: Arc<WorkQueue>,
}

impl Queues {
    fn new() -> Self {
        Self {
            reports: WorkQueue::new(),
            scheduled_reports: WorkQueue::new(),
            data_sources: WorkQueue::new(),
            generation_queries: WorkQueue::new(),
            prometheus_queries: WorkQueue::new(),
            storage_locations: WorkQueue::new(),
            presto_tables: WorkQueue::new(),
        }
    }

    fn shutdown_all(&self) {
        for queue in [
            &self.reports,
            &self.scheduled_reports,
            &self.data_sources,
            &self.generation_queries,
            &self.prometheus_queries,
            &self.storage_locations,
            &self.presto_tables,
        ] {
            queue.shutdown();
        }
    }
}

pub struct Operator {
    cfg: Config,
    client: Client,
    clock: Arc<dyn Clock>,
    listen_addr: SocketAddr,
}

impl Operator {
    pub fn new(cfg: Config, client: Client, clock: Arc<dyn Clock>, listen_addr: SocketAddr) -> Self {
        Self {
            cfg,
            client,
            clock,
            listen_addr,
        }
    }

    pub async fn run(self, stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        let cfg = self.cfg.clone();
        info!(namespace = %cfg.namespace, "starting tally operator");

        let stores = Stores::new();
        let queues = Queues::new();
        stores
            .reports
            .register_hook(EnqueueHook::new(Arc::clone(&queues.reports)));
        stores
            .scheduled_reports
            .register_hook(EnqueueHook::new(Arc::clone(&queues.scheduled_reports)));
        stores
            .data_sources
            .register_hook(EnqueueHook::new(Arc::clone(&queues.data_sources)));
        stores
            .generation_queries
            .register_hook(EnqueueHook::new(Arc::clone(&queues.generation_queries)));
        stores
            .prometheus_queries
            .register_hook(EnqueueHook::new(Arc::clone(&queues.prometheus_queries)));
        stores
            .storage_locations
            .register_hook(EnqueueHook::new(Arc::clone(&queues.storage_locations)));
        stores
            .presto_tables
            .register_hook(EnqueueHook::new(Arc::clone(&queues.presto_tables)));

        let hive = Arc::new(HiveClient::new(
            Box::new(ThriftConnector::new(cfg.hive_host.clone())),
            cfg.log_ddl_queries,
            Arc::clone(&self.clock),
            stop.clone(),
        ));
        let presto = Arc::new(PrestoClient::new(
            cfg.presto_host.clone(),
            cfg.log_dml_queries,
            Arc::clone(&self.clock),
            stop.clone(),
        )?);

        let ctx = Arc::new(Ctx {
            namespace: cfg.namespace.clone(),
            stores: stores.clone(),
            hive: hive.clone(),
            presto: presto.clone(),
            status: Arc::new(KubeStatusWriter::new(self.client.clone())),
            clock: Arc::clone(&self.clock),
            log_report: cfg.log_report,
        });

        let runner = ScheduledReportRunner::new(Arc::clone(&ctx), stop.clone());
        stores
            .scheduled_reports
            .register_hook(CancelRunnerOnDelete::new(Arc::clone(&runner)));

        let state = AppState::new();
        info!("starting http server");
        tokio::spawn(http::serve(self.listen_addr, state.clone(), stop.clone()));

        info!("starting resource watches");
        self.spawn_watches(&stores, stop.clone());

        info!("setting up db connections");
        tokio::try_join!(hive.warm_up(), presto.wait_until_available())
            .context("connecting to hive and presto")?;

        let prom = Arc::new(PrometheusClient::new(cfg.prom_host.clone())?);

        info!("waiting for caches to sync");
        self.wait_for_cache_sync(&stores, stop.clone()).await?;

        info!("testing ability to write to presto");
        presto.wait_until_writable().await?;
        info!("writes to presto are succeeding");

        info!("starting workers");
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let (partition_tx, partition_rx) = mpsc::unbounded_channel();

        self.spawn_workers(
            &mut workers,
            &queues.reports,
            ReportReconciler::new(Arc::clone(&ctx)),
        );
        self.spawn_workers(
            &mut workers,
            &queues.scheduled_reports,
            ScheduledReportReconciler::new(Arc::clone(&ctx), Arc::clone(&runner)),
        );
        self.spawn_workers(
            &mut workers,
            &queues.data_sources,
            DataSourceReconciler::new(Arc::clone(&ctx), partition_tx),
        );
        self.spawn_workers(
            &mut workers,
            &queues.generation_queries,
            GenerationQueryReconciler::new(Arc::clone(&ctx)),
        );
        self.spawn_workers(
            &mut workers,
            &queues.prometheus_queries,
            TrackingReconciler::new(
                "ReportPrometheusQuery",
                Arc::clone(&stores.prometheus_queries),
            ),
        );
        self.spawn_workers(
            &mut workers,
            &queues.storage_locations,
            TrackingReconciler::new("StorageLocation", Arc::clone(&stores.storage_locations)),
        );
        self.spawn_workers(
            &mut workers,
            &queues.presto_tables,
            PrestoTableReconciler::new(Arc::clone(&ctx)),
        );
        workers.push(tokio::spawn(run_partition_worker(
            Arc::clone(&ctx),
            partition_rx,
            stop.clone(),
        )));

        workers.push(tokio::spawn(Arc::clone(&runner).run()));

        if cfg.disable_promsum {
            info!("promsum collector disabled");
        } else {
            let collector = PromsumCollector::new(
                Arc::clone(&ctx),
                prom,
                cfg.promsum_interval,
                cfg.promsum_step_size,
                cfg.promsum_chunk_size,
            );
            workers.push(tokio::spawn(collector.run(stop.clone())));
        }

        state.mark_initialized();
        info!("tally operator successfully initialized, waiting for reports");

        let mut stop_wait = stop.clone();
        let _ = stop_wait.changed().await;
        info!("got stop signal, shutting down tally operator");

        queues.shutdown_all();
        for worker in workers {
            let _ = worker.await;
        }
        hive.close().await;
        info!("tally workers and collectors stopped");
        Ok(())
    }

    fn spawn_watches(&self, stores: &Stores, stop: watch::Receiver<bool>) {
        let ns = &self.cfg.namespace;
        let client = &self.client;
        tokio::spawn(run_watch(
            Api::<Report>::namespaced(client.clone(), ns),
            Arc::clone(&stores.reports),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<ScheduledReport>::namespaced(client.clone(), ns),
            Arc::clone(&stores.scheduled_reports),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<ReportDataSource>::namespaced(client.clone(), ns),
            Arc::clone(&stores.data_sources),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<ReportGenerationQuery>::namespaced(client.clone(), ns),
            Arc::clone(&stores.generation_queries),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<ReportPrometheusQuery>::namespaced(client.clone(), ns),
            Arc::clone(&stores.prometheus_queries),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<StorageLocation>::namespaced(client.clone(), ns),
            Arc::clone(&stores.storage_locations),
            stop.clone(),
        ));
        tokio::spawn(run_watch(
            Api::<PrestoTable>::namespaced(client.clone(), ns),
            Arc::clone(&stores.presto_tables),
            stop.clone(),
        ));
    }

    fn spawn_workers(
        &self,
        workers: &mut Vec<JoinHandle<()>>,
        queue: &Arc<WorkQueue>,
        reconciler: Arc<dyn Reconciler>,
    ) {
        let kind = reconciler.kind();
        for i in 0..THREADINESS {
            debug!(kind, worker = i, "starting worker");
            workers.push(tokio::spawn(run_worker(
                Arc::clone(queue),
                Arc::clone(&reconciler),
            )));
        }
    }

    async fn wait_for_cache_sync(
        &self,
        stores: &Stores,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if stores.all_synced() {
                return Ok(());
            }
            tokio::select! {
                _ = stop.changed() => return Err(Error::Shutdown.into()),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}
