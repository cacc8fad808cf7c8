//! Report reconciler
//!
//! Drives the `Pending → Started → Finished` machine. Validation failures
//! are terminal: the report is marked `Failed` and its key is forgotten
//! without touching Hive or Presto. Missing dependencies requeue with
//! backoff; execution errors beyond the retry budget also land in
//! `Failed` via the queue's drop hook.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tally_common::{Error, Result};

use crate::crd::{Column, Report, ReportGenerationQuery, ReportPhase, ReportStatus};
use crate::naming::{report_table_name, table_location, DEFAULT_STORAGE_BASE};
use crate::store::ObjectKey;
use crate::template::{ReportContext, TemplateRenderer};

use super::{deps, Ctx, Reconciler};

pub struct ReportReconciler {
    ctx: Arc<Ctx>,
}

impl ReportReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    async fn fail(&self, key: &ObjectKey, prior: Option<&ReportStatus>, message: String) -> Result<()> {
        let mut status = prior.cloned().unwrap_or_default();
        status.phase = ReportPhase::Failed;
        status.message = Some(message);
        self.ctx
            .status
            .report(&key.namespace, &key.name, &status)
            .await
    }

    /// `unset → Pending`: check the query reference and the window shape.
    async fn validate(&self, key: &ObjectKey, report: &Report) -> Result<()> {
        if report.spec.reporting_start >= report.spec.reporting_end {
            return self
                .fail(
                    key,
                    None,
                    format!(
                        "reporting window is empty: start {} is not before end {}",
                        report.spec.reporting_start, report.spec.reporting_end
                    ),
                )
                .await;
        }
        if self
            .ctx
            .stores
            .generation_queries
            .get(&key.namespace, &report.spec.generation_query)
            .is_none()
        {
            return self
                .fail(
                    key,
                    None,
                    format!(
                        "unknown ReportGenerationQuery {}",
                        report.spec.generation_query
                    ),
                )
                .await;
        }
        self.ctx
            .status
            .report(&key.namespace, &key.name, &ReportStatus::default())
            .await
    }

    /// `Pending → Started`: resolve the dependency closure and create the
    /// output table.
    async fn start(&self, key: &ObjectKey, report: &Report) -> Result<()> {
        let query = self.lookup_query(key, report)?;
        match deps::resolve(
            &self.ctx.stores.generation_queries,
            &self.ctx.stores.data_sources,
            &key.namespace,
            &query,
        ) {
            Ok(_) => {}
            Err(err) if err.is_terminal() => {
                return self.fail(key, report.status.as_ref(), err.to_string()).await;
            }
            Err(err) => return Err(err),
        }

        let table = report_table_name(&key.name);
        create_output_table(&self.ctx, &table, &query.spec.columns).await?;

        let status = ReportStatus {
            phase: ReportPhase::Started,
            table_name: Some(table),
            message: None,
        };
        self.ctx
            .status
            .report(&key.namespace, &key.name, &status)
            .await
    }

    /// `Started → Finished`: render and insert.
    async fn finish(&self, key: &ObjectKey, report: &Report) -> Result<()> {
        let query = self.lookup_query(key, report)?;
        let table = report
            .status
            .as_ref()
            .and_then(|s| s.table_name.clone())
            .unwrap_or_else(|| report_table_name(&key.name));

        let context = ReportContext::new(report.spec.reporting_start, report.spec.reporting_end)
            .with_inputs(merge_inputs(&query, &report.spec.inputs));
        match insert_report_rows(&self.ctx, &key.namespace, &table, &query, &context).await {
            Ok(()) => {}
            Err(err) if err.is_terminal() => {
                return self.fail(key, report.status.as_ref(), err.to_string()).await;
            }
            Err(err) => return Err(err),
        }

        let status = ReportStatus {
            phase: ReportPhase::Finished,
            table_name: Some(table),
            message: None,
        };
        self.ctx
            .status
            .report(&key.namespace, &key.name, &status)
            .await
    }

    fn lookup_query(&self, key: &ObjectKey, report: &Report) -> Result<Arc<ReportGenerationQuery>> {
        self.ctx
            .stores
            .generation_queries
            .get(&key.namespace, &report.spec.generation_query)
            .ok_or_else(|| {
                Error::DependencyNotReady(format!(
                    "ReportGenerationQuery {} is gone",
                    report.spec.generation_query
                ))
            })
    }
}

#[async_trait]
impl Reconciler for ReportReconciler {
    fn kind(&self) -> &'static str {
        "Report"
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let Some(key) = ObjectKey::parse(key) else {
            return Ok(());
        };
        let Some(report) = self.ctx.stores.reports.get(&key.namespace, &key.name) else {
            debug!(%key, "report deleted, nothing to do");
            return Ok(());
        };
        match report.status.as_ref().map(|s| s.phase) {
            None => self.validate(&key, &report).await,
            Some(ReportPhase::Pending) => self.start(&key, &report).await,
            Some(ReportPhase::Started) => self.finish(&key, &report).await,
            Some(ReportPhase::Finished) | Some(ReportPhase::Failed) => Ok(()),
        }
    }

    async fn on_drop(&self, key: &str) {
        let Some(key) = ObjectKey::parse(key) else {
            return;
        };
        let Some(report) = self.ctx.stores.reports.get(&key.namespace, &key.name) else {
            return;
        };
        let phase = report.status.as_ref().map(|s| s.phase);
        if matches!(phase, Some(ReportPhase::Finished) | Some(ReportPhase::Failed)) {
            return;
        }
        if let Err(err) = self
            .fail(
                &key,
                report.status.as_ref(),
                "retry budget exhausted".to_string(),
            )
            .await
        {
            debug!(%key, error = %err, "failed to mark dropped report as Failed");
        }
    }
}

/// Merge a report's provided inputs over the query's declared defaults.
pub(crate) fn merge_inputs(
    query: &ReportGenerationQuery,
    provided: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut inputs = BTreeMap::new();
    for input in &query.spec.inputs {
        if let Some(default) = &input.default {
            inputs.insert(input.name.clone(), default.clone());
        }
    }
    for (name, value) in provided {
        inputs.insert(name.clone(), value.clone());
    }
    inputs
}

/// Create the output table for a report with the query's declared columns.
pub(crate) async fn create_output_table(ctx: &Ctx, table: &str, columns: &[Column]) -> Result<()> {
    let columns_sql = columns
        .iter()
        .map(|c| format!("`{}` {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    let location = table_location(DEFAULT_STORAGE_BASE, table);
    ctx.hive
        .query(&format!(
            "CREATE EXTERNAL TABLE IF NOT EXISTS {table} ({columns_sql}) STORED AS PARQUET LOCATION '{location}'"
        ))
        .await
}

/// Render the query against `context` and insert the result rows.
pub(crate) async fn insert_report_rows(
    ctx: &Ctx,
    namespace: &str,
    table: &str,
    query: &ReportGenerationQuery,
    context: &ReportContext,
) -> Result<()> {
    let renderer = TemplateRenderer::new(
        Arc::clone(&ctx.stores.generation_queries),
        Arc::clone(&ctx.stores.data_sources),
        namespace,
    );
    let rendered = renderer.render(&query.spec.query, context)?;
    if ctx.log_report {
        info!(table, body = %rendered, "rendered report query");
    }
    ctx.presto
        .execute(&format!("INSERT INTO {table} {rendered}"))
        .await
}

/// Execute one reporting window through the same path the Report
/// reconciler uses; the scheduled runner calls this per window.
pub(crate) async fn run_report_window(
    ctx: &Ctx,
    namespace: &str,
    query: &ReportGenerationQuery,
    table: &str,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    inputs: &BTreeMap<String, String>,
    create_table: bool,
) -> Result<()> {
    deps::resolve(
        &ctx.stores.generation_queries,
        &ctx.stores.data_sources,
        namespace,
        query,
    )?;
    if create_table {
        create_output_table(ctx, table, &query.spec.columns).await?;
    }
    let context = ReportContext::new(start, end).with_inputs(merge_inputs(query, inputs));
    insert_report_rows(ctx, namespace, table, query, &context).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::QueryInput;
    use crate::testutil::*;

    fn test_ctx() -> (Arc<Ctx>, Arc<RecordingHive>, Arc<RecordingPresto>) {
        let stores = super::super::Stores::new();
        let hive = RecordingHive::new();
        let presto = RecordingPresto::new();
        let status = FakeStatusWriter::new(
            Arc::clone(&stores.reports),
            Arc::clone(&stores.scheduled_reports),
            Arc::clone(&stores.data_sources),
            Arc::clone(&stores.generation_queries),
            Arc::clone(&stores.presto_tables),
        );
        let ctx = Arc::new(Ctx {
            namespace: "tally".into(),
            stores,
            hive: hive.clone(),
            presto: presto.clone(),
            status,
            clock: Arc::new(tally_common::clock::FakeClock::new(ts(2019, 1, 10, 0, 0))),
            log_report: false,
        });
        (ctx, hive, presto)
    }

    async fn sync_until_settled(reconciler: &ReportReconciler, key: &str) {
        // Each sync advances at most one phase; four passes reach a
        // terminal state from anywhere.
        for _ in 0..4 {
            reconciler.sync(key).await.unwrap();
        }
    }

    fn phase(ctx: &Ctx, name: &str) -> ReportPhase {
        ctx.stores
            .reports
            .get("tally", name)
            .unwrap()
            .status
            .as_ref()
            .unwrap()
            .phase
    }

    #[tokio::test]
    async fn single_report_happy_path() {
        let (ctx, hive, presto) = test_ctx();
        let mut query = generation_query(
            "tally",
            "daily-usage",
            "SELECT * FROM {{dataSourceTableName \"d\"}}",
        );
        query.spec.report_data_sources = vec!["d".into()];
        ctx.stores.generation_queries.apply(query);
        ctx.stores.data_sources.apply(with_table(
            data_source("tally", "d", "pod-usage"),
            "hive.default.d",
        ));
        ctx.stores.reports.apply(report(
            "tally",
            "r",
            "daily-usage",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 2, 0, 0),
        ));

        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        sync_until_settled(&reconciler, "tally/r").await;

        assert_eq!(phase(&ctx, "r"), ReportPhase::Finished);
        let ddl = hive.queries();
        assert_eq!(ddl.len(), 1);
        assert!(ddl[0].contains("CREATE EXTERNAL TABLE IF NOT EXISTS report_r"));
        assert!(ddl[0].contains("`amount` double"));
        let dml = presto.queries();
        assert_eq!(dml.len(), 1, "exactly one insert");
        assert!(dml[0].starts_with("INSERT INTO report_r "));
        assert!(dml[0].contains("FROM hive.default.d"));
    }

    #[tokio::test]
    async fn empty_window_fails_validation_with_no_traffic() {
        let (ctx, hive, presto) = test_ctx();
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        ctx.stores.reports.apply(report(
            "tally",
            "empty",
            "q",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 1, 0, 0),
        ));

        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        sync_until_settled(&reconciler, "tally/empty").await;

        assert_eq!(phase(&ctx, "empty"), ReportPhase::Failed);
        assert!(hive.queries().is_empty());
        assert!(presto.queries().is_empty());
    }

    #[tokio::test]
    async fn unknown_query_fails_validation() {
        let (ctx, _, _) = test_ctx();
        ctx.stores.reports.apply(report(
            "tally",
            "r",
            "ghost",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 2, 0, 0),
        ));
        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        sync_until_settled(&reconciler, "tally/r").await;
        assert_eq!(phase(&ctx, "r"), ReportPhase::Failed);
    }

    #[tokio::test]
    async fn missing_dependency_requeues_instead_of_failing() {
        let (ctx, _, _) = test_ctx();
        let mut query = generation_query("tally", "q", "SELECT 1");
        query.spec.report_data_sources = vec!["absent".into()];
        ctx.stores.generation_queries.apply(query);
        ctx.stores.reports.apply(report(
            "tally",
            "r",
            "q",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 2, 0, 0),
        ));

        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        reconciler.sync("tally/r").await.unwrap();
        assert_eq!(phase(&ctx, "r"), ReportPhase::Pending);
        let err = reconciler.sync("tally/r").await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady(_)));
        assert_eq!(phase(&ctx, "r"), ReportPhase::Pending);
    }

    #[tokio::test]
    async fn finished_report_is_a_no_op() {
        let (ctx, hive, presto) = test_ctx();
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        ctx.stores.reports.apply(report(
            "tally",
            "r",
            "q",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 2, 0, 0),
        ));
        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        sync_until_settled(&reconciler, "tally/r").await;
        assert_eq!(phase(&ctx, "r"), ReportPhase::Finished);

        let hive_before = hive.queries().len();
        let presto_before = presto.queries().len();
        reconciler.sync("tally/r").await.unwrap();
        reconciler.sync("tally/r").await.unwrap();
        assert_eq!(hive.queries().len(), hive_before);
        assert_eq!(presto.queries().len(), presto_before);
    }

    #[tokio::test]
    async fn dependency_chain_with_disabled_view_inlines() {
        let (ctx, _, presto) = test_ctx();
        // raw is materialized as a view; filtered is view-disabled and
        // inlined; final reads both.
        let raw = with_view(generation_query("tally", "raw", "SELECT 1"), "view_raw");
        ctx.stores.generation_queries.apply(raw);
        let mut filtered = generation_query(
            "tally",
            "filtered",
            "SELECT * FROM {{generationQueryViewName \"raw\"}}",
        );
        filtered.spec.view.disabled = true;
        filtered.spec.report_queries = vec!["raw".into()];
        ctx.stores.generation_queries.apply(filtered);
        let mut fin = generation_query(
            "tally",
            "final",
            "SELECT count(*) FROM ({{renderReportGenerationQuery \"filtered\"}})",
        );
        fin.spec.dynamic_report_queries = vec!["filtered".into()];
        ctx.stores.generation_queries.apply(fin);
        ctx.stores.reports.apply(report(
            "tally",
            "final",
            "final",
            ts(2019, 1, 1, 0, 0),
            ts(2019, 1, 2, 0, 0),
        ));

        let reconciler = ReportReconciler::new(Arc::clone(&ctx));
        sync_until_settled(&reconciler, "tally/final").await;

        assert_eq!(phase(&ctx, "final"), ReportPhase::Finished);
        let dml = presto.queries();
        assert_eq!(dml.len(), 1);
        assert!(dml[0].starts_with("INSERT INTO report_final "));
        assert!(
            dml[0].contains("FROM (SELECT * FROM view_raw)"),
            "filtered must be inlined, got: {}",
            dml[0]
        );
    }

    #[test]
    fn inputs_merge_defaults_under_provided_values() {
        let mut query = generation_query("tally", "q", "SELECT 1");
        query.spec.inputs = vec![
            QueryInput {
                name: "cluster".into(),
                default: Some("default-cluster".into()),
            },
            QueryInput {
                name: "team".into(),
                default: None,
            },
        ];
        let mut provided = BTreeMap::new();
        provided.insert("cluster".to_string(), "prod".to_string());
        let merged = merge_inputs(&query, &provided);
        assert_eq!(merged.get("cluster").unwrap(), "prod");
        assert!(!merged.contains_key("team"));
    }
}
