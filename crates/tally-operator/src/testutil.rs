//! Shared test fixtures: resource constructors and in-memory fakes for the
//! external data plane.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;

use tally_common::{Error, Result};

use crate::crd::*;
use crate::hive::HiveQueryer;
use crate::presto::{PrestoQueryer, Row};
use crate::prom::{PromQuerier, Series};
use crate::status::StatusWriter;
use crate::store::Store;

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn namespaced<K: kube::Resource<DynamicType = ()>>(mut obj: K, namespace: &str) -> K {
    obj.meta_mut().namespace = Some(namespace.to_string());
    obj
}

pub fn report(namespace: &str, name: &str, query: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Report {
    namespaced(
        Report::new(
            name,
            ReportSpec {
                generation_query: query.to_string(),
                reporting_start: start,
                reporting_end: end,
                inputs: BTreeMap::new(),
            },
        ),
        namespace,
    )
}

pub fn scheduled_report(
    namespace: &str,
    name: &str,
    query: &str,
    period: SchedulePeriod,
) -> ScheduledReport {
    namespaced(
        ScheduledReport::new(
            name,
            ScheduledReportSpec {
                generation_query: query.to_string(),
                schedule: Schedule {
                    period,
                    phase_seconds: 0,
                },
                reporting_start: None,
                suspend: false,
                inputs: BTreeMap::new(),
            },
        ),
        namespace,
    )
}

pub fn generation_query(namespace: &str, name: &str, template: &str) -> ReportGenerationQuery {
    namespaced(
        ReportGenerationQuery::new(
            name,
            ReportGenerationQuerySpec {
                query: template.to_string(),
                columns: vec![Column {
                    name: "amount".into(),
                    sql_type: "double".into(),
                    unit: None,
                }],
                inputs: Vec::new(),
                report_queries: Vec::new(),
                dynamic_report_queries: Vec::new(),
                report_data_sources: Vec::new(),
                view: ViewSettings::default(),
            },
        ),
        namespace,
    )
}

pub fn with_view(mut query: ReportGenerationQuery, view: &str) -> ReportGenerationQuery {
    query.status = Some(ReportGenerationQueryStatus {
        view_name: Some(view.to_string()),
    });
    query
}

pub fn data_source(namespace: &str, name: &str, prom_query: &str) -> ReportDataSource {
    namespaced(
        ReportDataSource::new(
            name,
            ReportDataSourceSpec {
                promsum: Some(PromsumSource {
                    query: prom_query.to_string(),
                }),
                aws_billing: None,
                storage_location: None,
            },
        ),
        namespace,
    )
}

pub fn with_table(mut source: ReportDataSource, table: &str) -> ReportDataSource {
    source.status = Some(ReportDataSourceStatus {
        table_name: Some(table.to_string()),
    });
    source
}

pub fn prometheus_query(namespace: &str, name: &str, expr: &str) -> ReportPrometheusQuery {
    namespaced(
        ReportPrometheusQuery::new(
            name,
            ReportPrometheusQuerySpec {
                query: expr.to_string(),
            },
        ),
        namespace,
    )
}

/// Hive fake that records every DDL statement.
#[derive(Default)]
pub struct RecordingHive {
    pub queries: Mutex<Vec<String>>,
    pub fail_with: Mutex<Option<Error>>,
}

impl RecordingHive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl HiveQueryer for RecordingHive {
    async fn query(&self, query: &str) -> Result<()> {
        if let Some(err) = self.fail_with.lock().take() {
            return Err(err);
        }
        self.queries.lock().push(query.to_string());
        Ok(())
    }
}

/// Presto fake that records statements and returns scripted rows.
#[derive(Default)]
pub struct RecordingPresto {
    pub queries: Mutex<Vec<String>>,
    pub rows: Mutex<Vec<Row>>,
    pub fail_with: Mutex<Option<Error>>,
}

impl RecordingPresto {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl PrestoQueryer for RecordingPresto {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        if let Some(err) = self.fail_with.lock().take() {
            return Err(err);
        }
        self.queries.lock().push(sql.to_string());
        Ok(self.rows.lock().clone())
    }
}

/// Prometheus fake returning scripted series and recording query windows.
#[derive(Default)]
pub struct FakeProm {
    pub series: Mutex<Vec<Series>>,
    pub calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
}

impl FakeProm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PromQuerier for FakeProm {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step: std::time::Duration,
    ) -> Result<Vec<Series>> {
        self.calls.lock().push((query.to_string(), start, end));
        Ok(self.series.lock().clone())
    }
}

/// Status writer that applies patches straight into the stores, standing in
/// for the API server + watch round trip.
pub struct FakeStatusWriter {
    pub reports: Arc<Store<Report>>,
    pub scheduled_reports: Arc<Store<ScheduledReport>>,
    pub data_sources: Arc<Store<ReportDataSource>>,
    pub generation_queries: Arc<Store<ReportGenerationQuery>>,
    pub presto_tables: Arc<Store<PrestoTable>>,
    pub created_tables: Mutex<Vec<PrestoTable>>,
}

impl FakeStatusWriter {
    pub fn new(
        reports: Arc<Store<Report>>,
        scheduled_reports: Arc<Store<ScheduledReport>>,
        data_sources: Arc<Store<ReportDataSource>>,
        generation_queries: Arc<Store<ReportGenerationQuery>>,
        presto_tables: Arc<Store<PrestoTable>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reports,
            scheduled_reports,
            data_sources,
            generation_queries,
            presto_tables,
            created_tables: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl StatusWriter for FakeStatusWriter {
    async fn report(&self, namespace: &str, name: &str, status: &ReportStatus) -> Result<()> {
        let current = self
            .reports
            .get(namespace, name)
            .ok_or_else(|| Error::not_found("Report", namespace, name))?;
        let mut updated = (*current).clone();
        updated.status = Some(status.clone());
        self.reports.apply(updated);
        Ok(())
    }

    async fn scheduled_report(
        &self,
        namespace: &str,
        name: &str,
        status: &ScheduledReportStatus,
    ) -> Result<()> {
        let current = self
            .scheduled_reports
            .get(namespace, name)
            .ok_or_else(|| Error::not_found("ScheduledReport", namespace, name))?;
        let mut updated = (*current).clone();
        updated.status = Some(status.clone());
        self.scheduled_reports.apply(updated);
        Ok(())
    }

    async fn data_source(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportDataSourceStatus,
    ) -> Result<()> {
        let current = self
            .data_sources
            .get(namespace, name)
            .ok_or_else(|| Error::not_found("ReportDataSource", namespace, name))?;
        let mut updated = (*current).clone();
        updated.status = Some(status.clone());
        self.data_sources.apply(updated);
        Ok(())
    }

    async fn generation_query(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportGenerationQueryStatus,
    ) -> Result<()> {
        let current = self
            .generation_queries
            .get(namespace, name)
            .ok_or_else(|| Error::not_found("ReportGenerationQuery", namespace, name))?;
        let mut updated = (*current).clone();
        updated.status = Some(status.clone());
        self.generation_queries.apply(updated);
        Ok(())
    }

    async fn create_presto_table(&self, namespace: &str, table: &PrestoTable) -> Result<()> {
        let mut table = table.clone();
        if table.namespace().is_none() {
            table.metadata.namespace = Some(namespace.to_string());
        }
        self.created_tables.lock().push(table.clone());
        self.presto_tables.apply(table);
        Ok(())
    }
}
