//! Promsum: Prometheus → Hive ingestion
//!
//! A single loop ticks every `PromsumInterval` and pulls each
//! Prometheus-backed data source forward. Per source, a cursor marks how
//! far ingestion has reached; each tick ingests at most one chunk ending a
//! safety margin behind the wall clock, split into monthly billing-period
//! partitions. The cursor only advances after a successful write, so a
//! failing source retries the same window on the next tick and can never
//! leave a gap.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::{stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error};

use tally_common::{Error, Result};

use crate::crd::ReportDataSource;
use crate::presto::quote_literal;
use crate::prom::PromQuerier;
use crate::reconcile::data_source::resolve_storage_base;
use crate::reconcile::Ctx;
use crate::store::ObjectKey;

/// Sources ingested concurrently per tick.
const SOURCE_CONCURRENCY: usize = 4;

/// Timestamp format Presto uses in result sets.
const PRESTO_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One row bound for the Promsum schema.
#[derive(Debug, Clone)]
pub struct PromsumRecord {
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub time_precision: f64,
    pub labels: BTreeMap<String, String>,
}

impl PromsumRecord {
    fn values_sql(&self, period_start: &str, period_end: &str) -> String {
        let (keys, values): (Vec<_>, Vec<_>) = self
            .labels
            .iter()
            .map(|(k, v)| (quote_literal(k), quote_literal(v)))
            .unzip();
        format!(
            "({amount}, timestamp '{ts}', {precision}, map(ARRAY[{keys}], ARRAY[{values}]), '{period_start}', '{period_end}')",
            amount = self.amount,
            ts = self.timestamp.format(PRESTO_TIMESTAMP_FORMAT),
            precision = self.time_precision,
            keys = keys.join(", "),
            values = values.join(", "),
        )
    }
}

/// Monthly billing period containing `t`: first of the month to the first
/// of the next month.
pub fn billing_period(t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t);
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(start);
    (start, end)
}

/// Billing period of `t` as `YYYYMMDD` partition values.
pub fn billing_period_strings(t: DateTime<Utc>) -> (String, String) {
    let (start, end) = billing_period(t);
    (
        start.format("%Y%m%d").to_string(),
        end.format("%Y%m%d").to_string(),
    )
}

pub struct PromsumCollector {
    ctx: Arc<Ctx>,
    prom: Arc<dyn PromQuerier>,
    interval: Duration,
    step: Duration,
    chunk: Duration,
    /// Per-source high-water mark; rebuilt from the backing tables on
    /// startup.
    cursors: DashMap<String, DateTime<Utc>>,
}

impl PromsumCollector {
    pub fn new(
        ctx: Arc<Ctx>,
        prom: Arc<dyn PromQuerier>,
        interval: Duration,
        step: Duration,
        chunk: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            prom,
            interval,
            step,
            chunk,
            cursors: DashMap::new(),
        })
    }

    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("promsum collector stopping");
                    return;
                }
                _ = tick.tick() => self.collect_all().await,
            }
        }
    }

    /// One tick: ingest every Prometheus-backed source, bounded fan-out,
    /// failures isolated per source.
    pub async fn collect_all(&self) {
        let sources: Vec<Arc<ReportDataSource>> = self
            .ctx
            .stores
            .data_sources
            .list(&self.ctx.namespace)
            .into_iter()
            .filter(|s| s.spec.promsum.is_some())
            .collect();
        stream::iter(sources)
            .for_each_concurrent(SOURCE_CONCURRENCY, |source| async move {
                let name = kube::ResourceExt::name_any(source.as_ref());
                if let Err(err) = self.collect_source(&source).await {
                    error!(source = %name, error = %err, "promsum collection failed");
                }
            })
            .await;
    }

    pub(crate) async fn collect_source(&self, source: &ReportDataSource) -> Result<()> {
        let Some(promsum) = &source.spec.promsum else {
            return Ok(());
        };
        let Some(namespace) = kube::ResourceExt::namespace(source) else {
            return Ok(());
        };
        let name = kube::ResourceExt::name_any(source);
        let Some(table) = source.status.as_ref().and_then(|s| s.table_name.clone()) else {
            debug!(source = %name, "source has no backing table yet, skipping");
            return Ok(());
        };
        let key = ObjectKey::new(namespace.clone(), name.clone()).to_string();

        let cursor = match self.cursors.get(&key).map(|c| *c) {
            Some(cursor) => Some(cursor),
            None => self.reconstruct_cursor(&table).await?,
        };

        let step = chrono::Duration::from_std(self.step).unwrap_or(chrono::Duration::seconds(60));
        let now = self.ctx.clock.now();
        // Stay one step behind the wall clock; the newest step may still be
        // filling in on the Prometheus side.
        let horizon = now - step;
        let chunk = chrono::Duration::from_std(self.chunk).unwrap_or(chrono::Duration::minutes(5));
        let start = cursor.unwrap_or(horizon - chunk);
        let end = (start + chunk).min(horizon);
        if end - start < step {
            debug!(source = %name, "ingestion window narrower than one step, skipping");
            return Ok(());
        }

        let expr = self
            .ctx
            .stores
            .prometheus_queries
            .get(&namespace, &promsum.query)
            .ok_or_else(|| {
                Error::not_found("ReportPrometheusQuery", &namespace, &promsum.query)
            })?;

        let series = self
            .prom
            .query_range(&expr.spec.query, start, end, self.step)
            .await?;

        let records: Vec<PromsumRecord> = series
            .into_iter()
            .flat_map(|series| {
                let labels: BTreeMap<String, String> = series.labels.into_iter().collect();
                series.samples.into_iter().map(move |sample| PromsumRecord {
                    amount: sample.value,
                    timestamp: sample.timestamp,
                    time_precision: self.step.as_secs_f64(),
                    labels: labels.clone(),
                })
            })
            // The range query is inclusive on both ends; the window is
            // half-open so the next chunk starts exactly at `end`.
            .filter(|record| record.timestamp >= start && record.timestamp < end)
            .collect();

        if !records.is_empty() {
            self.write_records(source, &namespace, &table, records).await?;
        }
        self.cursors.insert(key, end);
        Ok(())
    }

    /// Recover the high-water mark from the table: the last ingested
    /// sample plus one step.
    async fn reconstruct_cursor(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let rows = self
            .ctx
            .presto
            .query(&format!(
                "SELECT max(\"timestamp\") AS last_timestamp FROM {table}"
            ))
            .await?;
        let Some(value) = rows
            .first()
            .and_then(|row| row.get("last_timestamp"))
            .and_then(|v| v.as_str())
        else {
            return Ok(None);
        };
        let last = NaiveDateTime::parse_from_str(value, PRESTO_TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
            .map_err(|err| Error::QueryFailed(format!("bad max timestamp {value:?}: {err}")))?;
        let step = chrono::Duration::from_std(self.step).unwrap_or(chrono::Duration::seconds(60));
        Ok(Some(last.and_utc() + step))
    }

    async fn write_records(
        &self,
        source: &ReportDataSource,
        namespace: &str,
        table: &str,
        records: Vec<PromsumRecord>,
    ) -> Result<()> {
        // Split into per-billing-period batches; a chunk can straddle a
        // month boundary.
        let mut batches: BTreeMap<(String, String), Vec<PromsumRecord>> = BTreeMap::new();
        for record in records {
            let period = billing_period_strings(record.timestamp);
            batches.entry(period).or_default().push(record);
        }

        let base = resolve_storage_base(&self.ctx, namespace, source);
        let table_location = crate::naming::table_location(&base, table);
        for ((period_start, period_end), batch) in batches {
            let location =
                crate::naming::partition_location(&table_location, &period_start, &period_end);
            self.ctx
                .hive
                .query(&format!(
                    "ALTER TABLE {table} ADD IF NOT EXISTS \
                     PARTITION (`billing_period_start`='{period_start}', `billing_period_end`='{period_end}') \
                     LOCATION '{location}'"
                ))
                .await?;

            let values = batch
                .iter()
                .map(|record| record.values_sql(&period_start, &period_end))
                .collect::<Vec<_>>()
                .join(", ");
            self.ctx
                .presto
                .execute(&format!(
                    "INSERT INTO {table} (\"amount\", \"timestamp\", \"timePrecision\", \"labels\", \
                     \"billing_period_start\", \"billing_period_end\") VALUES {values}"
                ))
                .await?;
        }
        Ok(())
    }
}
