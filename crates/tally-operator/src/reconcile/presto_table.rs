//! PrestoTable reconciler and partition worker
//!
//! The reconciler itself only tracks the catalog of operator-managed
//! tables; partition GC may land here later. The partition worker consumes
//! data sources whose tables are externally loaded (AWS billing) and keeps
//! their current billing-period partition registered in Hive.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use tally_common::Result;

use crate::promsum::billing_period_strings;
use crate::store::ObjectKey;

use super::Ctx;
use super::Reconciler;

pub struct PrestoTableReconciler {
    ctx: Arc<Ctx>,
}

impl PrestoTableReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }
}

#[async_trait]
impl Reconciler for PrestoTableReconciler {
    fn kind(&self) -> &'static str {
        "PrestoTable"
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let Some(key) = ObjectKey::parse(key) else {
            return Ok(());
        };
        match self.ctx.stores.presto_tables.get(&key.namespace, &key.name) {
            Some(table) => debug!(%key, table = %table.spec.table_name, "presto table tracked"),
            None => debug!(%key, "presto table deleted"),
        }
        Ok(())
    }
}

/// Register the current billing-period partition for externally loaded
/// tables as data sources arrive on the channel.
pub async fn run_partition_worker(
    ctx: Arc<Ctx>,
    mut sources: mpsc::UnboundedReceiver<ObjectKey>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            _ = stop.changed() => return,
            key = sources.recv() => match key {
                Some(key) => key,
                None => return,
            },
        };
        if let Err(err) = add_current_partition(&ctx, &key).await {
            error!(%key, error = %err, "failed to add table partition");
        }
    }
}

async fn add_current_partition(ctx: &Ctx, key: &ObjectKey) -> Result<()> {
    let Some(source) = ctx.stores.data_sources.get(&key.namespace, &key.name) else {
        return Ok(());
    };
    let Some(table) = source.status.as_ref().and_then(|s| s.table_name.clone()) else {
        return Ok(());
    };
    let Some(billing) = &source.spec.aws_billing else {
        return Ok(());
    };

    let (start, end) = billing_period_strings(ctx.clock.now());
    let location = format!(
        "s3a://{}/{}/{}",
        billing.bucket,
        billing.prefix.trim_matches('/'),
        start
    );
    ctx.hive
        .query(&format!(
            "ALTER TABLE {table} ADD IF NOT EXISTS \
             PARTITION (`billing_period_start`='{start}', `billing_period_end`='{end}') \
             LOCATION '{location}'"
        ))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AwsBillingSource, ReportDataSource, ReportDataSourceSpec};
    use crate::testutil::*;

    #[tokio::test]
    async fn registers_the_current_billing_period() {
        let stores = super::super::Stores::new();
        let hive = RecordingHive::new();
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
            presto: RecordingPresto::new(),
            status,
            clock: Arc::new(tally_common::clock::FakeClock::new(ts(2019, 1, 15, 12, 0))),
            log_report: false,
        });
        let mut source = ReportDataSource::new(
            "billing",
            ReportDataSourceSpec {
                promsum: None,
                aws_billing: Some(AwsBillingSource {
                    bucket: "acme".into(),
                    prefix: "cur/".into(),
                }),
                storage_location: None,
            },
        );
        source.metadata.namespace = Some("tally".into());
        ctx.stores
            .data_sources
            .apply(with_table(source, "aws_billing_billing"));

        add_current_partition(&ctx, &ObjectKey::new("tally", "billing"))
            .await
            .unwrap();

        let ddl = hive.queries();
        assert_eq!(ddl.len(), 1);
        assert!(ddl[0].contains("ALTER TABLE aws_billing_billing ADD IF NOT EXISTS"));
        assert!(ddl[0].contains("`billing_period_start`='20190101'"));
        assert!(ddl[0].contains("`billing_period_end`='20190201'"));
        assert!(ddl[0].contains("LOCATION 's3a://acme/cur/20190101'"));
    }
}
