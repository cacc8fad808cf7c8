//! ReportDataSource reconciler
//!
//! Prometheus-backed sources get a Hive table with the fixed Promsum
//! schema, partitioned by billing period. AWS-billing sources register
//! their existing S3 location without creating anything; the PrestoTable
//! partition worker keeps their partitions current. The operator never
//! deletes the underlying tables.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tally_common::Result;

use crate::crd::{
    Column, PrestoTable, PrestoTableSpec, ReportDataSource, ReportDataSourceStatus,
};
use crate::naming::{data_source_table_name, sanitize_identifier, table_location, DEFAULT_STORAGE_BASE};
use crate::store::ObjectKey;

use super::{Ctx, Reconciler};

/// The fixed schema Promsum writes into.
pub(crate) fn promsum_columns() -> Vec<Column> {
    vec![
        Column {
            name: "amount".into(),
            sql_type: "double".into(),
            unit: None,
        },
        Column {
            name: "timestamp".into(),
            sql_type: "timestamp".into(),
            unit: None,
        },
        Column {
            name: "timePrecision".into(),
            sql_type: "double".into(),
            unit: Some("seconds".into()),
        },
        Column {
            name: "labels".into(),
            sql_type: "map<string,string>".into(),
            unit: None,
        },
    ]
}

pub(crate) fn partition_columns() -> Vec<Column> {
    vec![
        Column {
            name: "billing_period_start".into(),
            sql_type: "string".into(),
            unit: None,
        },
        Column {
            name: "billing_period_end".into(),
            sql_type: "string".into(),
            unit: None,
        },
    ]
}

/// Resolve the storage base for a data source: its named StorageLocation,
/// else the namespace default, else the built-in base.
pub(crate) fn resolve_storage_base(ctx: &Ctx, namespace: &str, source: &ReportDataSource) -> String {
    if let Some(name) = &source.spec.storage_location {
        if let Some(location) = ctx.stores.storage_locations.get(namespace, name) {
            return location.spec.location.clone();
        }
        warn!(
            storage_location = name,
            "named StorageLocation not found, using default"
        );
    }
    ctx.stores
        .storage_locations
        .list(namespace)
        .into_iter()
        .find(|l| l.spec.default)
        .map(|l| l.spec.location.clone())
        .unwrap_or_else(|| DEFAULT_STORAGE_BASE.to_string())
}

pub struct DataSourceReconciler {
    ctx: Arc<Ctx>,
    /// Sources handed to the PrestoTable partition worker after
    /// registration.
    partition_tx: mpsc::UnboundedSender<ObjectKey>,
}

impl DataSourceReconciler {
    pub fn new(ctx: Arc<Ctx>, partition_tx: mpsc::UnboundedSender<ObjectKey>) -> Arc<Self> {
        Arc::new(Self { ctx, partition_tx })
    }

    async fn sync_promsum(&self, key: &ObjectKey, source: &ReportDataSource) -> Result<()> {
        let table = data_source_table_name(&key.name);
        let base = resolve_storage_base(&self.ctx, &key.namespace, source);
        let location = table_location(&base, &table);

        let columns_sql = promsum_columns()
            .iter()
            .map(|c| format!("`{}` {}", c.name, c.sql_type))
            .collect::<Vec<_>>()
            .join(", ");
        let partitions_sql = partition_columns()
            .iter()
            .map(|c| format!("`{}` {}", c.name, c.sql_type))
            .collect::<Vec<_>>()
            .join(", ");
        self.ctx
            .hive
            .query(&format!(
                "CREATE EXTERNAL TABLE IF NOT EXISTS {table} ({columns_sql}) \
                 PARTITIONED BY ({partitions_sql}) STORED AS PARQUET LOCATION '{location}'"
            ))
            .await?;

        self.register_table(key, &table, Some(base)).await?;
        self.ctx
            .status
            .data_source(
                &key.namespace,
                &key.name,
                &ReportDataSourceStatus {
                    table_name: Some(table),
                },
            )
            .await
    }

    async fn sync_aws_billing(&self, key: &ObjectKey, source: &ReportDataSource) -> Result<()> {
        // The table data is owned externally; register where it lives and
        // let the partition worker pick up new billing periods.
        let table = format!("aws_billing_{}", sanitize_identifier(&key.name));
        self.register_table(key, &table, None).await?;
        self.ctx
            .status
            .data_source(
                &key.namespace,
                &key.name,
                &ReportDataSourceStatus {
                    table_name: Some(table),
                },
            )
            .await?;
        let _ = self.partition_tx.send(key.clone());
        Ok(())
    }

    async fn register_table(
        &self,
        key: &ObjectKey,
        table: &str,
        storage_location: Option<String>,
    ) -> Result<()> {
        let mut presto_table = PrestoTable::new(
            &key.name,
            PrestoTableSpec {
                table_name: table.to_string(),
                columns: promsum_columns(),
                partition_columns: partition_columns(),
                storage_location,
            },
        );
        presto_table.metadata.namespace = Some(key.namespace.clone());
        self.ctx
            .status
            .create_presto_table(&key.namespace, &presto_table)
            .await
    }
}

#[async_trait]
impl Reconciler for DataSourceReconciler {
    fn kind(&self) -> &'static str {
        "ReportDataSource"
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let Some(key) = ObjectKey::parse(key) else {
            return Ok(());
        };
        let Some(source) = self.ctx.stores.data_sources.get(&key.namespace, &key.name) else {
            debug!(%key, "data source deleted; backing table is preserved");
            return Ok(());
        };
        if source
            .status
            .as_ref()
            .and_then(|s| s.table_name.as_ref())
            .is_some()
        {
            return Ok(());
        }
        if source.spec.promsum.is_some() {
            self.sync_promsum(&key, &source).await
        } else if source.spec.aws_billing.is_some() {
            self.sync_aws_billing(&key, &source).await
        } else {
            warn!(%key, "data source declares neither promsum nor awsBilling");
            Ok(())
        }
    }
}
