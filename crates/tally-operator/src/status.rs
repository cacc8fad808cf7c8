//! Status subresource writes
//!
//! All operator-side mutations of the declarative resources go through
//! [`StatusWriter`]: merge patches of each kind's status, plus creation of
//! the one operator-owned kind (PrestoTable). Keeping this behind a trait
//! lets the reconcilers run against an in-memory recorder in tests.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use tally_common::Result;

use crate::crd::{
    PrestoTable, Report, ReportDataSource, ReportDataSourceStatus, ReportGenerationQuery,
    ReportGenerationQueryStatus, ReportStatus, ScheduledReport, ScheduledReportStatus,
};

#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn report(&self, namespace: &str, name: &str, status: &ReportStatus) -> Result<()>;

    async fn scheduled_report(
        &self,
        namespace: &str,
        name: &str,
        status: &ScheduledReportStatus,
    ) -> Result<()>;

    async fn data_source(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportDataSourceStatus,
    ) -> Result<()>;

    async fn generation_query(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportGenerationQueryStatus,
    ) -> Result<()>;

    async fn create_presto_table(&self, namespace: &str, table: &PrestoTable) -> Result<()>;
}

/// Production writer backed by the Kubernetes API.
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams::apply("tally-operator")
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn report(&self, namespace: &str, name: &str, status: &ReportStatus) -> Result<()> {
        let api: Api<Report> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Patch::Merge(&json!({"status": status})))
            .await?;
        Ok(())
    }

    async fn scheduled_report(
        &self,
        namespace: &str,
        name: &str,
        status: &ScheduledReportStatus,
    ) -> Result<()> {
        let api: Api<ScheduledReport> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Patch::Merge(&json!({"status": status})))
            .await?;
        Ok(())
    }

    async fn data_source(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportDataSourceStatus,
    ) -> Result<()> {
        let api: Api<ReportDataSource> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Patch::Merge(&json!({"status": status})))
            .await?;
        Ok(())
    }

    async fn generation_query(
        &self,
        namespace: &str,
        name: &str,
        status: &ReportGenerationQueryStatus,
    ) -> Result<()> {
        let api: Api<ReportGenerationQuery> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Patch::Merge(&json!({"status": status})))
            .await?;
        Ok(())
    }

    async fn create_presto_table(&self, namespace: &str, table: &PrestoTable) -> Result<()> {
        let api: Api<PrestoTable> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), table).await {
            Ok(_) => Ok(()),
            // Already registered by an earlier sync of the same resource.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
