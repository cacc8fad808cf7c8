//! Custom Resource Definitions for the Tally metering operator
//!
//! Seven namespaced kinds under `tally.io/v1alpha1`. Users own `spec`;
//! the operator owns `status` and the derived Hive/Presto tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A typed output or table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    /// SQL type as understood by Hive/Presto
    #[serde(rename = "type")]
    pub sql_type: String,
    /// Unit of measure for documentation (bytes, cores, seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Report Custom Resource
///
/// A one-shot materialization of a ReportGenerationQuery over the half-open
/// interval `[reportingStart, reportingEnd)`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "Report",
    plural = "reports",
    status = "ReportStatus",
    namespaced,
    printcolumn = r#"{"name":"Query","type":"string","jsonPath":".spec.generationQuery"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Table","type":"string","jsonPath":".status.tableName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReportSpec {
    /// Name of the ReportGenerationQuery to execute
    pub generation_query: String,

    /// Start of the reporting window (inclusive)
    pub reporting_start: DateTime<Utc>,

    /// End of the reporting window (exclusive)
    pub reporting_end: DateTime<Utc>,

    /// Values for the query's declared inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatus {
    pub phase: ReportPhase,

    /// Name of the output table once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    /// Error message when phase is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReportPhase {
    #[default]
    Pending,
    Started,
    Finished,
    Failed,
}

/// ScheduledReport Custom Resource
///
/// A recurring Report generator advanced through successive reporting
/// windows by the scheduled runner.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "ScheduledReport",
    plural = "scheduledreports",
    status = "ScheduledReportStatus",
    namespaced,
    printcolumn = r#"{"name":"Period","type":"string","jsonPath":".spec.schedule.period"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last Report","type":"date","jsonPath":".status.lastReportTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReportSpec {
    /// Name of the ReportGenerationQuery to execute each window
    pub generation_query: String,

    pub schedule: Schedule,

    /// Earliest window start; windows before this are never produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_start: Option<DateTime<Utc>>,

    /// Stop producing reports without deleting the resource
    #[serde(default)]
    pub suspend: bool,

    /// Values for the query's declared inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub period: SchedulePeriod,

    /// Offset from the period boundary at which windows close, in seconds.
    /// A daily schedule with phase 3600 produces windows ending at 01:00.
    #[serde(default)]
    pub phase_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SchedulePeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReportStatus {
    pub phase: ScheduledReportPhase,

    /// End of the last successfully materialized window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report_time: Option<DateTime<Utc>>,

    /// Name of the output table once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    /// Error message when phase is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ScheduledReportPhase {
    Disabled,
    #[default]
    Active,
    Failed,
}

/// ReportGenerationQuery Custom Resource
///
/// A SQL template with a typed output column list, declared inputs, and
/// dependency edges on other queries and data sources.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "ReportGenerationQuery",
    plural = "reportgenerationqueries",
    status = "ReportGenerationQueryStatus",
    namespaced,
    printcolumn = r#"{"name":"View","type":"string","jsonPath":".status.viewName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerationQuerySpec {
    /// The SQL template body
    pub query: String,

    /// Output columns produced by the query
    #[serde(default)]
    pub columns: Vec<Column>,

    /// Declared inputs with optional defaults
    #[serde(default)]
    pub inputs: Vec<QueryInput>,

    /// Queries read through their materialized views
    #[serde(default)]
    pub report_queries: Vec<String>,

    /// Queries inlined at render time instead of read as views
    #[serde(default)]
    pub dynamic_report_queries: Vec<String>,

    /// Data sources whose backing tables the template reads
    #[serde(default)]
    pub report_data_sources: Vec<String>,

    #[serde(default)]
    pub view: ViewSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryInput {
    pub name: String,
    /// Value used when a Report does not provide this input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewSettings {
    /// Suppress view materialization for this query
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerationQueryStatus {
    /// Presto view identifier once materialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_name: Option<String>,
}

/// ReportPrometheusQuery Custom Resource
///
/// A named PromQL expression referenced by Promsum-backed data sources.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "ReportPrometheusQuery",
    plural = "reportprometheusqueries",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ReportPrometheusQuerySpec {
    /// The PromQL expression
    pub query: String,
}

/// ReportDataSource Custom Resource
///
/// Declares a source of rows: either a Prometheus metric collected by
/// Promsum, or an externally managed table such as an AWS billing prefix.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "ReportDataSource",
    plural = "reportdatasources",
    status = "ReportDataSourceStatus",
    namespaced,
    printcolumn = r#"{"name":"Table","type":"string","jsonPath":".status.tableName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReportDataSourceSpec {
    /// Prometheus-backed source ingested by the Promsum collector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promsum: Option<PromsumSource>,

    /// Externally managed AWS billing data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_billing: Option<AwsBillingSource>,

    /// StorageLocation for the backing table; the default location is used
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromsumSource {
    /// Name of the ReportPrometheusQuery to collect
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsBillingSource {
    pub bucket: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportDataSourceStatus {
    /// Name of the backing table once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
}

/// PrestoTable Custom Resource
///
/// Records a Hive-managed table addressable from Presto. The status schema
/// is the schema actually created in Hive; tables are never mutated
/// in-place.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "PrestoTable",
    plural = "prestotables",
    status = "PrestoTableStatus",
    namespaced,
    printcolumn = r#"{"name":"Table","type":"string","jsonPath":".spec.tableName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PrestoTableSpec {
    pub table_name: String,

    #[serde(default)]
    pub columns: Vec<Column>,

    #[serde(default)]
    pub partition_columns: Vec<Column>,

    /// StorageLocation holding the table files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrestoTableStatus {
    /// Schema as created in Hive
    #[serde(default)]
    pub columns: Vec<Column>,
}

/// StorageLocation Custom Resource
///
/// Points at a physical location where Hive stores table files.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1alpha1",
    kind = "StorageLocation",
    plural = "storagelocations",
    namespaced,
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocationSpec {
    /// Filesystem path or object-store URI
    pub location: String,

    /// Use this location for tables that do not name one
    #[serde(default)]
    pub default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_spec_round_trips_camel_case() {
        let json = serde_json::json!({
            "generationQuery": "namespace-cpu-usage",
            "reportingStart": "2019-01-01T00:00:00Z",
            "reportingEnd": "2019-01-02T00:00:00Z",
            "inputs": {"cluster": "prod"}
        });
        let spec: ReportSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.generation_query, "namespace-cpu-usage");
        assert_eq!(spec.inputs.get("cluster").unwrap(), "prod");
        let back = serde_json::to_value(&spec).unwrap();
        assert!(back.get("reportingStart").is_some());
    }

    #[test]
    fn data_source_discriminates_branches() {
        let json = serde_json::json!({
            "promsum": {"query": "pod-memory-usage"}
        });
        let spec: ReportDataSourceSpec = serde_json::from_value(json).unwrap();
        assert!(spec.promsum.is_some());
        assert!(spec.aws_billing.is_none());
    }

    #[test]
    fn schedule_period_uses_lowercase_names() {
        let schedule: Schedule =
            serde_json::from_value(serde_json::json!({"period": "hourly"})).unwrap();
        assert_eq!(schedule.period, SchedulePeriod::Hourly);
        assert_eq!(schedule.phase_seconds, 0);
    }

    #[test]
    fn report_phase_defaults_to_pending() {
        let status = ReportStatus::default();
        assert_eq!(status.phase, ReportPhase::Pending);
    }
}
