//! Table, view and partition naming conventions
//!
//! Resource names are DNS-1123 labels; SQL identifiers are not. Every
//! derived identifier goes through [`sanitize_identifier`] so a resource
//! name maps to exactly one table or view name.

/// Base location for tables whose StorageLocation is unset.
pub const DEFAULT_STORAGE_BASE: &str = "hdfs://hdfs-namenode:9820/tally/storage";

/// Replace characters that are invalid in unquoted SQL identifiers.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Output table for a one-shot Report.
pub fn report_table_name(name: &str) -> String {
    format!("report_{}", sanitize_identifier(name))
}

/// Output table for a ScheduledReport.
pub fn scheduled_report_table_name(name: &str) -> String {
    format!("scheduled_report_{}", sanitize_identifier(name))
}

/// Backing table for a ReportDataSource.
pub fn data_source_table_name(name: &str) -> String {
    format!("datasource_{}", sanitize_identifier(name))
}

/// Presto view for a ReportGenerationQuery.
pub fn generation_query_view_name(name: &str) -> String {
    format!("view_{}", sanitize_identifier(name))
}

/// Storage location for a table under `base`.
pub fn table_location(base: &str, table: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), table)
}

/// Storage location for one billing-period partition of a table.
pub fn partition_location(table_location: &str, start: &str, end: &str) -> String {
    format!(
        "{}/billing_period_start={}/billing_period_end={}",
        table_location, start, end
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_dns_names() {
        assert_eq!(sanitize_identifier("pod-cpu-usage"), "pod_cpu_usage");
        assert_eq!(sanitize_identifier("a.b-c"), "a_b_c");
    }

    #[test]
    fn derived_names_are_prefixed() {
        assert_eq!(report_table_name("monthly-cpu"), "report_monthly_cpu");
        assert_eq!(data_source_table_name("pod-usage"), "datasource_pod_usage");
        assert_eq!(generation_query_view_name("raw"), "view_raw");
        assert_eq!(
            scheduled_report_table_name("hourly-cost"),
            "scheduled_report_hourly_cost"
        );
    }

    #[test]
    fn locations_compose() {
        let table = table_location(DEFAULT_STORAGE_BASE, "datasource_x");
        assert!(table.ends_with("/datasource_x"));
        let part = partition_location(&table, "20190101", "20190201");
        assert!(part.ends_with("billing_period_start=20190101/billing_period_end=20190201"));
    }
}
