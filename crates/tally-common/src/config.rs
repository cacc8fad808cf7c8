//! Configuration for the Tally operator

use std::time::Duration;

/// Fixed backoff between connection attempts to Hive and Presto.
pub const CONN_BACKOFF: Duration = Duration::from_secs(15);

/// Ceiling on total connection-wait time before startup fails.
pub const MAX_CONN_WAIT_TIME: Duration = Duration::from_secs(3 * 60);

/// Full-resync period for resource watches.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Operator configuration, assembled from flags and environment in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the operator watches and reconciles
    pub namespace: String,

    /// HiveServer2 address, host:port
    pub hive_host: String,
    /// Presto coordinator base URL
    pub presto_host: String,
    /// Prometheus base URL
    pub prom_host: String,

    /// Skip starting the Promsum collector
    pub disable_promsum: bool,

    /// Echo rendered report bodies
    pub log_report: bool,
    /// Echo DML sent to Presto
    pub log_dml_queries: bool,
    /// Echo DDL sent to Hive
    pub log_ddl_queries: bool,

    /// Promsum collector tick period
    pub promsum_interval: Duration,
    /// Prometheus range-query step
    pub promsum_step_size: Duration,
    /// Max per-tick ingestion window
    pub promsum_chunk_size: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "tally".into(),
            hive_host: "hive:10000".into(),
            presto_host: "http://presto:8080".into(),
            prom_host: "http://prometheus:9090".into(),
            disable_promsum: false,
            log_report: false,
            log_dml_queries: false,
            log_ddl_queries: false,
            promsum_interval: Duration::from_secs(30),
            promsum_step_size: Duration::from_secs(60),
            promsum_chunk_size: Duration::from_secs(5 * 60),
        }
    }
}
