//! Tally Operator
//!
//! Metering operator: collects Prometheus metrics into Hive tables and
//! materializes cost/usage reports through Presto, driven by declarative
//! reporting resources.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tally_common::{Config, SystemClock};
use tally_operator::operator::Operator;

#[derive(Parser, Debug)]
#[command(name = "tally-operator")]
#[command(about = "Tally metering and chargeback operator")]
struct Args {
    /// Kubernetes namespace to watch
    #[arg(long, env = "NAMESPACE", default_value = "tally")]
    namespace: String,

    /// HiveServer2 address (host:port)
    #[arg(long, env = "HIVE_HOST", default_value = "hive:10000")]
    hive_host: String,

    /// Presto coordinator base URL
    #[arg(long, env = "PRESTO_HOST", default_value = "http://presto:8080")]
    presto_host: String,

    /// Prometheus base URL
    #[arg(long, env = "PROM_HOST", default_value = "http://prometheus:9090")]
    prom_host: String,

    /// Do not start the Promsum collector
    #[arg(long, env = "DISABLE_PROMSUM")]
    disable_promsum: bool,

    /// Echo rendered report bodies
    #[arg(long, env = "LOG_REPORT")]
    log_report: bool,

    /// Echo DML sent to Presto
    #[arg(long, env = "LOG_DML_QUERIES")]
    log_dml_queries: bool,

    /// Echo DDL sent to Hive
    #[arg(long, env = "LOG_DDL_QUERIES")]
    log_ddl_queries: bool,

    /// Promsum collector tick period in seconds
    #[arg(long, env = "PROMSUM_INTERVAL_SECS", default_value = "30")]
    promsum_interval_secs: u64,

    /// Prometheus range-query step in seconds
    #[arg(long, env = "PROMSUM_STEP_SIZE_SECS", default_value = "60")]
    promsum_step_size_secs: u64,

    /// Max per-tick ingestion window in seconds
    #[arg(long, env = "PROMSUM_CHUNK_SIZE_SECS", default_value = "300")]
    promsum_chunk_size_secs: u64,

    /// Address for the health endpoints
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            namespace: self.namespace.clone(),
            hive_host: self.hive_host.clone(),
            presto_host: self.presto_host.clone(),
            prom_host: self.prom_host.clone(),
            disable_promsum: self.disable_promsum,
            log_report: self.log_report,
            log_dml_queries: self.log_dml_queries,
            log_ddl_queries: self.log_ddl_queries,
            promsum_interval: Duration::from_secs(self.promsum_interval_secs),
            promsum_step_size: Duration::from_secs(self.promsum_step_size_secs),
            promsum_chunk_size: Duration::from_secs(self.promsum_chunk_size_secs),
        }
    }
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    info!("starting tally operator");
    info!("  namespace: {}", args.namespace);
    info!("  hive: {}", args.hive_host);
    info!("  presto: {}", args.presto_host);
    info!("  prometheus: {}", args.prom_host);

    let client = Client::try_default().await?;
    info!("connected to kubernetes cluster");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("received shutdown signal");
        let _ = stop_tx.send(true);
    });

    let operator = Operator::new(
        args.config(),
        client,
        Arc::new(SystemClock),
        args.listen_addr,
    );
    operator.run(stop_rx).await?;

    info!("tally operator shut down");
    Ok(())
}
