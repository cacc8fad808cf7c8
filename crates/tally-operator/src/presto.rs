//! Presto query client
//!
//! Speaks the coordinator's REST protocol: `POST /v1/statement` starts a
//! query, then the client follows `nextUri` until the server stops handing
//! one out, accumulating any `data` pages along the way. Rows come back as
//! column-name → value maps. The driver pools HTTP connections internally,
//! so there is no reconnect logic here; startup mirrors the Hive client's
//! backoff and ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info};

use tally_common::config::{CONN_BACKOFF, MAX_CONN_WAIT_TIME};
use tally_common::{Clock, Error, Result};

/// Interval between write-readiness probes.
const WRITE_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Scratch table used by the write-readiness probe.
const WRITE_PROBE_TABLE: &str = "tally_write_probe";

pub type Row = HashMap<String, serde_json::Value>;

/// The query surface the reconcilers and collectors depend on.
#[async_trait]
pub trait PrestoQueryer: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute a statement, discarding any rows.
    async fn execute(&self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    next_uri: Option<String>,
    #[serde(default)]
    columns: Option<Vec<StatementColumn>>,
    #[serde(default)]
    data: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementError {
    message: String,
    #[serde(default)]
    error_name: Option<String>,
}

pub struct PrestoClient {
    http: reqwest::Client,
    base_url: String,
    log_queries: bool,
    clock: Arc<dyn Clock>,
    stop: watch::Receiver<bool>,
}

impl PrestoClient {
    pub fn new(
        base_url: impl Into<String>,
        log_queries: bool,
        clock: Arc<dyn Clock>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            log_queries,
            clock,
            stop,
        })
    }

    async fn run_statement(&self, sql: &str) -> Result<Vec<Row>> {
        let mut response: StatementResponse = self
            .http
            .post(format!("{}/v1/statement", self.base_url))
            .header("X-Presto-User", "tally")
            .header("X-Presto-Source", "tally-operator")
            .header("X-Presto-Catalog", "hive")
            .header("X-Presto-Schema", "default")
            .body(sql.to_string())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        loop {
            if let Some(err) = response.error {
                let name = err.error_name.unwrap_or_else(|| "QUERY_ERROR".into());
                return Err(Error::QueryFailed(format!("{}: {}", name, err.message)));
            }
            if let Some(cols) = response.columns.take() {
                columns = cols.into_iter().map(|c| c.name).collect();
            }
            if let Some(data) = response.data.take() {
                for values in data {
                    rows.push(columns.iter().cloned().zip(values).collect());
                }
            }
            match response.next_uri.take() {
                Some(uri) => {
                    response = self
                        .http
                        .get(uri)
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await?;
                }
                None => break,
            }
        }
        Ok(rows)
    }

    /// Block until the coordinator answers a trivial query, backing off
    /// 15 s at a time up to the startup ceiling.
    pub async fn wait_until_available(&self) -> Result<()> {
        let start = self.clock.now();
        let mut stop = self.stop.clone();
        debug!("getting presto connection");
        loop {
            if *stop.borrow() {
                return Err(Error::Shutdown);
            }
            match self.run_statement("SELECT 1").await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let waited = self
                        .clock
                        .now()
                        .signed_duration_since(start)
                        .to_std()
                        .unwrap_or_default();
                    if waited > MAX_CONN_WAIT_TIME {
                        debug!("attempts timed out, failed to get presto connection");
                        return Err(err);
                    }
                    debug!(error = %err, "error connecting to presto, backing off");
                    tokio::select! {
                        _ = self.clock.sleep(CONN_BACKOFF) => {}
                        _ = stop.changed() => return Err(Error::Shutdown),
                    }
                }
            }
        }
    }

    /// Poll a create/drop round trip until Presto can actually write
    /// through the hive catalog. Hive may accept catalog registration
    /// before tables are queryable from Presto.
    pub async fn wait_until_writable(&self) -> Result<()> {
        let mut stop = self.stop.clone();
        loop {
            if *stop.borrow() {
                return Err(Error::Shutdown);
            }
            match self.probe_write().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(error = %err, "presto write probe failed, retrying");
                }
            }
            tokio::select! {
                _ = self.clock.sleep(WRITE_PROBE_INTERVAL) => {}
                _ = stop.changed() => return Err(Error::Shutdown),
            }
        }
    }

    async fn probe_write(&self) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {WRITE_PROBE_TABLE}"))
            .await?;
        self.execute(&format!(
            "CREATE TABLE {WRITE_PROBE_TABLE} (probe smallint)"
        ))
        .await?;
        self.execute(&format!("DROP TABLE IF EXISTS {WRITE_PROBE_TABLE}"))
            .await
    }
}

#[async_trait]
impl PrestoQueryer for PrestoClient {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        if self.log_queries {
            info!(query = sql, "executing presto query");
        }
        self.run_statement(sql).await
    }
}

/// Quote a string literal for Presto SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Format a timestamp as a Presto `timestamp` literal.
pub fn timestamp_literal(t: chrono::DateTime<chrono::Utc>) -> String {
    format!("timestamp '{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn literals_are_escaped() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn timestamp_literal_has_millis() {
        let t = chrono::Utc.with_ymd_and_hms(2019, 1, 1, 13, 30, 5).unwrap();
        assert_eq!(
            timestamp_literal(t),
            "timestamp '2019-01-01 13:30:05.000'"
        );
    }

    #[test]
    fn statement_response_decodes_error_and_data() {
        let body = serde_json::json!({
            "id": "20190101_000000_00001_abcde",
            "columns": [{"name": "amount", "type": "double"}],
            "data": [[1.5], [2.5]],
            "nextUri": null
        });
        let response: StatementResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.columns.as_ref().unwrap().len(), 1);
        assert_eq!(response.data.as_ref().unwrap().len(), 2);
        assert!(response.error.is_none());

        let body = serde_json::json!({
            "id": "x",
            "error": {"message": "line 1:1: mismatched input", "errorName": "SYNTAX_ERROR"}
        });
        let response: StatementResponse = serde_json::from_value(body).unwrap();
        assert_eq!(
            response.error.unwrap().error_name.as_deref(),
            Some("SYNTAX_ERROR")
        );
    }
}
