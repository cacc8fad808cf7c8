//! Prometheus range-query client

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use tally_common::{Error, Result};

/// Default request timeout for range queries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One sample of a matrix result.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One series of a matrix result with its label set.
#[derive(Debug, Clone)]
pub struct Series {
    pub labels: HashMap<String, String>,
    pub samples: Vec<Sample>,
}

/// Range-query surface the Promsum collector depends on.
#[async_trait]
pub trait PromQuerier: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<Series>>;
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<RangeData>,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    result: Vec<RangeResult>,
}

#[derive(Debug, Deserialize)]
struct RangeResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PromQuerier for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<Series>> {
        let url = format!(
            "{}/api/v1/query_range?query={}&start={}&end={}&step={}",
            self.base_url,
            urlencoding::encode(query),
            start.to_rfc3339(),
            end.to_rfc3339(),
            step.as_secs(),
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Prometheus(format!(
                "status {} from query_range",
                response.status()
            )));
        }
        let body: RangeResponse = response.json().await?;
        if body.status != "success" {
            return Err(Error::Prometheus(
                body.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        let data = body
            .data
            .ok_or_else(|| Error::Prometheus("response carried no data".into()))?;
        data.result.into_iter().map(decode_series).collect()
    }
}

fn decode_series(result: RangeResult) -> Result<Series> {
    let samples = result
        .values
        .into_iter()
        .map(|(epoch, value)| {
            let secs = epoch.trunc() as i64;
            let nanos = (epoch.fract() * 1e9) as u32;
            let timestamp = DateTime::from_timestamp(secs, nanos)
                .ok_or_else(|| Error::Prometheus(format!("bad sample timestamp {epoch}")))?;
            let value = value
                .parse::<f64>()
                .map_err(|err| Error::Prometheus(format!("bad sample value: {err}")))?;
            Ok(Sample { timestamp, value })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Series {
        labels: result.metric,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_matrix_results() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"pod": "api-0", "namespace": "prod"},
                    "values": [[1546300800.0, "0.25"], [1546300860.0, "0.5"]]
                }]
            }
        });
        let response: RangeResponse = serde_json::from_value(body).unwrap();
        let series = decode_series(response.data.unwrap().result.remove(0)).unwrap();
        assert_eq!(series.labels["pod"], "api-0");
        assert_eq!(series.samples.len(), 2);
        assert_eq!(series.samples[1].value, 0.5);
        assert_eq!(
            series.samples[0].timestamp,
            DateTime::from_timestamp(1546300800, 0).unwrap()
        );
    }

    #[test]
    fn error_status_is_surfaced() {
        let body = serde_json::json!({
            "status": "error",
            "error": "query timed out"
        });
        let response: RangeResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.status, "error");
        assert_eq!(response.error.as_deref(), Some("query timed out"));
    }

    #[test]
    fn bad_value_fails_decoding() {
        let result = RangeResult {
            metric: HashMap::new(),
            values: vec![(1546300800.0, "NaN-ish".into())],
        };
        assert!(decode_series(result).is_err());
    }
}
