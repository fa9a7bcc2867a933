//! Prometheus instant queries backing the host dashboard.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: Value,
}

/// Outcome of one named query
#[derive(Debug, Clone, Serialize)]
pub struct MetricResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<Sample>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Run an instant query
    pub async fn query(&self, expr: &str) -> Result<Vec<Sample>, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        let resp: QueryResponse = self
            .client
            .get(&url)
            .query(&[("query", expr)])
            .timeout(self.timeout)
            .send()
            .await?
            .json()
            .await?;
        parse_response(resp)
    }

    /// Run every named query; failures are reported per entry
    pub async fn query_all(&self, queries: &BTreeMap<String, String>) -> BTreeMap<String, MetricResult> {
        let mut out = BTreeMap::new();
        for (name, expr) in queries {
            let result = match self.query(expr).await {
                Ok(samples) => MetricResult {
                    samples: Some(samples),
                    error: None,
                },
                Err(e) => {
                    warn!(query = %name, error = %e, "prometheus query failed");
                    MetricResult {
                        samples: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            out.insert(name.clone(), result);
        }
        out
    }
}

fn parse_response(resp: QueryResponse) -> Result<Vec<Sample>, Box<dyn std::error::Error + Send + Sync>> {
    if resp.status != "success" {
        return Err(resp.error.unwrap_or_else(|| "query failed".to_string()).into());
    }
    let data = resp.data.ok_or("missing data")?;

    match data.result_type.as_str() {
        "vector" => {
            let items = data.result.as_array().ok_or("vector result is not an array")?;
            items.iter().map(parse_vector_item).collect()
        }
        "scalar" => Ok(vec![Sample {
            labels: BTreeMap::new(),
            value: parse_value_pair(&data.result)?,
        }]),
        other => Err(format!("unsupported result type: {}", other).into()),
    }
}

fn parse_vector_item(item: &Value) -> Result<Sample, Box<dyn std::error::Error + Send + Sync>> {
    let labels = item
        .get("metric")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let value = parse_value_pair(item.get("value").ok_or("sample missing value")?)?;
    Ok(Sample { labels, value })
}

/// `[<unix time>, "<value>"]`
fn parse_value_pair(v: &Value) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
    let raw = v
        .get(1)
        .and_then(Value::as_str)
        .ok_or("malformed sample value")?;
    Ok(raw.parse::<f64>()?)
}
