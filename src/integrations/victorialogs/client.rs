//! Minimal LogsQL client.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("request to {} failed: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("{} returned status {}", url, status))]
    Status { url: String, status: u16 },

    #[snafu(display("malformed response line: {}", source))]
    Malformed { source: serde_json::Error },
}

/// One log line as returned by the query endpoint. VictoriaLogs streams
/// NDJSON objects with `_time` and `_msg` plus arbitrary stream fields.
#[derive(Clone, Debug, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "_time", default)]
    pub time: String,
    #[serde(rename = "_msg", default)]
    pub message: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

#[derive(Clone)]
pub struct LogsQlClient {
    http: reqwest::Client,
    base_url: String,
    tenant: Option<String>,
}

fn rfc3339(ns: i64) -> String {
    Utc.timestamp_nanos(ns).to_rfc3339()
}

impl LogsQlClient {
    pub fn new(base_url: String, tenant: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Request {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(tenant) = &self.tenant {
            builder = builder.header("AccountID", tenant.clone());
        }
        builder
    }

    async fn query_ndjson(&self, form: &[(&str, String)], path: &str) -> Result<String, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(path)
            .form(form)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        response.text().await.context(RequestSnafu { url })
    }

    /// Executes a LogsQL query over a time range, returning at most `limit`
    /// lines.
    pub async fn query(
        &self,
        query: &str,
        start_ns: i64,
        end_ns: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ClientError> {
        let body = self
            .query_ndjson(
                &[
                    ("query", query.to_string()),
                    ("start", rfc3339(start_ns)),
                    ("end", rfc3339(end_ns)),
                    ("limit", limit.to_string()),
                ],
                "/select/logsql/query",
            )
            .await?;

        let mut entries = Vec::new();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line).context(MalformedSnafu)?);
        }
        Ok(entries)
    }

    /// `filter | stats by (field) count()` aggregation.
    pub async fn count_by_field(
        &self,
        filter: &str,
        field: &str,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<BTreeMap<String, u64>, ClientError> {
        let query = format!("{filter} | stats by ({field}) count() hits");
        let body = self
            .query_ndjson(
                &[
                    ("query", query),
                    ("start", rfc3339(start_ns)),
                    ("end", rfc3339(end_ns)),
                ],
                "/select/logsql/query",
            )
            .await?;

        let mut counts = BTreeMap::new();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(line).context(MalformedSnafu)?;
            let key = row
                .get(field)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let hits = row
                .get("hits")
                .map(|v| match v {
                    serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
                    serde_json::Value::String(s) => s.parse().unwrap_or(0),
                    _ => 0,
                })
                .unwrap_or(0);
            counts.insert(key, hits);
        }
        Ok(counts)
    }

    /// Log volume histogram via the hits endpoint.
    pub async fn histogram(
        &self,
        filter: &str,
        start_ns: i64,
        end_ns: i64,
        step: &str,
    ) -> Result<Vec<(String, u64)>, ClientError> {
        #[derive(Deserialize)]
        struct HitsResponse {
            #[serde(default)]
            hits: Vec<HitsSeries>,
        }
        #[derive(Deserialize)]
        struct HitsSeries {
            #[serde(default)]
            timestamps: Vec<String>,
            #[serde(default)]
            values: Vec<u64>,
        }

        let url = format!("{}/select/logsql/hits", self.base_url);
        let response = self
            .request("/select/logsql/hits")
            .form(&[
                ("query", filter.to_string()),
                ("start", rfc3339(start_ns)),
                ("end", rfc3339(end_ns)),
                ("step", step.to_string()),
            ])
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let parsed: HitsResponse = response.json().await.context(RequestSnafu { url })?;

        let mut buckets = Vec::new();
        for series in parsed.hits {
            for (ts, value) in series.timestamps.into_iter().zip(series.values) {
                buckets.push((ts, value));
            }
        }
        Ok(buckets)
    }

    /// Cheap liveness probe.
    pub async fn healthy(&self) -> Result<(), ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}
