//! Logz.io integration: a thin Elasticsearch-search-API client with
//! overview and raw-log tools.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{
    tool_prefix, FactoryEntry, Integration, IntegrationContext, IntegrationError,
    IntegrationFactory, IntegrationHealth,
};
use crate::tools::{Tool, ToolRegistry, ToolResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LOGS_HARD_CAP: usize = 500;

fn default_url() -> String {
    "https://api.logz.io".to_string()
}

fn default_namespace_field() -> String {
    "kubernetes.namespace_name".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogzioConfig {
    #[serde(default = "default_url")]
    pub url: String,
    pub api_token: String,
    #[serde(default = "default_namespace_field")]
    pub namespace_field: String,
}

#[derive(Clone)]
struct LogzioClient {
    http: reqwest::Client,
    config: LogzioConfig,
}

impl LogzioClient {
    fn new(config: LogzioConfig) -> Result<Self, IntegrationError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| IntegrationError::StartFailed {
                name: "logzio".into(),
                reason: error.to_string(),
            })?;
        Ok(Self { http, config })
    }

    async fn search(&self, body: Value) -> Result<Value, String> {
        let url = format!("{}/v1/search", self.config.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("X-API-TOKEN", self.config.api_token.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{url} returned status {status}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    fn time_range(from_ns: i64, to_ns: i64) -> Value {
        json!({
            "range": {"@timestamp": {
                "gte": Utc.timestamp_nanos(from_ns).to_rfc3339(),
                "lte": Utc.timestamp_nanos(to_ns).to_rfc3339(),
            }}
        })
    }
}

pub struct LogzioIntegration {
    name: String,
    client: Arc<RwLock<LogzioClient>>,
    raw_config: Value,
}

#[async_trait]
impl Integration for LogzioIntegration {
    async fn start(&self) -> Result<(), IntegrationError> {
        // A zero-hit search validates credentials without moving data.
        let client = self.client.read().await;
        client
            .search(json!({"size": 0, "query": {"match_all": {}}}))
            .await
            .map(|_| ())
            .map_err(|reason| IntegrationError::StartFailed {
                name: self.name.clone(),
                reason,
            })
    }

    async fn stop(&self) {}

    async fn health(&self) -> IntegrationHealth {
        let client = self.client.read().await;
        match client
            .search(json!({"size": 0, "query": {"match_all": {}}}))
            .await
        {
            Ok(_) => IntegrationHealth::healthy(),
            Err(reason) => IntegrationHealth::degraded(reason),
        }
    }

    fn register_tools(&self, registry: &ToolRegistry) {
        let prefix = tool_prefix(self.config_type(), &self.name);
        registry.register(Arc::new(LogzioOverviewTool {
            client: Arc::clone(&self.client),
            name: format!("{prefix}overview"),
        }));
        registry.register(Arc::new(LogzioLogsTool {
            client: Arc::clone(&self.client),
            name: format!("{prefix}logs"),
        }));
    }

    fn config_type(&self) -> &'static str {
        "logzio"
    }

    async fn rotate_secrets(&self, context: &IntegrationContext) -> Result<(), IntegrationError> {
        let resolved = super::secrets::resolve(
            context.kube.as_ref(),
            &context.secrets_namespace,
            &self.raw_config,
        )
        .await
        .map_err(|error| IntegrationError::SecretResolution {
            name: self.name.clone(),
            reason: error.to_string(),
        })?;
        let config: LogzioConfig =
            serde_json::from_value(resolved).map_err(|error| IntegrationError::InvalidConfig {
                name: self.name.clone(),
                reason: error.to_string(),
            })?;
        *self.client.write().await = LogzioClient::new(config)?;
        Ok(())
    }
}

fn parse_time(args: &Value, key: &str, default_ns: i64) -> i64 {
    args.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .and_then(|dt| dt.with_timezone(&Utc).timestamp_nanos_opt())
        .unwrap_or(default_ns)
}

struct LogzioOverviewTool {
    client: Arc<RwLock<LogzioClient>>,
    name: String,
}

#[async_trait]
impl Tool for LogzioOverviewTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Log counts per namespace from Logz.io, busiest first".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": {"type": "string"},
                "to": {"type": "string"}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let from = parse_time(&args, "from", now - 3600 * 1_000_000_000);
        let to = parse_time(&args, "to", now);

        let client = self.client.read().await;
        let field = client.config.namespace_field.clone();
        let body = json!({
            "size": 0,
            "query": {"bool": {"filter": [LogzioClient::time_range(from, to)]}},
            "aggs": {"namespaces": {"terms": {"field": field, "size": 50}}}
        });
        let response = match client.search(body).await {
            Ok(response) => response,
            Err(reason) => return ToolResult::error(format!("overview search failed: {reason}")),
        };

        let buckets = response
            .pointer("/aggregations/namespaces/buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let rows: Vec<Value> = buckets
            .iter()
            .map(|bucket| {
                json!({
                    "namespace": bucket.get("key"),
                    "total": bucket.get("doc_count"),
                })
            })
            .collect();

        ToolResult::json(&json!({"namespaces": rows}))
    }
}

struct LogzioLogsTool {
    client: Arc<RwLock<LogzioClient>>,
    name: String,
}

#[async_trait]
impl Tool for LogzioLogsTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("Raw log retrieval from Logz.io (capped at {LOGS_HARD_CAP} lines)")
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Lucene query string"},
                "namespace": {"type": "string"},
                "from": {"type": "string"},
                "to": {"type": "string"},
                "limit": {"type": "integer", "maximum": LOGS_HARD_CAP}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let from = parse_time(&args, "from", now - 3600 * 1_000_000_000);
        let to = parse_time(&args, "to", now);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(LOGS_HARD_CAP)
            .min(LOGS_HARD_CAP);

        let client = self.client.read().await;
        let mut filters = vec![LogzioClient::time_range(from, to)];
        if let Some(namespace) = args.get("namespace").and_then(Value::as_str) {
            if !namespace.is_empty() {
                let field = client.config.namespace_field.clone();
                filters.push(json!({"term": {(field): namespace}}));
            }
        }
        let mut must = json!({"match_all": {}});
        if let Some(query) = args.get("query").and_then(Value::as_str) {
            if !query.is_empty() {
                must = json!({"query_string": {"query": query}});
            }
        }

        let body = json!({
            "size": limit + 1,
            "sort": [{"@timestamp": "desc"}],
            "query": {"bool": {"must": [must], "filter": filters}}
        });
        let response = match client.search(body).await {
            Ok(response) => response,
            Err(reason) => return ToolResult::error(format!("log search failed: {reason}")),
        };

        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let truncated = hits.len() > limit;
        let logs: Vec<Value> = hits
            .iter()
            .take(limit)
            .map(|hit| {
                json!({
                    "time": hit.pointer("/_source/@timestamp"),
                    "message": hit.pointer("/_source/message"),
                })
            })
            .collect();

        let mut result = json!({"returned": logs.len(), "logs": logs});
        if truncated {
            result["warning"] = json!(format!("result truncated at {limit} lines"));
        }
        ToolResult::json(&result)
    }
}

pub struct LogzioFactory;

impl IntegrationFactory for LogzioFactory {
    fn type_name(&self) -> &'static str {
        "logzio"
    }

    fn build(
        &self,
        name: &str,
        config: &Value,
        context: IntegrationContext,
    ) -> Result<Arc<dyn Integration>, IntegrationError> {
        let _ = context;
        let parsed: LogzioConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                IntegrationError::InvalidConfig {
                    name: name.to_string(),
                    reason: error.to_string(),
                }
            })?;
        Ok(Arc::new(LogzioIntegration {
            name: name.to_string(),
            client: Arc::new(RwLock::new(LogzioClient::new(parsed)?)),
            raw_config: config.clone(),
        }))
    }
}

inventory::submit! {
    FactoryEntry {
        type_name: "logzio",
        build: || Box::new(LogzioFactory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_token() {
        assert!(serde_json::from_value::<LogzioConfig>(json!({})).is_err());
        let config: LogzioConfig =
            serde_json::from_value(json!({"api_token": "t"})).unwrap();
        assert_eq!(config.url, "https://api.logz.io");
        assert_eq!(config.namespace_field, "kubernetes.namespace_name");
    }
}
