//! VictoriaLogs integration: LogsQL queries, sampled template mining, and
//! the progressive log tools (overview, patterns, logs).

pub mod client;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{
    tool_prefix, FactoryEntry, Integration, IntegrationContext, IntegrationError,
    IntegrationFactory, IntegrationHealth,
};
use crate::analysis::drain::{DrainConfig, DrainTree};
use crate::analysis::novelty;
use crate::tools::{Tool, ToolRegistry, ToolResult};

/// Hard cap on raw log retrieval, enforced by the logs tool regardless of
/// what the caller asks for.
pub const LOGS_HARD_CAP: usize = 500;

fn default_namespace_field() -> String {
    "namespace".to_string()
}

fn default_max_lines() -> usize {
    2000
}

fn default_concurrency() -> usize {
    4
}

#[derive(Clone, Debug, Deserialize)]
pub struct VictoriaLogsConfig {
    pub url: String,
    #[serde(default)]
    pub tenant: Option<String>,
    /// Stream field carrying the Kubernetes namespace.
    #[serde(default = "default_namespace_field")]
    pub namespace_field: String,
    /// Per-namespace line budget for mining; busier namespaces are
    /// reservoir-sampled down to this.
    #[serde(default = "default_max_lines")]
    pub max_lines_per_namespace: usize,
    #[serde(default = "default_concurrency")]
    pub fetch_concurrency: usize,
}

const ERROR_FILTER: &str = "error OR failed OR failure OR fatal";
const WARNING_FILTER: &str = "warn OR warning";

pub struct VictoriaLogsIntegration {
    name: String,
    config: VictoriaLogsConfig,
    /// Shared with the instance's tools so credential rotation reaches
    /// queries already in flight.
    client: Arc<RwLock<client::LogsQlClient>>,
    context: IntegrationContext,
    /// Original (unresolved) config, kept for secret rotation.
    raw_config: Value,
}

impl VictoriaLogsIntegration {
    fn build(
        name: &str,
        raw_config: &Value,
        context: IntegrationContext,
    ) -> Result<Arc<Self>, IntegrationError> {
        let config: VictoriaLogsConfig =
            serde_json::from_value(raw_config.clone()).map_err(|error| {
                IntegrationError::InvalidConfig {
                    name: name.to_string(),
                    reason: error.to_string(),
                }
            })?;
        let client = client::LogsQlClient::new(config.url.clone(), config.tenant.clone())
            .map_err(|error| IntegrationError::StartFailed {
                name: name.to_string(),
                reason: error.to_string(),
            })?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            client: Arc::new(RwLock::new(client)),
            context,
            raw_config: raw_config.clone(),
        }))
    }
}

#[async_trait]
impl Integration for VictoriaLogsIntegration {
    async fn start(&self) -> Result<(), IntegrationError> {
        let client = self.client.read().await;
        client
            .healthy()
            .await
            .map_err(|error| IntegrationError::StartFailed {
                name: self.name.clone(),
                reason: error.to_string(),
            })
    }

    async fn stop(&self) {}

    async fn health(&self) -> IntegrationHealth {
        let client = self.client.read().await;
        match client.healthy().await {
            Ok(()) => IntegrationHealth::healthy(),
            Err(error) => IntegrationHealth::degraded(error.to_string()),
        }
    }

    fn register_tools(&self, registry: &ToolRegistry) {
        let prefix = tool_prefix(self.config_type(), &self.name);
        registry.register(Arc::new(OverviewTool {
            shared: self.shared(),
            name: format!("{prefix}overview"),
        }));
        registry.register(Arc::new(PatternsTool {
            shared: self.shared(),
            name: format!("{prefix}patterns"),
        }));
        registry.register(Arc::new(LogsTool {
            shared: self.shared(),
            name: format!("{prefix}logs"),
        }));
    }

    fn config_type(&self) -> &'static str {
        "victorialogs"
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
        let config: VictoriaLogsConfig =
            serde_json::from_value(resolved).map_err(|error| IntegrationError::InvalidConfig {
                name: self.name.clone(),
                reason: error.to_string(),
            })?;
        let client = client::LogsQlClient::new(config.url.clone(), config.tenant.clone())
            .map_err(|error| IntegrationError::StartFailed {
                name: self.name.clone(),
                reason: error.to_string(),
            })?;
        *self.client.write().await = client;
        Ok(())
    }
}

/// State shared by the three tools of one instance.
#[derive(Clone)]
struct Shared {
    config: VictoriaLogsConfig,
    client: Arc<RwLock<client::LogsQlClient>>,
    context: IntegrationContext,
}

impl VictoriaLogsIntegration {
    fn shared(&self) -> Shared {
        Shared {
            config: self.config.clone(),
            client: Arc::clone(&self.client),
            context: self.context.clone(),
        }
    }
}

fn parse_time(args: &Value, key: &str, default_ns: i64) -> i64 {
    args.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .and_then(|dt| dt.with_timezone(&Utc).timestamp_nanos_opt())
        .unwrap_or(default_ns)
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Uniform reservoir sample of size `k`.
pub fn reservoir_sample<T>(items: Vec<T>, k: usize) -> Vec<T> {
    if items.len() <= k {
        return items;
    }
    let mut rng = rand::thread_rng();
    let mut reservoir: Vec<T> = Vec::with_capacity(k);
    for (i, item) in items.into_iter().enumerate() {
        if i < k {
            reservoir.push(item);
        } else {
            let j = rng.gen_range(0..=i);
            if j < k {
                reservoir[j] = item;
            }
        }
    }
    reservoir
}

// --- overview ---

struct OverviewTool {
    shared: Shared,
    name: String,
}

#[async_trait]
impl Tool for OverviewTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Log volume per namespace: total, error, and warning counts, busiest first".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": {"type": "string", "description": "RFC 3339 start, default one hour ago"},
                "to": {"type": "string", "description": "RFC 3339 end, default now"}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = now_ns();
        let from = parse_time(&args, "from", now - 3600 * 1_000_000_000);
        let to = parse_time(&args, "to", now);
        let field = &self.shared.config.namespace_field;

        let client = self.shared.client.read().await;
        let totals = client.count_by_field("*", field, from, to).await;
        let errors = client.count_by_field(ERROR_FILTER, field, from, to).await;
        let warnings = client.count_by_field(WARNING_FILTER, field, from, to).await;
        drop(client);

        let totals = match totals {
            Ok(totals) => totals,
            Err(error) => return ToolResult::error(format!("overview query failed: {error}")),
        };
        let errors = errors.unwrap_or_default();
        let warnings = warnings.unwrap_or_default();

        let mut rows: Vec<Value> = totals
            .iter()
            .map(|(namespace, total)| {
                json!({
                    "namespace": namespace,
                    "total": total,
                    "errors": errors.get(namespace).copied().unwrap_or(0),
                    "warnings": warnings.get(namespace).copied().unwrap_or(0),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b["total"]
                .as_u64()
                .unwrap_or(0)
                .cmp(&a["total"].as_u64().unwrap_or(0))
        });

        ToolResult::json(&json!({"namespaces": rows}))
    }
}

// --- patterns ---

struct PatternsTool {
    shared: Shared,
    name: String,
}

impl PatternsTool {
    /// Fetches (sampled) lines per namespace with bounded concurrency.
    async fn fetch_window(
        &self,
        namespaces: &[String],
        from: i64,
        to: i64,
    ) -> BTreeMap<String, Vec<String>> {
        let field = self.shared.config.namespace_field.clone();
        let max_lines = self.shared.config.max_lines_per_namespace;
        let concurrency = self.shared.config.fetch_concurrency.max(1);

        let fetches = futures::stream::iter(namespaces.iter().cloned().map(|namespace| {
            let client = Arc::clone(&self.shared.client);
            let field = field.clone();
            async move {
                let query = format!("{field}:{namespace}");
                let client = client.read().await;
                // Over-fetch slightly so sampling has something to cut.
                let result = client.query(&query, from, to, max_lines * 2).await;
                (namespace, result)
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut lines_by_namespace = BTreeMap::new();
        for (namespace, result) in fetches {
            match result {
                Ok(entries) => {
                    let lines: Vec<String> =
                        entries.into_iter().map(|entry| entry.message).collect();
                    let sampled = reservoir_sample(lines, max_lines);
                    lines_by_namespace.insert(namespace, sampled);
                }
                Err(error) => {
                    warn!(message = "pattern fetch failed for namespace", %namespace, %error);
                }
            }
        }
        lines_by_namespace
    }
}

#[async_trait]
impl Tool for PatternsTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Mine log templates for a window, compare against the previous window, and flag novel patterns".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "namespace": {"type": "string", "description": "Limit mining to one namespace"},
                "from": {"type": "string", "description": "RFC 3339 start, default one hour ago"},
                "to": {"type": "string", "description": "RFC 3339 end, default now"}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = now_ns();
        let from = parse_time(&args, "from", now - 3600 * 1_000_000_000);
        let to = parse_time(&args, "to", now);
        if to <= from {
            return ToolResult::error("empty time range");
        }
        let window = to - from;

        let namespaces: Vec<String> = match args.get("namespace").and_then(Value::as_str) {
            Some(ns) if !ns.is_empty() => vec![ns.to_string()],
            _ => {
                let client = self.shared.client.read().await;
                match client
                    .count_by_field("*", &self.shared.config.namespace_field, from, to)
                    .await
                {
                    Ok(counts) => counts.into_keys().filter(|k| !k.is_empty()).collect(),
                    Err(error) => {
                        return ToolResult::error(format!("namespace discovery failed: {error}"))
                    }
                }
            }
        };

        let current_lines = self.fetch_window(&namespaces, from, to).await;
        let previous_lines = self.fetch_window(&namespaces, from - window, from).await;

        let mut results = Vec::new();
        for namespace in &namespaces {
            let mut current_tree = DrainTree::new(DrainConfig::default());
            for line in current_lines.get(namespace).into_iter().flatten() {
                current_tree.process(line, to);
                // Persistent store accumulates alongside the window mine.
                self.shared
                    .context
                    .templates
                    .process(namespace, line, to)
                    .await;
            }
            let mut previous_tree = DrainTree::new(DrainConfig::default());
            for line in previous_lines.get(namespace).into_iter().flatten() {
                previous_tree.process(line, from);
            }

            let entries =
                novelty::compare_windows(&current_tree.templates(), &previous_tree.templates());
            if !entries.is_empty() {
                results.push(json!({
                    "namespace": namespace,
                    "patterns": entries,
                }));
            }
        }

        ToolResult::json(&json!({
            "window_seconds": window / 1_000_000_000,
            "namespaces": results,
        }))
    }
}

// --- logs ---

struct LogsTool {
    shared: Shared,
    name: String,
}

#[async_trait]
impl Tool for LogsTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("Raw log retrieval (capped at {LOGS_HARD_CAP} lines)")
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "LogsQL filter, default *"},
                "namespace": {"type": "string"},
                "from": {"type": "string", "description": "RFC 3339 start, default one hour ago"},
                "to": {"type": "string", "description": "RFC 3339 end, default now"},
                "limit": {"type": "integer", "maximum": LOGS_HARD_CAP}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = now_ns();
        let from = parse_time(&args, "from", now - 3600 * 1_000_000_000);
        let to = parse_time(&args, "to", now);

        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(LOGS_HARD_CAP)
            .min(LOGS_HARD_CAP);

        let mut query = args
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.is_empty())
            .unwrap_or("*")
            .to_string();
        if let Some(namespace) = args.get("namespace").and_then(Value::as_str) {
            if !namespace.is_empty() {
                query = format!(
                    "{}:{} AND ({})",
                    self.shared.config.namespace_field, namespace, query
                );
            }
        }

        let client = self.shared.client.read().await;
        // One extra line tells us whether the result was truncated.
        let entries = match client.query(&query, from, to, limit + 1).await {
            Ok(entries) => entries,
            Err(error) => return ToolResult::error(format!("log query failed: {error}")),
        };
        drop(client);

        let truncated = entries.len() > limit;
        let lines: Vec<Value> = entries
            .iter()
            .take(limit)
            .map(|entry| {
                json!({
                    "time": entry.time,
                    "message": entry.message,
                    "namespace": entry.field(&self.shared.config.namespace_field),
                })
            })
            .collect();

        let mut result = json!({
            "query": query,
            "returned": lines.len(),
            "logs": lines,
        });
        if truncated {
            result["warning"] =
                json!(format!("result truncated at {limit} lines; narrow the query or range"));
        }
        ToolResult::json(&result)
    }
}

// --- factory ---

pub struct VictoriaLogsFactory;

impl IntegrationFactory for VictoriaLogsFactory {
    fn type_name(&self) -> &'static str {
        "victorialogs"
    }

    fn build(
        &self,
        name: &str,
        config: &Value,
        context: IntegrationContext,
    ) -> Result<Arc<dyn Integration>, IntegrationError> {
        Ok(VictoriaLogsIntegration::build(name, config, context)?)
    }
}

inventory::submit! {
    FactoryEntry {
        type_name: "victorialogs",
        build: || Box::new(VictoriaLogsFactory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_sample_caps_size() {
        let items: Vec<u32> = (0..1000).collect();
        let sampled = reservoir_sample(items, 100);
        assert_eq!(sampled.len(), 100);
        // All sampled values come from the input.
        assert!(sampled.iter().all(|v| *v < 1000));
    }

    #[test]
    fn small_input_is_untouched() {
        let items = vec![1, 2, 3];
        assert_eq!(reservoir_sample(items.clone(), 10), items);
    }

    #[test]
    fn config_defaults() {
        let config: VictoriaLogsConfig =
            serde_json::from_value(json!({"url": "http://vl:9428"})).unwrap();
        assert_eq!(config.namespace_field, "namespace");
        assert_eq!(config.max_lines_per_namespace, 2000);
        assert_eq!(config.fetch_concurrency, 4);
    }
}
