//! Grafana integration: dashboard sync, alert rule and state sync, metric
//! baselines, anomaly surfacing, and the metrics/alerts tools.

pub mod alerts;
pub mod client;
pub mod history;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::Query;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use self::alerts::AlertSyncer;
use self::client::{AlertState, GrafanaClient};
use self::history::{categorize, HistoryInput, StateChange};
use super::{
    tool_prefix, FactoryEntry, Integration, IntegrationContext, IntegrationError,
    IntegrationFactory, IntegrationHealth,
};
use crate::analysis::baseline::{compute_stats, hour_bucket, Baseline};
use crate::analysis::{anomaly, Anomaly};
use crate::graph::{GraphClient, GraphError};
use crate::tools::{Tool, ToolRegistry, ToolResult};

pub const DASHBOARD_SYNC_INTERVAL: Duration = Duration::from_secs(3600);
pub const ALERT_RULE_SYNC_INTERVAL: Duration = Duration::from_secs(3600);
pub const ALERT_STATE_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const HISTORY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const BASELINE_TTL_NS: i64 = 3600 * 1_000_000_000;
/// Panel-query budget for the overview tool.
const OVERVIEW_PANEL_LIMIT: usize = 20;

#[derive(Clone, Debug, Deserialize)]
pub struct GrafanaConfig {
    pub url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Default datasource for panels that do not name one.
    #[serde(default)]
    pub datasource_uid: Option<String>,
}

/// Synced dashboard metadata. The `level` comes from hierarchy tags:
/// `level:overview` < `level:drilldown` < `level:detail`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DashboardInfo {
    pub uid: String,
    pub title: String,
    pub folder: Option<String>,
    pub level: u8,
    pub tags: Vec<String>,
}

pub fn level_from_tags(tags: &[String]) -> u8 {
    for tag in tags {
        match tag.as_str() {
            "level:overview" => return 1,
            "level:drilldown" => return 2,
            "level:detail" => return 3,
            _ => {}
        }
    }
    2
}

struct HistoryCacheEntry {
    at: Instant,
    value: Value,
}

/// Shared state of one Grafana instance.
struct Shared {
    instance: String,
    config: GrafanaConfig,
    client: Arc<RwLock<GrafanaClient>>,
    context: IntegrationContext,
    dashboards: Arc<RwLock<Vec<DashboardInfo>>>,
    history_cache: Mutex<HashMap<String, HistoryCacheEntry>>,
}

pub struct GrafanaIntegration {
    shared: Arc<Shared>,
    raw_config: Value,
    jobs: Mutex<Option<CancellationToken>>,
}

impl GrafanaIntegration {
    fn build(
        name: &str,
        raw_config: &Value,
        context: IntegrationContext,
    ) -> Result<Arc<Self>, IntegrationError> {
        let config: GrafanaConfig =
            serde_json::from_value(raw_config.clone()).map_err(|error| {
                IntegrationError::InvalidConfig {
                    name: name.to_string(),
                    reason: error.to_string(),
                }
            })?;
        let client = GrafanaClient::new(config.url.clone(), config.api_token.clone())
            .map_err(|error| IntegrationError::StartFailed {
                name: name.to_string(),
                reason: error.to_string(),
            })?;
        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                instance: name.to_string(),
                config,
                client: Arc::new(RwLock::new(client)),
                context,
                dashboards: Arc::new(RwLock::new(Vec::new())),
                history_cache: Mutex::new(HashMap::new()),
            }),
            raw_config: raw_config.clone(),
            jobs: Mutex::new(None),
        }))
    }
}

async fn sync_dashboards(shared: &Shared) {
    let client = shared.client.read().await;
    let hits = match client.search_dashboards().await {
        Ok(hits) => hits,
        Err(error) => {
            warn!(message = "dashboard sync failed", %error);
            return;
        }
    };
    drop(client);

    let mut dashboards: Vec<DashboardInfo> = hits
        .into_iter()
        .map(|hit| DashboardInfo {
            level: level_from_tags(&hit.tags),
            uid: hit.uid,
            title: hit.title,
            folder: hit.folder_title,
            tags: hit.tags,
        })
        .collect();
    dashboards.sort_by_key(|d| d.level);

    debug!(message = "dashboards synced", count = dashboards.len());
    *shared.dashboards.write().await = dashboards;
}

async fn run_jobs(shared: Arc<Shared>, cancel: CancellationToken) {
    let syncer = AlertSyncer::new(shared.context.graph.clone());

    let mut dashboard_ticker = tokio::time::interval(DASHBOARD_SYNC_INTERVAL);
    let mut rule_ticker = tokio::time::interval(ALERT_RULE_SYNC_INTERVAL);
    let mut state_ticker = tokio::time::interval(ALERT_STATE_SYNC_INTERVAL);
    for ticker in [&mut dashboard_ticker, &mut rule_ticker, &mut state_ticker] {
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = dashboard_ticker.tick() => {
                sync_dashboards(&shared).await;
            }
            _ = rule_ticker.tick() => {
                let client = shared.client.read().await.clone();
                if let Err(error) = syncer.sync_rules(&client).await {
                    warn!(message = "alert rule sync failed", %error);
                }
            }
            _ = state_ticker.tick() => {
                let client = shared.client.read().await.clone();
                if let Err(error) = syncer.sync_states(&client).await {
                    warn!(message = "alert state sync failed", %error);
                }
            }
        }
    }
}

#[async_trait]
impl Integration for GrafanaIntegration {
    async fn start(&self) -> Result<(), IntegrationError> {
        {
            let client = self.shared.client.read().await;
            client
                .healthy()
                .await
                .map_err(|error| IntegrationError::StartFailed {
                    name: self.shared.instance.clone(),
                    reason: error.to_string(),
                })?;
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run_jobs(Arc::clone(&self.shared), cancel.clone()));
        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.replace(cancel) {
            previous.cancel();
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.jobs.lock().await.take() {
            cancel.cancel();
        }
    }

    async fn health(&self) -> IntegrationHealth {
        let client = self.shared.client.read().await;
        match client.healthy().await {
            Ok(()) => IntegrationHealth::healthy(),
            Err(error) => IntegrationHealth::degraded(error.to_string()),
        }
    }

    fn register_tools(&self, registry: &ToolRegistry) {
        let prefix = tool_prefix(self.config_type(), &self.shared.instance);
        registry.register(Arc::new(MetricsOverviewTool {
            shared: Arc::clone(&self.shared),
            name: format!("{prefix}overview"),
        }));
        registry.register(Arc::new(MetricsDetailsTool {
            shared: Arc::clone(&self.shared),
            name: format!("{prefix}details"),
        }));
        registry.register(Arc::new(AlertsTool {
            shared: Arc::clone(&self.shared),
            name: format!("{prefix}alerts"),
        }));
    }

    fn config_type(&self) -> &'static str {
        "grafana"
    }

    async fn rotate_secrets(&self, context: &IntegrationContext) -> Result<(), IntegrationError> {
        let resolved = super::secrets::resolve(
            context.kube.as_ref(),
            &context.secrets_namespace,
            &self.raw_config,
        )
        .await
        .map_err(|error| IntegrationError::SecretResolution {
            name: self.shared.instance.clone(),
            reason: error.to_string(),
        })?;
        let config: GrafanaConfig =
            serde_json::from_value(resolved).map_err(|error| IntegrationError::InvalidConfig {
                name: self.shared.instance.clone(),
                reason: error.to_string(),
            })?;
        let client = GrafanaClient::new(config.url.clone(), config.api_token.clone()).map_err(
            |error| IntegrationError::StartFailed {
                name: self.shared.instance.clone(),
                reason: error.to_string(),
            },
        )?;
        *self.shared.client.write().await = client;
        Ok(())
    }
}

/// Panels (title, expr, datasource) extracted from a dashboard JSON.
fn extract_panels(dashboard: &Value, default_datasource: Option<&str>) -> Vec<(String, String, String)> {
    let mut panels = Vec::new();
    let Some(list) = dashboard.get("panels").and_then(Value::as_array) else {
        return panels;
    };
    for panel in list {
        let title = panel
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("(untitled)")
            .to_string();
        let Some(targets) = panel.get("targets").and_then(Value::as_array) else {
            continue;
        };
        for target in targets {
            let Some(expr) = target.get("expr").and_then(Value::as_str) else {
                continue;
            };
            let datasource = target
                .pointer("/datasource/uid")
                .and_then(Value::as_str)
                .or(default_datasource)
                .unwrap_or("")
                .to_string();
            panels.push((title.clone(), expr.to_string(), datasource));
        }
    }
    panels
}

/// Substitutes `$var`-style scoping variables into an expression.
fn apply_variables(expr: &str, variables: &Value) -> String {
    let mut out = expr.to_string();
    if let Some(map) = variables.as_object() {
        for (name, value) in map {
            if let Some(value) = value.as_str() {
                out = out.replace(&format!("${name}"), value);
                out = out.replace(&format!("${{{name}}}"), value);
            }
        }
    }
    out
}

/// A live baseline for the metric, computed from the last seven days of
/// samples in the current time-of-day bucket when the cache misses.
async fn baseline_for(
    shared: &Shared,
    datasource: &str,
    expr: &str,
    now_ns: i64,
) -> Option<Baseline> {
    if let Some(baseline) = shared.context.baselines.get(expr, now_ns) {
        return Some(baseline);
    }

    let client = shared.client.read().await;
    let to_ms = now_ns / 1_000_000;
    let from_ms = to_ms - 7 * 24 * 3600 * 1000;
    let samples = client.query_range(datasource, expr, from_ms, to_ms).await.ok()?;
    drop(client);

    let bucket = hour_bucket(now_ns);
    let in_bucket: Vec<f64> = samples
        .iter()
        .filter(|(ts_ms, _)| hour_bucket(ts_ms * 1_000_000) == bucket)
        .map(|(_, v)| *v)
        .collect();
    if in_bucket.is_empty() {
        return None;
    }
    let (mean, stddev) = compute_stats(&in_bucket);
    let baseline = Baseline {
        mean,
        stddev,
        window_start: from_ms * 1_000_000,
        window_end: now_ns,
        expires_at: now_ns + BASELINE_TTL_NS,
    };
    shared.context.baselines.insert(expr, now_ns, baseline.clone());
    Some(baseline)
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

// --- overview ---

struct MetricsOverviewTool {
    shared: Arc<Shared>,
    name: String,
}

#[async_trait]
impl Tool for MetricsOverviewTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Dashboards overview with current metric anomalies embedded".into()
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        let dashboards = self.shared.dashboards.read().await.clone();
        let now = now_ns();
        let to_ms = now / 1_000_000;
        let from_ms = to_ms - 5 * 60 * 1000;

        let mut anomalies: Vec<Anomaly> = Vec::new();
        let mut queried = 0usize;

        'dashboards: for dashboard in dashboards.iter() {
            let full = {
                let client = self.shared.client.read().await;
                client.dashboard(&dashboard.uid).await
            };
            let Ok(full) = full else { continue };
            for (_, expr, datasource) in
                extract_panels(&full, self.shared.config.datasource_uid.as_deref())
            {
                if queried >= OVERVIEW_PANEL_LIMIT {
                    break 'dashboards;
                }
                queried += 1;

                let latest = {
                    let client = self.shared.client.read().await;
                    client
                        .query_range(&datasource, &expr, from_ms, to_ms)
                        .await
                        .ok()
                        .and_then(|samples| samples.last().map(|(_, v)| *v))
                };
                let Some(latest) = latest else { continue };
                let Some(baseline) = baseline_for(&self.shared, &datasource, &expr, now).await
                else {
                    continue;
                };
                if let Some(found) = anomaly::detect(&expr, latest, &baseline) {
                    anomalies.push(found);
                }
            }
        }

        let anomalies = anomaly::rank(anomalies);
        ToolResult::json(&json!({
            "dashboards": dashboards,
            "panels_checked": queried,
            "anomalies": anomalies,
        }))
    }
}

// --- details ---

struct MetricsDetailsTool {
    shared: Arc<Shared>,
    name: String,
}

#[async_trait]
impl Tool for MetricsDetailsTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Execute all panels of one dashboard with scoping variables".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["dashboard_uid"],
            "properties": {
                "dashboard_uid": {"type": "string"},
                "variables": {"type": "object", "description": "Scoping variables substituted into panel expressions"}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(uid) = args.get("dashboard_uid").and_then(Value::as_str) else {
            return ToolResult::error("dashboard_uid is required");
        };
        let variables = args.get("variables").cloned().unwrap_or(json!({}));

        let full = {
            let client = self.shared.client.read().await;
            client.dashboard(uid).await
        };
        let full = match full {
            Ok(full) => full,
            Err(error) => return ToolResult::error(format!("dashboard fetch failed: {error}")),
        };

        let now = now_ns();
        let to_ms = now / 1_000_000;
        let from_ms = to_ms - 3600 * 1000;

        let mut results = Vec::new();
        for (title, expr, datasource) in
            extract_panels(&full, self.shared.config.datasource_uid.as_deref())
        {
            let scoped = apply_variables(&expr, &variables);
            let samples = {
                let client = self.shared.client.read().await;
                client.query_range(&datasource, &scoped, from_ms, to_ms).await
            };
            match samples {
                Ok(samples) => {
                    results.push(json!({
                        "panel": title,
                        "expr": scoped,
                        "samples": samples.len(),
                        "latest": samples.last().map(|(_, v)| *v),
                    }));
                }
                Err(error) => {
                    results.push(json!({
                        "panel": title,
                        "expr": scoped,
                        "error": error.to_string(),
                    }));
                }
            }
        }

        // An empty dashboard is still a successful, empty envelope.
        ToolResult::json(&json!({
            "dashboard_uid": uid,
            "panels": results,
        }))
    }
}

// --- alerts ---

struct AlertsTool {
    shared: Arc<Shared>,
    name: String,
}

impl AlertsTool {
    async fn alert_history(
        graph: &GraphClient,
        uid: &str,
    ) -> Result<Vec<StateChange>, GraphError> {
        let query = Query::new(
            "MATCH (a:Alert {uid: $uid})-[e:STATE_TRANSITION]->(a) \
             RETURN e.from_state AS from_state, e.to_state AS to_state, \
                    e.timestamp AS timestamp \
             ORDER BY e.timestamp"
                .to_string(),
        )
        .param("uid", uid);
        let mut rows = graph.execute(query).await?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next().await.map_err(|source| GraphError::Query { source })? {
            let from: String = row.get("from_state").unwrap_or_default();
            let to: String = row.get("to_state").unwrap_or_default();
            let timestamp: i64 = row.get("timestamp").unwrap_or_default();
            changes.push(StateChange {
                timestamp,
                from: AlertState::parse(&from),
                to: AlertState::parse(&to),
            });
        }
        Ok(changes)
    }
}

#[async_trait]
impl Tool for AlertsTool {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "List alerts with current state, flappiness, historical categorization, and baseline deviation".into()
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        let graph = &self.shared.context.graph;
        let query = Query::new(
            "MATCH (a:Alert) \
             RETURN a.uid AS uid, coalesce(a.name, a.title, '') AS name, \
                    coalesce(a.currentState, 'normal') AS state, \
                    coalesce(a.last_synced_at, 0) AS last_synced_at, \
                    coalesce(a.firstSeen, 0) AS first_seen"
                .to_string(),
        );
        let mut rows = match graph.execute(query).await {
            Ok(rows) => rows,
            Err(error) => return ToolResult::error(format!("alert listing failed: {error}")),
        };

        let now = now_ns();
        let mut alerts = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(error) => return ToolResult::error(format!("alert row failed: {error}")),
            };
            let uid: String = row.get("uid").unwrap_or_default();
            let name: String = row.get("name").unwrap_or_default();
            let state: String = row.get("state").unwrap_or_default();
            let last_synced_at: i64 = row.get("last_synced_at").unwrap_or_default();
            let first_seen: i64 = row.get("first_seen").unwrap_or_default();

            // Categorization is cached for five minutes per alert.
            let categorization = {
                let cache = self.shared.history_cache.lock().await;
                cache
                    .get(&uid)
                    .filter(|entry| entry.at.elapsed() < HISTORY_CACHE_TTL)
                    .map(|entry| entry.value.clone())
            };
            let categorization = match categorization {
                Some(cached) => cached,
                None => {
                    let changes = match Self::alert_history(graph, &uid).await {
                        Ok(changes) => changes,
                        Err(_) => Vec::new(),
                    };
                    let first_seen = if first_seen > 0 {
                        first_seen
                    } else {
                        changes.first().map(|c| c.timestamp).unwrap_or(now)
                    };
                    let input = HistoryInput {
                        changes,
                        first_seen,
                        current_state: AlertState::parse(&state),
                        now,
                    };
                    let value = serde_json::to_value(categorize(&input)).unwrap_or(Value::Null);
                    self.shared.history_cache.lock().await.insert(
                        uid.clone(),
                        HistoryCacheEntry {
                            at: Instant::now(),
                            value: value.clone(),
                        },
                    );
                    value
                }
            };

            let stale = last_synced_at > 0
                && now - last_synced_at > 2 * ALERT_STATE_SYNC_INTERVAL.as_nanos() as i64;
            alerts.push(json!({
                "uid": uid,
                "name": name,
                "state": state,
                "last_synced_at": last_synced_at,
                "stale": stale,
                "history": categorization,
            }));
        }

        ToolResult::json(&json!({"alerts": alerts}))
    }
}

// --- factory ---

pub struct GrafanaFactory;

impl IntegrationFactory for GrafanaFactory {
    fn type_name(&self) -> &'static str {
        "grafana"
    }

    fn build(
        &self,
        name: &str,
        config: &Value,
        context: IntegrationContext,
    ) -> Result<Arc<dyn Integration>, IntegrationError> {
        Ok(GrafanaIntegration::build(name, config, context)?)
    }
}

inventory::submit! {
    FactoryEntry {
        type_name: "grafana",
        build: || Box::new(GrafanaFactory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_level_from_hierarchy_tags() {
        assert_eq!(level_from_tags(&["level:overview".into()]), 1);
        assert_eq!(level_from_tags(&["level:drilldown".into()]), 2);
        assert_eq!(level_from_tags(&["level:detail".into()]), 3);
        assert_eq!(level_from_tags(&["team:platform".into()]), 2);
        assert_eq!(level_from_tags(&[]), 2);
    }

    #[test]
    fn panel_extraction_handles_missing_pieces() {
        let dashboard = json!({
            "panels": [
                {"title": "rps", "targets": [{"expr": "sum(rate(http_requests_total[5m]))"}]},
                {"title": "no targets"},
                {"targets": [{"expr": "up", "datasource": {"uid": "prom-2"}}]}
            ]
        });
        let panels = extract_panels(&dashboard, Some("prom-1"));
        assert_eq!(panels.len(), 2);
        assert_eq!(panels[0].2, "prom-1");
        assert_eq!(panels[1].0, "(untitled)");
        assert_eq!(panels[1].2, "prom-2");
    }

    #[test]
    fn empty_dashboard_has_no_panels() {
        assert!(extract_panels(&json!({}), None).is_empty());
    }

    #[test]
    fn variable_substitution() {
        let scoped = apply_variables(
            "sum(rate(http_requests_total{namespace=\"$namespace\"}[5m]))",
            &json!({"namespace": "prod"}),
        );
        assert_eq!(scoped, "sum(rate(http_requests_total{namespace=\"prod\"}[5m]))");
    }
}
