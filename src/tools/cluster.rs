//! Cluster investigation tools backed by the block store and the graph.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::Query;
use serde::Serialize;
use serde_json::{json, Value};

use super::{Tool, ToolRegistry, ToolResult};
use crate::block_store::{BlockStore, EventQuery};
use crate::event::ResourceStatus;
use crate::graph::{GraphClient, GraphError};
use crate::pipeline::EventQueue;

const DEFAULT_WINDOW_NS: i64 = 3600 * 1_000_000_000;
const DEFAULT_CHANGE_LIMIT: usize = 100;

/// Shared dependencies of the cluster tools.
#[derive(Clone)]
pub struct ClusterToolContext {
    pub store: Arc<BlockStore>,
    pub graph: GraphClient,
    pub queue: Arc<EventQueue>,
}

/// Registers the cluster tool set.
pub fn register(registry: &ToolRegistry, context: ClusterToolContext) {
    registry.register(Arc::new(ClusterHealthTool {
        context: context.clone(),
    }));
    registry.register(Arc::new(ResourceChangesTool {
        context: context.clone(),
    }));
    registry.register(Arc::new(InvestigateTool {
        context: context.clone(),
    }));
    registry.register(Arc::new(ResourceExplorerTool { context }));
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

fn optional_string(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Serialize)]
struct EventSummary {
    time: String,
    event: &'static str,
    kind: String,
    namespace: Option<String>,
    name: String,
    status: &'static str,
}

fn summarize(events: &[crate::event::Event], limit: usize) -> Vec<EventSummary> {
    events
        .iter()
        .rev()
        .take(limit)
        .map(|e| EventSummary {
            time: e.timestamp_utc().to_rfc3339(),
            event: e.kind.as_str(),
            kind: e.identity.kind.clone(),
            namespace: e.identity.namespace.clone(),
            name: e.identity.name.clone(),
            status: e.status.as_str(),
        })
        .collect()
}

// --- cluster_health ---

struct ClusterHealthTool {
    context: ClusterToolContext,
}

#[async_trait]
impl Tool for ClusterHealthTool {
    fn name(&self) -> String {
        "cluster_health".into()
    }

    fn description(&self) -> String {
        "Overview of cluster state: tracked resources, recent error and warning activity per namespace".into()
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        let now = now_ns();
        let recent = self
            .context
            .store
            .query(&EventQuery::range(now - DEFAULT_WINDOW_NS, now))
            .await;

        let mut by_namespace: std::collections::BTreeMap<String, (u64, u64, u64)> =
            std::collections::BTreeMap::new();
        for event in &recent.events {
            let ns = event
                .identity
                .namespace
                .clone()
                .unwrap_or_else(|| "(cluster)".to_string());
            let entry = by_namespace.entry(ns).or_default();
            entry.0 += 1;
            match event.status {
                ResourceStatus::Error => entry.2 += 1,
                ResourceStatus::Warning => entry.1 += 1,
                _ => {}
            }
        }

        let metadata = match self.context.store.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => return ToolResult::error(format!("metadata scan failed: {error}")),
        };

        let namespaces: Vec<Value> = by_namespace
            .into_iter()
            .map(|(namespace, (total, warnings, errors))| {
                json!({
                    "namespace": namespace,
                    "changes_last_hour": total,
                    "warnings": warnings,
                    "errors": errors,
                })
            })
            .collect();

        ToolResult::json(&json!({
            "stored_events": metadata.event_count,
            "tracked_kinds": metadata.kinds.len(),
            "dropped_events": self.context.queue.dropped(),
            "namespaces": namespaces,
        }))
    }
}

// --- resource_changes ---

struct ResourceChangesTool {
    context: ClusterToolContext,
}

#[async_trait]
impl Tool for ResourceChangesTool {
    fn name(&self) -> String {
        "resource_changes".into()
    }

    fn description(&self) -> String {
        "List resource change events in a time range, filterable by kind, namespace, and name".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": {"type": "string", "description": "RFC 3339 start, default one hour ago"},
                "to": {"type": "string", "description": "RFC 3339 end, default now"},
                "kind": {"type": "string"},
                "namespace": {"type": "string"},
                "name": {"type": "string"},
                "limit": {"type": "integer", "default": DEFAULT_CHANGE_LIMIT}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let now = now_ns();
        let query = EventQuery {
            from_ns: parse_time(&args, "from", now - DEFAULT_WINDOW_NS),
            to_ns: parse_time(&args, "to", now),
            kind: optional_string(&args, "kind"),
            namespace: optional_string(&args, "namespace"),
            name: optional_string(&args, "name"),
            ..Default::default()
        };
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_CHANGE_LIMIT as u64) as usize;

        let result = self.context.store.query(&query).await;
        ToolResult::json(&json!({
            "total_matched": result.events.len(),
            "changes": summarize(&result.events, limit),
            "files_searched": result.files_searched,
            "blocks_scanned": result.blocks_scanned,
            "blocks_skipped": result.blocks_skipped,
        }))
    }
}

// --- investigate ---

struct InvestigateTool {
    context: ClusterToolContext,
}

impl InvestigateTool {
    async fn resolve_uid(&self, args: &Value) -> Result<Option<String>, GraphError> {
        if let Some(uid) = optional_string(args, "uid") {
            return Ok(Some(uid));
        }
        let (Some(kind), Some(name)) = (optional_string(args, "kind"), optional_string(args, "name"))
        else {
            return Ok(None);
        };
        let namespace = optional_string(args, "namespace").unwrap_or_default();

        let query = Query::new(
            "MATCH (r:Resource {kind: $kind, name: $name}) \
             WHERE $namespace = '' OR r.namespace = $namespace \
             RETURN r.uid AS uid ORDER BY r.lastSeen DESC LIMIT 1"
                .to_string(),
        )
        .param("kind", kind)
        .param("name", name)
        .param("namespace", namespace);
        let mut rows = self.context.graph.execute(query).await?;
        match rows.next().await.map_err(|source| GraphError::Query { source })? {
            Some(row) => Ok(Some(row.get("uid").unwrap_or_default())),
            None => Ok(None),
        }
    }

    async fn relationships(&self, uid: &str) -> Result<Vec<Value>, GraphError> {
        let query = Query::new(
            "MATCH (r:Resource {uid: $uid})-[e]-(other:Resource) \
             WHERE type(e) <> 'CHANGED' \
             RETURN type(e) AS edge_type, \
                    startNode(e).uid = $uid AS outgoing, \
                    coalesce(e.confidence, 1.0) AS confidence, \
                    coalesce(e.validationState, 'Valid') AS validation_state, \
                    other.uid AS uid, other.kind AS kind, \
                    other.namespace AS namespace, other.name AS name, \
                    coalesce(other.deleted, false) AS deleted"
                .to_string(),
        )
        .param("uid", uid);

        let mut rows = self.context.graph.execute(query).await?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(|source| GraphError::Query { source })? {
            let edge_type: String = row.get("edge_type").unwrap_or_default();
            let outgoing: bool = row.get("outgoing").unwrap_or(true);
            let confidence: f64 = row.get("confidence").unwrap_or(1.0);
            let validation_state: String = row.get("validation_state").unwrap_or_default();
            let other_uid: String = row.get("uid").unwrap_or_default();
            let kind: String = row.get("kind").unwrap_or_default();
            let namespace: String = row.get("namespace").unwrap_or_default();
            let name: String = row.get("name").unwrap_or_default();
            let deleted: bool = row.get("deleted").unwrap_or(false);
            edges.push(json!({
                "relation": edge_type,
                "direction": if outgoing { "outgoing" } else { "incoming" },
                "confidence": confidence,
                "validation_state": validation_state,
                "resource": {
                    "uid": other_uid,
                    "kind": kind,
                    "namespace": namespace,
                    "name": name,
                    "deleted": deleted,
                }
            }));
        }
        Ok(edges)
    }
}

#[async_trait]
impl Tool for InvestigateTool {
    fn name(&self) -> String {
        "investigate".into()
    }

    fn description(&self) -> String {
        "Deep-dive one resource: its relationships (owners, managers, references) and recent change history".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "uid": {"type": "string", "description": "Resource uid; or identify by kind/namespace/name"},
                "kind": {"type": "string"},
                "namespace": {"type": "string"},
                "name": {"type": "string"}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let uid = match self.resolve_uid(&args).await {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                return ToolResult::error(
                    "resource not found: provide uid, or kind and name (plus namespace)",
                )
            }
            Err(error) => return ToolResult::error(format!("graph lookup failed: {error}")),
        };

        let relationships = match self.relationships(&uid).await {
            Ok(relationships) => relationships,
            Err(error) => return ToolResult::error(format!("graph lookup failed: {error}")),
        };

        let now = now_ns();
        let mut query = EventQuery::range(now - 24 * DEFAULT_WINDOW_NS, now);
        query.uid = Some(uid.clone());
        let changes = self.context.store.query(&query).await;

        ToolResult::json(&json!({
            "uid": uid,
            "relationships": relationships,
            "recent_changes": summarize(&changes.events, 50),
        }))
    }
}

// --- resource_explorer ---

struct ResourceExplorerTool {
    context: ClusterToolContext,
}

#[async_trait]
impl Tool for ResourceExplorerTool {
    fn name(&self) -> String {
        "resource_explorer".into()
    }

    fn description(&self) -> String {
        "Browse tracked resources by kind and namespace, including deleted ones".into()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string"},
                "namespace": {"type": "string"},
                "include_deleted": {"type": "boolean", "default": false},
                "limit": {"type": "integer", "default": 100}
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let kind = optional_string(&args, "kind").unwrap_or_default();
        let namespace = optional_string(&args, "namespace").unwrap_or_default();
        let include_deleted = args
            .get("include_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(100);

        let query = Query::new(
            "MATCH (r:Resource) \
             WHERE ($kind = '' OR r.kind = $kind) \
               AND ($namespace = '' OR r.namespace = $namespace) \
               AND ($include_deleted OR coalesce(r.deleted, false) = false) \
               AND r.kind IS NOT NULL \
             RETURN r.uid AS uid, r.kind AS kind, r.namespace AS namespace, \
                    r.name AS name, r.firstSeen AS first_seen, r.lastSeen AS last_seen, \
                    coalesce(r.deleted, false) AS deleted \
             ORDER BY r.lastSeen DESC LIMIT $limit"
                .to_string(),
        )
        .param("kind", kind)
        .param("namespace", namespace)
        .param("include_deleted", include_deleted)
        .param("limit", limit);

        let mut rows = match self.context.graph.execute(query).await {
            Ok(rows) => rows,
            Err(error) => return ToolResult::error(format!("graph lookup failed: {error}")),
        };

        let mut resources = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let uid: String = row.get("uid").unwrap_or_default();
                    let kind: String = row.get("kind").unwrap_or_default();
                    let namespace: String = row.get("namespace").unwrap_or_default();
                    let name: String = row.get("name").unwrap_or_default();
                    let first_seen: i64 = row.get("first_seen").unwrap_or_default();
                    let last_seen: i64 = row.get("last_seen").unwrap_or_default();
                    let deleted: bool = row.get("deleted").unwrap_or(false);
                    resources.push(json!({
                        "uid": uid,
                        "kind": kind,
                        "namespace": namespace,
                        "name": name,
                        "first_seen": first_seen,
                        "last_seen": last_seen,
                        "deleted": deleted,
                    }));
                }
                Ok(None) => break,
                Err(error) => return ToolResult::error(format!("graph row failed: {error}")),
            }
        }

        ToolResult::json(&json!({"resources": resources}))
    }
}
