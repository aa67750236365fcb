//! The HTTP/JSON surface: health, event search, resource detail,
//! export/import, integration config CRUD, and the MCP endpoint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::block_store::export::{build_archive, import_events, ImportEnvelope};
use crate::block_store::{BlockStore, EventQuery};
use crate::graph::GraphClient;
use crate::integrations::config_store::{ConfigStoreError, IntegrationInstance};
use crate::integrations::manager::IntegrationManager;
use crate::integrations::factory_for;
use crate::kubernetes::WatcherFleet;
use crate::mcp::McpHandler;
use crate::pipeline::EventQueue;

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<BlockStore>,
    pub graph: GraphClient,
    pub queue: Arc<EventQueue>,
    pub fleet: Option<Arc<WatcherFleet>>,
    pub manager: Arc<IntegrationManager>,
    pub mcp: Arc<McpHandler>,
    /// Path segment the MCP endpoint is served under (default `mcp`).
    pub mcp_path: String,
    /// Bounds concurrent heavyweight requests (search, export, import).
    pub limiter: Arc<tokio::sync::Semaphore>,
}

fn error_body(code: &str, message: impl Into<String>) -> Value {
    json!({"error": {"code": code, "message": message.into()}})
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&error_body(code, message)), status).into_response()
}

/// Accepts RFC 3339 or raw nanosecond timestamps.
fn parse_time_param(params: &HashMap<String, String>, key: &str, default_ns: i64) -> i64 {
    let Some(raw) = params.get(key) else {
        return default_ns;
    };
    if let Ok(ns) = raw.parse::<i64>() {
        return ns;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| dt.with_timezone(&Utc).timestamp_nanos_opt())
        .unwrap_or(default_ns)
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub struct ApiServer {
    address: SocketAddr,
    context: ApiContext,
}

impl ApiServer {
    pub fn new(address: SocketAddr, context: ApiContext) -> Self {
        Self { address, context }
    }

    /// Binds and serves until the token fires.
    pub async fn run(self, cancel: CancellationToken) {
        let routes = make_routes(self.context);
        let (bound, server) = warp::serve(routes)
            .bind_with_graceful_shutdown(self.address, async move {
                cancel.cancelled().await;
            });
        info!(message = "http api listening", address = %bound);
        server.await;
        info!(message = "http api stopped");
    }
}

fn with_context(
    context: ApiContext,
) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || context.clone())
}

fn make_routes(context: ApiContext) -> BoxedFilter<(impl Reply,)> {
    let mcp_segment = context.mcp_path.trim_matches('/').to_string();

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(health_handler);

    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(ready_handler);

    let search = warp::path!("v1" / "search")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_context(context.clone()))
        .and_then(search_handler);

    let metadata = warp::path!("v1" / "metadata")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(metadata_handler);

    let resource = warp::path!("v1" / "resources" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(resource_handler);

    let segments = warp::path!("v1" / "resources" / String / "segments")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(segments_handler);

    let resource_events = warp::path!("v1" / "resources" / String / "events")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(resource_events_handler);

    let export = warp::path!("api" / "export")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_context(context.clone()))
        .and_then(export_handler);

    let import = warp::path!("api" / "import")
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024 * 1024))
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(import_handler);

    let integrations_list = warp::path!("api" / "config" / "integrations")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(integrations_list_handler);

    let integrations_create = warp::path!("api" / "config" / "integrations")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(integrations_create_handler);

    let integrations_test = warp::path!("api" / "config" / "integrations" / "test")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(integrations_test_handler);

    let integrations_stream = warp::path!("api" / "config" / "integrations" / "stream")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(integrations_stream_handler);

    let integrations_get = warp::path!("api" / "config" / "integrations" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(integrations_get_handler);

    let integrations_update = warp::path!("api" / "config" / "integrations" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(integrations_update_handler);

    let integrations_delete = warp::path!("api" / "config" / "integrations" / String)
        .and(warp::delete())
        .and(with_context(context.clone()))
        .and_then(integrations_delete_handler);

    let mcp = warp::path(mcp_segment)
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context))
        .and_then(mcp_handler);

    health
        .or(ready)
        .or(search)
        .or(metadata)
        .or(segments)
        .or(resource_events)
        .or(resource)
        .or(export)
        .or(import)
        .or(integrations_test)
        .or(integrations_stream)
        .or(integrations_list)
        .or(integrations_create)
        .or(integrations_get)
        .or(integrations_update)
        .or(integrations_delete)
        .or(mcp)
        .boxed()
}

async fn health_handler(context: ApiContext) -> Result<warp::reply::Response, Infallible> {
    let integrations = context.manager.health_snapshots().await;
    Ok(warp::reply::json(&json!({
        "status": "ok",
        "dropped_events": context.queue.dropped(),
        "queued_events": context.queue.len(),
        "integrations": integrations,
    }))
    .into_response())
}

async fn ready_handler(context: ApiContext) -> Result<warp::reply::Response, Infallible> {
    let ready = context.fleet.as_ref().map(|f| f.is_ready()).unwrap_or(true);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(
        warp::reply::with_status(warp::reply::json(&json!({"ready": ready})), status)
            .into_response(),
    )
}

async fn search_handler(
    params: HashMap<String, String>,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let _permit = context.limiter.acquire().await;
    let now = now_ns();
    let query = EventQuery {
        from_ns: parse_time_param(&params, "from", now - 3600 * 1_000_000_000),
        to_ns: parse_time_param(&params, "to", now),
        kind: params.get("kind").cloned().filter(|s| !s.is_empty()),
        namespace: params.get("namespace").cloned().filter(|s| !s.is_empty()),
        name: params.get("name").cloned().filter(|s| !s.is_empty()),
        group: params.get("group").cloned().filter(|s| !s.is_empty()),
        uid: params.get("uid").cloned().filter(|s| !s.is_empty()),
    };
    let result = context.store.query(&query).await;
    Ok(warp::reply::json(&result).into_response())
}

async fn metadata_handler(context: ApiContext) -> Result<warp::reply::Response, Infallible> {
    match context.store.metadata().await {
        Ok(metadata) => Ok(warp::reply::json(&metadata).into_response()),
        Err(error) => Ok(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            error.to_string(),
        )),
    }
}

async fn resource_handler(
    uid: String,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let final_state = context.store.final_state(&uid).await.unwrap_or(None);

    let node = {
        let query = neo4rs::Query::new(
            "MATCH (r:Resource {uid: $uid}) \
             RETURN r.kind AS kind, r.namespace AS namespace, r.name AS name, \
                    r.firstSeen AS first_seen, r.lastSeen AS last_seen, \
                    coalesce(r.deleted, false) AS deleted"
                .to_string(),
        )
        .param("uid", uid.as_str());
        match context.graph.execute(query).await {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => {
                    let kind: String = row.get("kind").unwrap_or_default();
                    let namespace: String = row.get("namespace").unwrap_or_default();
                    let name: String = row.get("name").unwrap_or_default();
                    let first_seen: i64 = row.get("first_seen").unwrap_or_default();
                    let last_seen: i64 = row.get("last_seen").unwrap_or_default();
                    let deleted: bool = row.get("deleted").unwrap_or(false);
                    Some(json!({
                        "kind": kind,
                        "namespace": namespace,
                        "name": name,
                        "first_seen": first_seen,
                        "last_seen": last_seen,
                        "deleted": deleted,
                    }))
                }
                _ => None,
            },
            Err(_) => None,
        }
    };

    if final_state.is_none() && node.is_none() {
        return Ok(json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no resource with uid {uid}"),
        ));
    }
    Ok(warp::reply::json(&json!({
        "uid": uid,
        "graph": node,
        "last_state": final_state,
    }))
    .into_response())
}

async fn segments_handler(
    uid: String,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let mut query = EventQuery::range(0, now_ns());
    query.uid = Some(uid.clone());
    let result = context.store.query(&query).await;

    // Collapse the event stream into contiguous same-status segments.
    let mut segments: Vec<Value> = Vec::new();
    let mut current: Option<(String, i64, i64)> = None;
    for event in &result.events {
        let status = event.status.as_str();
        let extends = matches!(&current, Some((s, _, _)) if s == status);
        if extends {
            if let Some((_, _, until)) = &mut current {
                *until = event.timestamp;
            }
        } else {
            if let Some((s, from, until)) = current.take() {
                segments.push(json!({"status": s, "from": from, "to": until}));
            }
            current = Some((status.to_string(), event.timestamp, event.timestamp));
        }
    }
    if let Some((s, from, until)) = current {
        segments.push(json!({"status": s, "from": from, "to": until}));
    }

    Ok(warp::reply::json(&json!({"uid": uid, "segments": segments})).into_response())
}

async fn resource_events_handler(
    uid: String,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let mut query = EventQuery::range(0, now_ns());
    query.uid = Some(uid);
    let result = context.store.query(&query).await;
    Ok(warp::reply::json(&result).into_response())
}

async fn export_handler(
    params: HashMap<String, String>,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let _permit = context.limiter.acquire().await;
    let now = now_ns();
    let from = parse_time_param(&params, "from", 0);
    let to = parse_time_param(&params, "to", now);
    let include_open_hour = params
        .get("include_open_hour")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let gzip = params
        .get("compression")
        .map(|v| v == "gzip")
        .unwrap_or(false);

    match build_archive(&context.store, from, to, include_open_hour, gzip).await {
        Ok(bytes) => {
            let (content_type, filename) = if gzip {
                ("application/gzip", "spectre-export.tar.gz")
            } else {
                ("application/x-tar", "spectre-export.tar")
            };
            let response = warp::http::Response::builder()
                .header("Content-Type", content_type)
                .header(
                    "Content-Disposition",
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(bytes.into())
                .unwrap_or_else(|_| {
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "export failed")
                });
            Ok(response)
        }
        Err(error) => Ok(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            error.to_string(),
        )),
    }
}

async fn import_handler(
    envelope: ImportEnvelope,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let _permit = context.limiter.acquire().await;
    let report = import_events(&context.store, envelope).await;
    Ok(warp::reply::json(&report).into_response())
}

fn config_error_reply(error: ConfigStoreError) -> warp::reply::Response {
    match &error {
        ConfigStoreError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "not_found", error.to_string())
        }
        ConfigStoreError::AlreadyExists { .. } | ConfigStoreError::Malformed { .. } => {
            json_error(StatusCode::BAD_REQUEST, "bad_input", error.to_string())
        }
        _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", error.to_string()),
    }
}

async fn integrations_list_handler(
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    match context.manager.store().load().await {
        Ok(file) => Ok(warp::reply::json(&file).into_response()),
        Err(error) => Ok(config_error_reply(error)),
    }
}

async fn integrations_create_handler(
    instance: IntegrationInstance,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if factory_for(&instance.type_name).is_none() {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "bad_input",
            format!("unknown integration type: {}", instance.type_name),
        ));
    }
    match context.manager.store().create(instance).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&json!({"status": "created"})),
            StatusCode::CREATED,
        )
        .into_response()),
        Err(error) => Ok(config_error_reply(error)),
    }
}

async fn integrations_get_handler(
    name: String,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    match context.manager.store().get(&name).await {
        Ok(instance) => Ok(warp::reply::json(&instance).into_response()),
        Err(error) => Ok(config_error_reply(error)),
    }
}

async fn integrations_update_handler(
    name: String,
    mut instance: IntegrationInstance,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    instance.name = name;
    if factory_for(&instance.type_name).is_none() {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "bad_input",
            format!("unknown integration type: {}", instance.type_name),
        ));
    }
    match context.manager.store().update(instance).await {
        Ok(()) => Ok(warp::reply::json(&json!({"status": "updated"})).into_response()),
        Err(error) => Ok(config_error_reply(error)),
    }
}

async fn integrations_delete_handler(
    name: String,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    match context.manager.store().delete(&name).await {
        Ok(()) => Ok(warp::reply::json(&json!({"status": "deleted"})).into_response()),
        Err(error) => Ok(config_error_reply(error)),
    }
}

async fn integrations_test_handler(
    instance: IntegrationInstance,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let (success, message) = context.manager.test_instance(instance).await;
    Ok(warp::reply::json(&json!({"success": success, "message": message})).into_response())
}

fn integrations_stream_handler(context: ApiContext) -> impl Reply {
    let stream = BroadcastStream::new(context.manager.subscribe_health()).filter_map(
        |snapshots| async move {
            let snapshots = snapshots.ok()?;
            warp::sse::Event::default()
                .event("health")
                .json_data(&snapshots)
                .ok()
                .map(Ok::<_, Infallible>)
        },
    );
    warp::sse::reply(warp::sse::keep_alive().stream(stream))
}

async fn mcp_handler(
    request: Value,
    context: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    match context.mcp.handle(request).await {
        Some(response) => Ok(warp::reply::json(&response).into_response()),
        // Notification: acknowledged with no body.
        None => Ok(warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT).into_response()),
    }
}
