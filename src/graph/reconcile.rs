//! Periodic reconciliation of graph nodes against the live cluster.
//!
//! Watch streams can miss Delete events (restarts, resourceVersion gaps).
//! The reconciler lists each watched kind and marks graph nodes that no
//! longer exist as deleted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::Client;
use neo4rs::Query;
use tokio_util::sync::CancellationToken;

use super::{GraphClient, GraphError};
use crate::kubernetes::config as watch_config;
use crate::kubernetes::WatchSpec;

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DELETE_BATCH: usize = 100;
const LIST_PAGE_SIZE: u32 = 500;

pub struct Reconciler {
    graph: GraphClient,
    kube: Client,
    /// The watch config is re-read each pass; it is the source of truth for
    /// which kinds we are responsible for.
    config_path: PathBuf,
}

impl Reconciler {
    pub fn new(graph: GraphClient, kube: Client, config_path: PathBuf) -> Self {
        Self {
            graph,
            kube,
            config_path,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.pass().await {
                warn!(message = "reconciliation pass failed", %error);
            }
        }
    }

    pub async fn pass(&self) -> Result<(), GraphError> {
        let bytes = match tokio::fs::read(&self.config_path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(message = "reconciler cannot read watch config", %error);
                return Ok(());
            }
        };
        let config = match watch_config::parse(&self.config_path, &bytes) {
            Ok(config) => config,
            Err(error) => {
                warn!(message = "reconciler cannot parse watch config", %error);
                return Ok(());
            }
        };

        for spec in &config.resources {
            if let Err(error) = self.reconcile_kind(spec).await {
                warn!(message = "kind reconciliation failed", kind = %spec.kind, %error);
            }
        }
        Ok(())
    }

    async fn reconcile_kind(&self, spec: &WatchSpec) -> Result<(), GraphError> {
        let graph_uids = self.graph_uids(&spec.kind).await?;
        if graph_uids.is_empty() {
            return Ok(());
        }

        let live_uids = match self.live_uids(spec).await {
            Ok(uids) => uids,
            Err(error) => {
                // An unlistable kind (gone CRD, RBAC change) must not cause
                // mass-deletion in the graph.
                warn!(message = "skipping reconciliation, list failed", kind = %spec.kind, %error);
                return Ok(());
            }
        };

        let missing: Vec<String> = graph_uids.difference(&live_uids).cloned().collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!(
            message = "marking vanished resources deleted",
            kind = %spec.kind,
            count = missing.len(),
        );

        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        for chunk in missing.chunks(DELETE_BATCH) {
            let query = Query::new(
                "MATCH (r:Resource) WHERE r.uid IN $uids \
                 SET r.deleted = true, r.deletedAt = $now"
                    .to_string(),
            )
            .param("uids", chunk.to_vec())
            .param("now", now);
            self.graph.run(query).await?;
        }
        Ok(())
    }

    async fn graph_uids(&self, kind: &str) -> Result<HashSet<String>, GraphError> {
        let query = Query::new(
            "MATCH (r:Resource {kind: $kind}) \
             WHERE coalesce(r.deleted, false) = false \
             RETURN r.uid AS uid"
                .to_string(),
        )
        .param("kind", kind);

        let mut rows = self.graph.execute(query).await?;
        let mut uids = HashSet::new();
        while let Some(row) = rows.next().await.map_err(|source| GraphError::Query { source })? {
            let uid: String = row.get("uid").unwrap_or_default();
            if !uid.is_empty() {
                uids.insert(uid);
            }
        }
        Ok(uids)
    }

    async fn live_uids(&self, spec: &WatchSpec) -> Result<HashSet<String>, kube::Error> {
        let gvk = GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &spec.resource);
        let api: Api<DynamicObject> = Api::all_with(self.kube.clone(), &ar);

        let mut uids = HashSet::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
            params.continue_token = continue_token.clone();
            let page = api.list(&params).await?;
            for object in &page.items {
                if let Some(uid) = &object.metadata.uid {
                    uids.insert(uid.clone());
                }
            }
            continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());
            if continue_token.is_none() {
                break;
            }
        }
        Ok(uids)
    }
}
