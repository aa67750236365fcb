//! Idempotent graph writes driven by the event stream.
//!
//! Nodes MERGE on uid, edges on (from, to, type); replaying an event batch
//! converges to the same graph.

use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::Query;

use super::extract::{self, Extractor};
use super::model::{EdgeCandidate, EdgeTarget, EdgeType, Evidence, EvidenceType};
use super::scoring::{
    confidence_from_evidence, TEMPORAL_PROXIMITY_WINDOW_NS, WEIGHT_TEMPORAL_PROXIMITY,
};
use super::{GraphClient, GraphError};
use crate::event::{Event, EventKind};
use crate::pipeline::EventSink;

pub struct GraphBuilder {
    client: GraphClient,
    chain: Vec<Box<dyn Extractor>>,
}

impl GraphBuilder {
    pub fn new(client: GraphClient) -> Arc<Self> {
        Arc::new(Self {
            client,
            chain: extract::default_chain(),
        })
    }

    async fn apply(&self, event: &Event) -> Result<(), GraphError> {
        self.upsert_resource(event).await?;
        self.record_change(event).await?;

        let candidates = extract::run_chain(&self.chain, event);
        for candidate in candidates {
            if let Err(error) = self.write_edge(event, candidate).await {
                warn!(message = "failed to write edge", %error);
            }
        }
        Ok(())
    }

    async fn upsert_resource(&self, event: &Event) -> Result<(), GraphError> {
        let labels = serde_json::to_string(&event.labels).unwrap_or_default();
        let annotations = serde_json::to_string(&event.annotations).unwrap_or_default();

        let query = Query::new(
            "MERGE (r:Resource {uid: $uid}) \
             ON CREATE SET r.firstSeen = $ts \
             SET r.kind = $kind, r.apiGroup = $group, r.version = $version, \
                 r.namespace = $namespace, r.name = $name, \
                 r.labels = $labels, r.annotations = $annotations, \
                 r.lastSeen = $ts"
                .to_string(),
        )
        .param("uid", event.identity.uid.as_str())
        .param("ts", event.timestamp)
        .param("kind", event.identity.kind.as_str())
        .param("group", event.identity.api_group.as_str())
        .param("version", event.identity.api_version.as_str())
        .param("namespace", event.identity.namespace.clone().unwrap_or_default())
        .param("name", event.identity.name.as_str())
        .param("labels", labels)
        .param("annotations", annotations);
        self.client.run(query).await?;

        if event.kind == EventKind::Delete {
            let query = Query::new(
                "MATCH (r:Resource {uid: $uid}) \
                 SET r.deleted = true, r.deletedAt = $ts"
                    .to_string(),
            )
            .param("uid", event.identity.uid.as_str())
            .param("ts", event.timestamp);
            self.client.run(query).await?;
        }
        Ok(())
    }

    async fn record_change(&self, event: &Event) -> Result<(), GraphError> {
        let query = Query::new(
            "MATCH (r:Resource {uid: $uid}) \
             MERGE (c:Change {id: $id}) \
             ON CREATE SET c.timestamp = $ts, c.eventKind = $event_kind, c.status = $status \
             MERGE (r)-[:CHANGED]->(c)"
                .to_string(),
        )
        .param("uid", event.identity.uid.as_str())
        .param("id", event.id.to_string())
        .param("ts", event.timestamp)
        .param("event_kind", event.kind.as_str())
        .param("status", event.status.as_str());
        self.client.run(query).await
    }

    /// Resolves a target to a uid. Named targets match the most recently
    /// seen live node of that identity; unresolvable names drop the edge.
    async fn resolve(&self, target: &EdgeTarget) -> Result<Option<(String, i64)>, GraphError> {
        match target {
            EdgeTarget::Uid(uid) => Ok(Some((uid.clone(), 0))),
            EdgeTarget::Named {
                kind,
                namespace,
                name,
            } => {
                let query = Query::new(
                    "MATCH (r:Resource {kind: $kind, name: $name}) \
                     WHERE coalesce(r.deleted, false) = false \
                       AND ($namespace = '' OR r.namespace = $namespace) \
                     RETURN r.uid AS uid, r.lastSeen AS lastSeen \
                     ORDER BY r.lastSeen DESC LIMIT 1"
                        .to_string(),
                )
                .param("kind", kind.as_str())
                .param("name", name.as_str())
                .param("namespace", namespace.clone().unwrap_or_default());

                let mut rows = self.client.execute(query).await?;
                match rows.next().await.map_err(|source| GraphError::Query { source })? {
                    Some(row) => {
                        let uid: String = row.get("uid").unwrap_or_default();
                        let last_seen: i64 = row.get("lastSeen").unwrap_or_default();
                        Ok(Some((uid, last_seen)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn write_edge(
        &self,
        event: &Event,
        mut candidate: EdgeCandidate,
    ) -> Result<(), GraphError> {
        let Some((from_uid, from_last_seen)) = self.resolve(&candidate.from).await? else {
            trace!(message = "edge source unresolved, dropping", edge_type = %candidate.edge_type);
            return Ok(());
        };
        let Some((to_uid, _)) = self.resolve(&candidate.to).await? else {
            trace!(message = "edge target unresolved, dropping", edge_type = %candidate.edge_type);
            return Ok(());
        };

        // Inferred manager edges earn temporal-proximity evidence when the
        // manager itself changed recently.
        if candidate.edge_type == EdgeType::Manages
            && from_last_seen > 0
            && (event.timestamp - from_last_seen).abs() <= TEMPORAL_PROXIMITY_WINDOW_NS
            && !candidate
                .evidence
                .iter()
                .any(|e| e.evidence_type == EvidenceType::TemporalProximity)
        {
            candidate.evidence.push(Evidence {
                evidence_type: EvidenceType::TemporalProximity,
                value: format!("manager changed {}ns before", event.timestamp - from_last_seen),
                weight: WEIGHT_TEMPORAL_PROXIMITY,
                timestamp: event.timestamp,
            });
            candidate.confidence = confidence_from_evidence(&candidate.evidence);
        }

        // Stub nodes keep explicit uid references (owners outside the watch
        // set) from losing their edges.
        for uid in [&from_uid, &to_uid] {
            let query = Query::new(
                "MERGE (r:Resource {uid: $uid}) ON CREATE SET r.firstSeen = $ts, r.lastSeen = $ts"
                    .to_string(),
            )
            .param("uid", uid.as_str())
            .param("ts", event.timestamp);
            self.client.run(query).await?;
        }

        let evidence = serde_json::to_string(&candidate.evidence).unwrap_or_default();
        let statement = format!(
            "MATCH (a:Resource {{uid: $from}}), (b:Resource {{uid: $to}}) \
             MERGE (a)-[e:{}]->(b) \
             ON CREATE SET e.firstObserved = $ts \
             SET e.confidence = $confidence, e.baseConfidence = $confidence, \
                 e.evidence = $evidence, e.validationState = 'Valid', \
                 e.lastValidated = $ts",
            candidate.edge_type.as_str()
        );
        let query = Query::new(statement)
            .param("from", from_uid.as_str())
            .param("to", to_uid.as_str())
            .param("ts", event.timestamp)
            .param("confidence", candidate.confidence)
            .param("evidence", evidence);
        self.client.run(query).await
    }
}

#[async_trait]
impl EventSink for GraphBuilder {
    async fn accept(&self, events: &[Event]) {
        for event in events {
            if let Err(error) = self.apply(event).await {
                // Graph unavailability is transient; the store still has the
                // events and reconciliation will catch up.
                warn!(message = "graph update failed", uid = %event.identity.uid, %error);
            }
        }
    }
}
