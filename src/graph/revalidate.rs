//! Background revalidation and confidence decay of inferred edges.

use std::time::Duration;

use chrono::Utc;
use neo4rs::Query;
use tokio_util::sync::CancellationToken;

use super::model::{Edge, EdgeType, ValidationState, CONFIDENCE_FLOOR};
use super::{GraphClient, GraphError};

pub const REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Edge age past which it is marked Stale and its confidence has fully
/// decayed to the floor: 7 days.
pub const STALE_THRESHOLD_NS: i64 = 7 * 24 * 3600 * 1_000_000_000;

/// Edge age past which endpoint liveness is re-checked: 1 hour.
pub const LIVENESS_AGE_NS: i64 = 3600 * 1_000_000_000;

const DECAY_6H_NS: i64 = 6 * 3600 * 1_000_000_000;
const DECAY_24H_NS: i64 = 24 * 3600 * 1_000_000_000;
const DECAY_6H_FACTOR: f64 = 0.9;
const DECAY_24H_FACTOR: f64 = 0.7;

/// Confidence after decay. The factor for the step the age falls in applies
/// to the originally earned confidence; steps do not compound. Edges at 1.0
/// are explicit references and never decay.
pub fn decayed_confidence(base: f64, age_ns: i64) -> f64 {
    if base >= 1.0 {
        return base;
    }
    let factor = if age_ns >= STALE_THRESHOLD_NS {
        return CONFIDENCE_FLOOR;
    } else if age_ns >= DECAY_24H_NS {
        DECAY_24H_FACTOR
    } else if age_ns >= DECAY_6H_NS {
        DECAY_6H_FACTOR
    } else {
        1.0
    };
    (base * factor).max(CONFIDENCE_FLOOR)
}

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeUpdate {
    pub from_uid: String,
    pub to_uid: String,
    pub edge_type: EdgeType,
    pub confidence: f64,
    pub validation_state: ValidationState,
}

/// Computes the update for one edge, or `None` when nothing changed.
pub fn revalidate_edge(edge: &Edge, now_ns: i64) -> Option<EdgeUpdate> {
    let age = now_ns.saturating_sub(edge.first_observed);

    let confidence = decayed_confidence(edge.base_confidence, age);
    let validation_state = if age >= STALE_THRESHOLD_NS {
        ValidationState::Stale
    } else if age >= LIVENESS_AGE_NS {
        if edge.endpoints_alive {
            ValidationState::Valid
        } else {
            ValidationState::Invalid
        }
    } else {
        edge.validation_state
    };

    let confidence_changed = (confidence - edge.confidence).abs() > 1e-9;
    if !confidence_changed && validation_state == edge.validation_state {
        return None;
    }
    Some(EdgeUpdate {
        from_uid: edge.from_uid.clone(),
        to_uid: edge.to_uid.clone(),
        edge_type: edge.edge_type,
        confidence,
        validation_state,
    })
}

pub struct Revalidator {
    client: GraphClient,
}

impl Revalidator {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REVALIDATION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.pass().await {
                warn!(message = "revalidation pass failed", %error);
            }
        }
    }

    /// One full pass: read inferred edges, compute updates, write back only
    /// the changed ones.
    pub async fn pass(&self) -> Result<usize, GraphError> {
        let edges = self.load_edges().await?;
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);

        let mut updated = 0usize;
        for edge in &edges {
            if let Some(update) = revalidate_edge(edge, now) {
                self.write_update(&update).await?;
                updated += 1;
            }
        }
        debug!(message = "revalidation pass complete", examined = edges.len(), updated);
        Ok(updated)
    }

    async fn load_edges(&self) -> Result<Vec<Edge>, GraphError> {
        let query = Query::new(
            "MATCH (a:Resource)-[e:MANAGES|CREATES_OBSERVED]->(b:Resource) \
             RETURN a.uid AS from_uid, b.uid AS to_uid, type(e) AS edge_type, \
                    e.confidence AS confidence, \
                    coalesce(e.baseConfidence, e.confidence) AS base_confidence, \
                    coalesce(e.firstObserved, 0) AS first_observed, \
                    coalesce(e.lastValidated, 0) AS last_validated, \
                    coalesce(e.validationState, 'Valid') AS validation_state, \
                    (coalesce(a.deleted, false) = false AND coalesce(b.deleted, false) = false) \
                        AS endpoints_alive"
                .to_string(),
        );

        let mut rows = self.client.execute(query).await?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(|source| GraphError::Query { source })? {
            let edge_type: String = row.get("edge_type").unwrap_or_default();
            let Some(edge_type) = EdgeType::parse(&edge_type) else {
                continue;
            };
            let validation_state: String = row.get("validation_state").unwrap_or_default();
            edges.push(Edge {
                from_uid: row.get("from_uid").unwrap_or_default(),
                to_uid: row.get("to_uid").unwrap_or_default(),
                edge_type,
                confidence: row.get("confidence").unwrap_or_default(),
                base_confidence: row.get("base_confidence").unwrap_or_default(),
                first_observed: row.get("first_observed").unwrap_or_default(),
                last_validated: row.get("last_validated").unwrap_or_default(),
                validation_state: ValidationState::parse(&validation_state),
                endpoints_alive: row.get("endpoints_alive").unwrap_or(true),
            });
        }
        Ok(edges)
    }

    async fn write_update(&self, update: &EdgeUpdate) -> Result<(), GraphError> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let statement = format!(
            "MATCH (a:Resource {{uid: $from}})-[e:{}]->(b:Resource {{uid: $to}}) \
             SET e.confidence = $confidence, e.validationState = $state, e.lastValidated = $now",
            update.edge_type.as_str()
        );
        let query = Query::new(statement)
            .param("from", update.from_uid.as_str())
            .param("to", update.to_uid.as_str())
            .param("confidence", update.confidence)
            .param("state", update.validation_state.as_str())
            .param("now", now);
        self.client.run(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_NS: i64 = 3600 * 1_000_000_000;

    fn edge(base: f64, age_hours: i64, now: i64) -> Edge {
        Edge {
            from_uid: "a".into(),
            to_uid: "b".into(),
            edge_type: EdgeType::Manages,
            confidence: base,
            base_confidence: base,
            first_observed: now - age_hours * HOUR_NS,
            last_validated: 0,
            validation_state: ValidationState::Valid,
            endpoints_alive: true,
        }
    }

    #[test]
    fn decay_at_twelve_hours() {
        assert!((decayed_confidence(0.8, 12 * HOUR_NS) - 0.72).abs() < 1e-9);
    }

    #[test]
    fn decay_at_forty_eight_hours() {
        assert!((decayed_confidence(0.8, 48 * HOUR_NS) - 0.56).abs() < 1e-9);
    }

    #[test]
    fn decay_floors_past_stale_threshold() {
        assert!((decayed_confidence(0.8, 500 * HOUR_NS) - CONFIDENCE_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn explicit_confidence_never_decays() {
        assert_eq!(decayed_confidence(1.0, 48 * HOUR_NS), 1.0);
        assert_eq!(decayed_confidence(1.0, 5000 * HOUR_NS), 1.0);
    }

    #[test]
    fn fresh_edge_is_unchanged() {
        let now = 1_000_000 * HOUR_NS;
        assert_eq!(revalidate_edge(&edge(0.8, 1, now), now), None);
    }

    #[test]
    fn old_edge_with_dead_endpoint_is_invalid() {
        let now = 1_000_000 * HOUR_NS;
        let mut e = edge(0.8, 2, now);
        e.endpoints_alive = false;
        let update = revalidate_edge(&e, now).unwrap();
        assert_eq!(update.validation_state, ValidationState::Invalid);
    }

    #[test]
    fn very_old_edge_goes_stale() {
        let now = 1_000_000 * HOUR_NS;
        let update = revalidate_edge(&edge(0.8, 500, now), now).unwrap();
        assert_eq!(update.validation_state, ValidationState::Stale);
        assert!((update.confidence - CONFIDENCE_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn unchanged_edges_produce_no_writes() {
        let now = 1_000_000 * HOUR_NS;
        // Already decayed to the 12h value and still Valid.
        let mut e = edge(0.8, 12, now);
        e.confidence = 0.72;
        assert_eq!(revalidate_edge(&e, now), None);
    }
}
