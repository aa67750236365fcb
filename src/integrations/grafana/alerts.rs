//! Alert rule and alert state synchronization into the graph.
//!
//! State sync is deduplicated: a STATE_TRANSITION edge is written only when
//! the aggregated state actually changed since the last successful sync.
//! For stable alerts this drops nearly every sample. `last_synced_at`
//! advances on every successful sync, changed or not, and is left untouched
//! when the API call fails so staleness is detectable.

use chrono::Utc;
use neo4rs::Query;

use super::client::{AlertState, AlertStateRecord, GrafanaClient};
use crate::graph::model::CHANGE_TTL_NS;
use crate::graph::{GraphClient, GraphError};

/// Worst-state aggregation across alert instances.
pub fn aggregate_worst(states: &[AlertState]) -> AlertState {
    states.iter().copied().max().unwrap_or(AlertState::Normal)
}

/// Whether a transition edge must be recorded. The first observation of an
/// alert stores its state without an edge; consecutive equal samples store
/// nothing.
pub fn plan_transition(
    last: Option<AlertState>,
    current: AlertState,
) -> Option<(AlertState, AlertState)> {
    match last {
        Some(last) if last != current => Some((last, current)),
        _ => None,
    }
}

pub struct AlertSyncer {
    graph: GraphClient,
}

impl AlertSyncer {
    pub fn new(graph: GraphClient) -> Self {
        Self { graph }
    }

    /// Mirrors rule definitions as Alert nodes.
    pub async fn sync_rules(&self, client: &GrafanaClient) -> Result<usize, GraphError> {
        let rules = match client.alert_rules().await {
            Ok(rules) => rules,
            Err(error) => {
                warn!(message = "alert rule fetch failed", %error);
                return Ok(0);
            }
        };

        let count = rules.len();
        for rule in rules {
            let query = Query::new(
                "MERGE (a:Alert {uid: $uid}) \
                 SET a.title = $title, a.folderUid = $folder, a.ruleGroup = $group"
                    .to_string(),
            )
            .param("uid", rule.uid.as_str())
            .param("title", rule.title.as_str())
            .param("folder", rule.folder_uid.clone().unwrap_or_default())
            .param("group", rule.rule_group.clone().unwrap_or_default());
            self.graph.run(query).await?;
        }
        debug!(message = "alert rules synced", count);
        Ok(count)
    }

    /// One state sync pass. Returns the number of transition edges written.
    pub async fn sync_states(&self, client: &GrafanaClient) -> Result<usize, GraphError> {
        // An API failure must leave last_synced_at untouched, so bail before
        // any write.
        let records = match client.alert_states().await {
            Ok(records) => records,
            Err(error) => {
                warn!(message = "alert state fetch failed, skipping sync", %error);
                return Ok(0);
            }
        };

        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut transitions = 0usize;
        for record in records {
            transitions += self.sync_one(&record, now).await? as usize;
        }
        debug!(message = "alert states synced", transitions);
        Ok(transitions)
    }

    async fn sync_one(&self, record: &AlertStateRecord, now: i64) -> Result<bool, GraphError> {
        let current = aggregate_worst(&record.instance_states);
        let last = self.last_state(&record.key).await?;
        let transition = plan_transition(last, current);

        if let Some((from, to)) = transition {
            let query = Query::new(
                "MERGE (a:Alert {uid: $uid}) \
                 CREATE (a)-[e:STATE_TRANSITION]->(a) \
                 SET e.from_state = $from, e.to_state = $to, \
                     e.timestamp = $now, e.expires_at = $expires"
                    .to_string(),
            )
            .param("uid", record.key.as_str())
            .param("from", from.as_str())
            .param("to", to.as_str())
            .param("now", now)
            .param("expires", now + CHANGE_TTL_NS);
            self.graph.run(query).await?;
            info!(
                message = "alert state transition",
                alert = %record.name,
                from = from.as_str(),
                to = to.as_str(),
            );
        }

        // Success path: state and sync watermark always advance.
        let query = Query::new(
            "MERGE (a:Alert {uid: $uid}) \
             ON CREATE SET a.firstSeen = $now \
             SET a.name = $name, a.currentState = $state, a.last_synced_at = $now"
                .to_string(),
        )
        .param("uid", record.key.as_str())
        .param("name", record.name.as_str())
        .param("state", current.as_str())
        .param("now", now);
        self.graph.run(query).await?;

        Ok(transition.is_some())
    }

    async fn last_state(&self, key: &str) -> Result<Option<AlertState>, GraphError> {
        let query = Query::new(
            "MATCH (a:Alert {uid: $uid}) RETURN a.currentState AS state".to_string(),
        )
        .param("uid", key);
        let mut rows = self.graph.execute(query).await?;
        match rows.next().await.map_err(|source| GraphError::Query { source })? {
            Some(row) => {
                let state: Option<String> = row.get("state").ok();
                Ok(state.map(|s| AlertState::parse(&s)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_state_wins() {
        use AlertState::*;
        assert_eq!(aggregate_worst(&[Normal, Pending, Firing]), Firing);
        assert_eq!(aggregate_worst(&[Normal, Pending]), Pending);
        assert_eq!(aggregate_worst(&[Normal]), Normal);
        assert_eq!(aggregate_worst(&[]), Normal);
    }

    #[test]
    fn dedup_sequence_produces_two_transitions() {
        use AlertState::*;
        // Samples: normal, firing, firing, normal.
        let samples = [Normal, Firing, Firing, Normal];

        let mut last: Option<AlertState> = None;
        let mut transitions = Vec::new();
        for sample in samples {
            if let Some(t) = plan_transition(last, sample) {
                transitions.push(t);
            }
            last = Some(sample);
        }

        assert_eq!(transitions, vec![(Normal, Firing), (Firing, Normal)]);
    }

    #[test]
    fn first_observation_writes_no_edge() {
        assert_eq!(plan_transition(None, AlertState::Firing), None);
    }

    #[test]
    fn unchanged_state_writes_no_edge() {
        assert_eq!(
            plan_transition(Some(AlertState::Firing), AlertState::Firing),
            None
        );
    }
}
