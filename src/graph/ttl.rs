//! TTL cleanup of change nodes and expired state-transition edges.

use std::time::Duration;

use chrono::Utc;
use neo4rs::Query;
use tokio_util::sync::CancellationToken;

use super::model::CHANGE_TTL_NS;
use super::{GraphClient, GraphError};

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const DELETE_BATCH: i64 = 5000;

pub struct TtlCleaner {
    client: GraphClient,
}

impl TtlCleaner {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.pass().await {
                warn!(message = "ttl cleanup pass failed", %error);
            }
        }
    }

    pub async fn pass(&self) -> Result<(), GraphError> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let change_cutoff = now - CHANGE_TTL_NS;

        let changes = self
            .delete_batched(
                "MATCH (c:Change) WHERE c.timestamp < $cutoff \
                 WITH c LIMIT $batch DETACH DELETE c RETURN count(*) AS deleted",
                change_cutoff,
            )
            .await?;

        let transitions = self
            .delete_batched(
                "MATCH ()-[e:STATE_TRANSITION]->() WHERE e.expires_at < $cutoff \
                 WITH e LIMIT $batch DELETE e RETURN count(*) AS deleted",
                now,
            )
            .await?;

        if changes > 0 || transitions > 0 {
            info!(
                message = "ttl cleanup complete",
                changes_deleted = changes,
                transitions_deleted = transitions,
            );
        }
        Ok(())
    }

    async fn delete_batched(&self, statement: &str, cutoff: i64) -> Result<u64, GraphError> {
        let mut total = 0u64;
        loop {
            let query = Query::new(statement.to_string())
                .param("cutoff", cutoff)
                .param("batch", DELETE_BATCH);
            let mut rows = self.client.execute(query).await?;
            let deleted: i64 = match rows
                .next()
                .await
                .map_err(|source| GraphError::Query { source })?
            {
                Some(row) => row.get("deleted").unwrap_or_default(),
                None => 0,
            };
            total += deleted.max(0) as u64;
            if deleted < DELETE_BATCH {
                break;
            }
        }
        Ok(total)
    }
}
