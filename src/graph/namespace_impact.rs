//! Namespace impact detection with debounced broadcast.
//!
//! Incoming event batches mark namespaces dirty; dirty sets are coalesced in
//! a five second window and broadcast to cache-invalidation subscribers.
//! Cluster-scoped resources resolve their related namespaces through the
//! graph (a Node change dirties the namespaces of Pods scheduled on it).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use neo4rs::Query;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{GraphClient, GraphError};
use crate::event::Event;
use crate::pipeline::EventSink;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 64;

pub struct NamespaceImpactDetector {
    client: GraphClient,
    dirty: Mutex<HashSet<String>>,
    tx: broadcast::Sender<Vec<String>>,
}

impl NamespaceImpactDetector {
    pub fn new(client: GraphClient) -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            client,
            dirty: Mutex::new(HashSet::new()),
            tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    fn mark(&self, namespace: String) {
        self.dirty.lock().expect("dirty set poisoned").insert(namespace);
    }

    /// Namespaces related to a cluster-scoped resource, found through the
    /// graph: anything scheduled on or referencing it.
    async fn related_namespaces(&self, uid: &str) -> Result<Vec<String>, GraphError> {
        let query = Query::new(
            "MATCH (r:Resource {uid: $uid})<-[:SCHEDULED_ON|REFERENCES_SPEC|BOUND_TO]-(other:Resource) \
             WHERE other.namespace IS NOT NULL AND other.namespace <> '' \
             RETURN DISTINCT other.namespace AS namespace"
                .to_string(),
        )
        .param("uid", uid);

        let mut rows = self.client.execute(query).await?;
        let mut namespaces = Vec::new();
        while let Some(row) = rows.next().await.map_err(|source| GraphError::Query { source })? {
            let ns: String = row.get("namespace").unwrap_or_default();
            if !ns.is_empty() {
                namespaces.push(ns);
            }
        }
        Ok(namespaces)
    }

    /// Flushes the dirty set on the debounce cadence.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(DEBOUNCE_WINDOW);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let batch: Vec<String> = {
                let mut dirty = self.dirty.lock().expect("dirty set poisoned");
                if dirty.is_empty() {
                    continue;
                }
                dirty.drain().collect()
            };
            debug!(message = "broadcasting dirty namespaces", count = batch.len());
            // No subscribers is fine; the send just drops.
            let _ = self.tx.send(batch);
        }
    }
}

#[async_trait]
impl EventSink for NamespaceImpactDetector {
    async fn accept(&self, events: &[Event]) {
        for event in events {
            match &event.identity.namespace {
                Some(namespace) => self.mark(namespace.clone()),
                None => match self.related_namespaces(&event.identity.uid).await {
                    Ok(namespaces) => {
                        for ns in namespaces {
                            self.mark(ns);
                        }
                    }
                    Err(error) => {
                        trace!(message = "related-namespace lookup failed", %error);
                    }
                },
            }
        }
    }
}
