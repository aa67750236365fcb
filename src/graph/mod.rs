//! The evidence-backed relationship graph.
//!
//! Nodes and edges live in an external property-graph engine spoken to over
//! Bolt. All writes go through MERGE so the builder is idempotent; readers
//! run concurrently.

use std::sync::Arc;

use neo4rs::{Graph, Query};
use snafu::{ResultExt, Snafu};

pub mod builder;
pub mod extract;
pub mod model;
pub mod namespace_impact;
pub mod reconcile;
pub mod revalidate;
pub mod scoring;
pub mod ttl;

pub use builder::GraphBuilder;
pub use model::{Edge, EdgeType, Evidence, EvidenceType, ValidationState};

#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl GraphConfig {
    pub fn uri(&self) -> String {
        format!("bolt://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Snafu)]
pub enum GraphError {
    #[snafu(display("failed to connect to graph engine at {}: {}", uri, source))]
    Connect { uri: String, source: neo4rs::Error },

    #[snafu(display("graph query failed: {}", source))]
    Query { source: neo4rs::Error },

    #[snafu(display("failed to decode graph row: {}", source))]
    Row { source: neo4rs::DeError },
}

/// Shared handle to the graph engine.
#[derive(Clone)]
pub struct GraphClient {
    graph: Arc<Graph>,
}

impl GraphClient {
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let uri = config.uri();
        info!(message = "connecting to graph engine", %uri);
        let graph = Graph::new(&uri, &config.user, &config.password)
            .await
            .context(ConnectSnafu { uri })?;
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    /// Uniqueness constraints and lookup indexes. Failure here is fatal at
    /// startup: without the uid constraint MERGE semantics break down.
    pub async fn init_schema(&self) -> Result<(), GraphError> {
        let statements = [
            "CREATE CONSTRAINT IF NOT EXISTS FOR (r:Resource) REQUIRE r.uid IS UNIQUE",
            "CREATE CONSTRAINT IF NOT EXISTS FOR (c:Change) REQUIRE c.id IS UNIQUE",
            "CREATE CONSTRAINT IF NOT EXISTS FOR (a:Alert) REQUIRE a.uid IS UNIQUE",
            "CREATE INDEX IF NOT EXISTS FOR (r:Resource) ON (r.kind)",
            "CREATE INDEX IF NOT EXISTS FOR (r:Resource) ON (r.namespace)",
            "CREATE INDEX IF NOT EXISTS FOR (c:Change) ON (c.timestamp)",
        ];
        for statement in statements {
            self.run(Query::new(statement.to_string())).await?;
        }
        info!(message = "graph schema initialized");
        Ok(())
    }

    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await.context(QuerySnafu)
    }

    pub async fn execute(&self, query: Query) -> Result<neo4rs::DetachedRowStream, GraphError> {
        self.graph.execute(query).await.context(QuerySnafu)
    }
}
