//! The integration framework: external data sources behind a uniform
//! lifecycle.
//!
//! Integration types self-register a factory at link time; instances are
//! declared in a YAML config file and managed by the [`manager`]. No dynamic
//! loading.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use snafu::Snafu;

pub mod config_store;
pub mod grafana;
pub mod logzio;
pub mod manager;
pub mod secrets;
pub mod victorialogs;

use crate::analysis::drain::store::TemplateStore;
use crate::analysis::BaselineCache;
use crate::graph::GraphClient;
use crate::tools::ToolRegistry;

#[derive(Debug, Snafu)]
pub enum IntegrationError {
    #[snafu(display("unknown integration type: {}", type_name))]
    UnknownType { type_name: String },

    #[snafu(display("invalid config for {}: {}", name, reason))]
    InvalidConfig { name: String, reason: String },

    #[snafu(display("secret resolution failed for {}: {}", name, reason))]
    SecretResolution { name: String, reason: String },

    #[snafu(display("integration {} failed to start: {}", name, reason))]
    StartFailed { name: String, reason: String },
}

/// Health as surfaced over the API and the SSE stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

#[derive(Clone, Debug, Serialize)]
pub struct IntegrationHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IntegrationHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Down,
            message: Some(message.into()),
        }
    }
}

/// Dependencies handed to factories when building instances.
#[derive(Clone)]
pub struct IntegrationContext {
    pub kube: Option<kube::Client>,
    pub graph: GraphClient,
    pub templates: Arc<TemplateStore>,
    pub baselines: Arc<BaselineCache>,
    pub tools: Arc<ToolRegistry>,
    /// Namespace Secret references resolve from.
    pub secrets_namespace: String,
}

/// The uniform integration lifecycle.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Starts background work (sync loops, connection checks). Must be safe
    /// to call after a failed previous start.
    async fn start(&self) -> Result<(), IntegrationError>;

    /// Stops background work and releases connections. Idempotent.
    async fn stop(&self);

    async fn health(&self) -> IntegrationHealth;

    /// Registers this instance's tools. Tool names are prefixed
    /// `{type}_{instance}_` so instances never collide.
    fn register_tools(&self, registry: &ToolRegistry);

    fn config_type(&self) -> &'static str;

    /// Re-resolves credentials from current Secret contents, in place.
    async fn rotate_secrets(&self, _context: &IntegrationContext) -> Result<(), IntegrationError> {
        Ok(())
    }
}

pub trait IntegrationFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn build(
        &self,
        name: &str,
        config: &serde_json::Value,
        context: IntegrationContext,
    ) -> Result<Arc<dyn Integration>, IntegrationError>;
}

/// Link-time factory registration.
pub struct FactoryEntry {
    pub type_name: &'static str,
    pub build: fn() -> Box<dyn IntegrationFactory>,
}

inventory::collect!(FactoryEntry);

pub fn factory_for(type_name: &str) -> Option<Box<dyn IntegrationFactory>> {
    inventory::iter::<FactoryEntry>
        .into_iter()
        .find(|entry| entry.type_name == type_name)
        .map(|entry| (entry.build)())
}

pub fn registered_types() -> Vec<&'static str> {
    let mut types: Vec<&'static str> = inventory::iter::<FactoryEntry>
        .into_iter()
        .map(|entry| entry.type_name)
        .collect();
    types.sort_unstable();
    types
}

/// Standard prefix for an instance's tool names.
pub fn tool_prefix(type_name: &str, instance: &str) -> String {
    format!("{type_name}_{instance}_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_factories_are_registered() {
        let types = registered_types();
        assert!(types.contains(&"victorialogs"));
        assert!(types.contains(&"grafana"));
        assert!(types.contains(&"logzio"));
    }

    #[test]
    fn unknown_type_has_no_factory() {
        assert!(factory_for("definitely-not-a-type").is_none());
    }

    #[test]
    fn tool_prefix_shape() {
        assert_eq!(tool_prefix("victorialogs", "prod"), "victorialogs_prod_");
    }
}
