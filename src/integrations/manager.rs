//! Per-instance integration lifecycle.
//!
//! The manager diffs the declared config against running instances on every
//! (debounced) config-file change: new or newly-enabled instances start,
//! changed ones restart, removed or disabled ones stop. A failed start
//! leaves the instance in a degraded state with its last error surfaced via
//! health, retried on the next reload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::config_store::{ConfigStore, IntegrationInstance};
use super::secrets::{self, SecretWatcher};
use super::{
    factory_for, tool_prefix, HealthStatus, Integration, IntegrationContext, IntegrationError,
};

pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Degraded,
    Stopped,
}

/// Health snapshot for one instance, as served over the API and SSE.
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub enabled: bool,
    pub state: InstanceState,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct RunningInstance {
    declared: IntegrationInstance,
    integration: Option<Arc<dyn Integration>>,
    state: InstanceState,
    last_error: Option<String>,
    secret_refs: HashSet<String>,
}

pub struct IntegrationManager {
    store: ConfigStore,
    context: IntegrationContext,
    instances: Mutex<HashMap<String, RunningInstance>>,
    health_tx: broadcast::Sender<Vec<HealthSnapshot>>,
    secret_watcher: SecretWatcher,
}

impl IntegrationManager {
    pub fn new(store: ConfigStore, context: IntegrationContext) -> Arc<Self> {
        let (health_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            store,
            context,
            instances: Mutex::new(HashMap::new()),
            health_tx,
            secret_watcher: SecretWatcher::new(),
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<Vec<HealthSnapshot>> {
        self.health_tx.subscribe()
    }

    /// Applies the on-disk config: the start/restart/stop diff.
    pub async fn apply(&self) -> Result<(), IntegrationError> {
        let desired = match self.store.load().await {
            Ok(file) => file.integrations,
            Err(error) => {
                error!(message = "cannot load integrations config", %error);
                return Ok(());
            }
        };
        let desired_by_name: HashMap<String, IntegrationInstance> = desired
            .into_iter()
            .map(|instance| (instance.name.clone(), instance))
            .collect();

        let mut instances = self.instances.lock().await;

        // Stop removed instances.
        let removed: Vec<String> = instances
            .keys()
            .filter(|name| !desired_by_name.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(running) = instances.remove(&name) {
                info!(message = "stopping removed integration", instance = %name);
                self.stop_instance(&name, running).await;
            }
        }

        for (name, declared) in desired_by_name {
            match instances.get(&name) {
                Some(running) if running.declared == declared => {
                    // Unchanged; retry degraded instances.
                    if running.state == InstanceState::Degraded && declared.enabled {
                        debug!(message = "retrying degraded integration", instance = %name);
                        let running = instances.remove(&name).expect("instance present");
                        self.stop_instance(&name, running).await;
                        let started = self.start_instance(declared).await;
                        instances.insert(name, started);
                    }
                }
                Some(_) => {
                    info!(message = "restarting changed integration", instance = %name);
                    let running = instances.remove(&name).expect("instance present");
                    self.stop_instance(&name, running).await;
                    let started = self.start_instance(declared).await;
                    instances.insert(name, started);
                }
                None => {
                    let started = self.start_instance(declared).await;
                    instances.insert(name, started);
                }
            }
        }

        drop(instances);
        self.broadcast_health().await;
        Ok(())
    }

    async fn start_instance(&self, declared: IntegrationInstance) -> RunningInstance {
        let secret_refs = secrets::referenced_secrets(&declared.config);

        if !declared.enabled {
            return RunningInstance {
                declared,
                integration: None,
                state: InstanceState::Stopped,
                last_error: None,
                secret_refs,
            };
        }

        info!(message = "starting integration", instance = %declared.name, integration_type = %declared.type_name);
        match self.build_and_start(&declared).await {
            Ok(integration) => RunningInstance {
                declared,
                integration: Some(integration),
                state: InstanceState::Running,
                last_error: None,
                secret_refs,
            },
            Err(error) => {
                error!(message = "integration failed to start", instance = %declared.name, %error);
                RunningInstance {
                    declared,
                    integration: None,
                    state: InstanceState::Degraded,
                    last_error: Some(error.to_string()),
                    secret_refs,
                }
            }
        }
    }

    async fn build_and_start(
        &self,
        declared: &IntegrationInstance,
    ) -> Result<Arc<dyn Integration>, IntegrationError> {
        let factory =
            factory_for(&declared.type_name).ok_or_else(|| IntegrationError::UnknownType {
                type_name: declared.type_name.clone(),
            })?;

        let resolved = secrets::resolve(
            self.context.kube.as_ref(),
            &self.context.secrets_namespace,
            &declared.config,
        )
        .await
        .map_err(|error| IntegrationError::SecretResolution {
            name: declared.name.clone(),
            reason: error.to_string(),
        })?;

        let integration = factory.build(&declared.name, &resolved, self.context.clone())?;
        integration.start().await?;
        integration.register_tools(&self.context.tools);
        Ok(integration)
    }

    async fn stop_instance(&self, name: &str, running: RunningInstance) {
        if let Some(integration) = running.integration {
            integration.stop().await;
            self.context
                .tools
                .deregister_prefix(&tool_prefix(integration.config_type(), name));
        }
    }

    /// Stops everything. Used at shutdown.
    pub async fn stop_all(&self) {
        let mut instances = self.instances.lock().await;
        for (name, running) in instances.drain() {
            self.stop_instance(&name, running).await;
        }
    }

    pub async fn health_snapshots(&self) -> Vec<HealthSnapshot> {
        let instances = self.instances.lock().await;
        let mut snapshots = Vec::with_capacity(instances.len());
        for (name, running) in instances.iter() {
            let health = match (&running.integration, running.state) {
                (Some(integration), _) => integration.health().await,
                (None, InstanceState::Degraded) => super::IntegrationHealth::down(
                    running.last_error.clone().unwrap_or_default(),
                ),
                (None, _) => super::IntegrationHealth {
                    status: HealthStatus::Down,
                    message: None,
                },
            };
            snapshots.push(HealthSnapshot {
                name: name.clone(),
                type_name: running.declared.type_name.clone(),
                enabled: running.declared.enabled,
                state: running.state,
                health: health.status,
                message: health.message,
                last_error: running.last_error.clone(),
            });
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    async fn broadcast_health(&self) {
        let snapshots = self.health_snapshots().await;
        let _ = self.health_tx.send(snapshots);
    }

    /// Validates a config by building and briefly starting a transient
    /// instance. Panics and hangs are contained: the run is spawned and
    /// bounded by [`TEST_TIMEOUT`].
    pub async fn test_instance(&self, declared: IntegrationInstance) -> (bool, String) {
        let manager_context = self.context.clone();

        let attempt = tokio::spawn(async move {
            let factory = factory_for(&declared.type_name).ok_or_else(|| {
                IntegrationError::UnknownType {
                    type_name: declared.type_name.clone(),
                }
            })?;
            let resolved = {
                let namespace = manager_context.secrets_namespace.clone();
                secrets::resolve(manager_context.kube.as_ref(), &namespace, &declared.config).await
            }
                    .map_err(|error| IntegrationError::SecretResolution {
                        name: declared.name.clone(),
                        reason: error.to_string(),
                    })?;
            let integration = factory.build(&declared.name, &resolved, manager_context)?;
            integration.start().await?;
            integration.stop().await;
            Ok::<(), IntegrationError>(())
        });

        match tokio::time::timeout(TEST_TIMEOUT, attempt).await {
            Ok(Ok(Ok(()))) => (true, "connection test succeeded".to_string()),
            Ok(Ok(Err(error))) => (false, error.to_string()),
            Ok(Err(join_error)) => (false, format!("test crashed: {join_error}")),
            Err(_) => (false, format!("test timed out after {TEST_TIMEOUT:?}")),
        }
    }

    /// Runs the manager: initial apply, then debounced file-watch reloads,
    /// secret rotation, and periodic health broadcasts.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(error) = self.apply().await {
            error!(message = "initial integration apply failed", %error);
        }

        // Bridge the notify watcher into the async world. The watcher must
        // stay alive for the lifetime of the task.
        let (change_tx, mut change_rx) = tokio::sync::mpsc::channel::<()>(16);
        let watch_target = self
            .store
            .path()
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| self.store.path().clone());
        let _watcher = {
            let change_tx = change_tx.clone();
            let mut watcher = match notify::recommended_watcher(
                move |result: Result<notify::Event, notify::Error>| {
                    if result.is_ok() {
                        let _ = change_tx.blocking_send(());
                    }
                },
            ) {
                Ok(watcher) => watcher,
                Err(error) => {
                    error!(message = "cannot create integrations config watcher", %error);
                    return;
                }
            };
            if let Err(error) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
                error!(message = "cannot watch integrations config", %error);
            }
            watcher
        };

        // Secret rotation.
        let mut secret_rx = self.secret_watcher.subscribe();
        if let Some(client) = self.context.kube.clone() {
            let namespace = self.context.secrets_namespace.clone();
            let watcher_cancel = cancel.clone();
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager
                    .secret_watcher
                    .run(client, namespace, watcher_cancel)
                    .await;
            });
        }

        let mut health_ticker = tokio::time::interval(HEALTH_INTERVAL);
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = change_rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    // Debounce: absorb the burst of events one save produces.
                    tokio::time::sleep(RELOAD_DEBOUNCE).await;
                    while change_rx.try_recv().is_ok() {}
                    info!(message = "integrations config changed, applying");
                    if let Err(error) = self.apply().await {
                        error!(message = "integration apply failed", %error);
                    }
                }
                secret = secret_rx.recv() => {
                    if let Ok(secret) = secret {
                        self.rotate_for_secret(&secret).await;
                    }
                }
                _ = health_ticker.tick() => {
                    self.broadcast_health().await;
                }
            }
        }

        self.stop_all().await;
    }

    async fn rotate_for_secret(&self, secret: &str) {
        let instances = self.instances.lock().await;
        for (name, running) in instances.iter() {
            if !running.secret_refs.contains(secret) {
                continue;
            }
            let Some(integration) = &running.integration else {
                continue;
            };
            info!(message = "rotating integration credentials", instance = %name, secret = %secret);
            if let Err(error) = integration.rotate_secrets(&self.context).await {
                warn!(message = "credential rotation failed", instance = %name, %error);
            }
        }
    }
}
