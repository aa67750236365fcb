//! Kubernetes Secret references in integration configs.
//!
//! Any JSON object of exactly `{secretName, key}` inside a config blob is a
//! reference; resolution replaces it with the secret's value. A watcher
//! broadcasts material changes so credentials rotate in place, without an
//! instance restart.

use std::collections::{HashMap, HashSet};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::Snafu;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum SecretError {
    #[snafu(display("secret {} not found", name))]
    NotFound { name: String },

    #[snafu(display("secret {} has no key {}", name, key))]
    MissingKey { name: String, key: String },

    #[snafu(display("secret lookup failed: {}", source))]
    Lookup { source: kube::Error },

    #[snafu(display("no Kubernetes client available for secret references"))]
    NoClient,
}

/// A `{secretName, key}` object, when that is all the object contains.
pub fn as_secret_ref(value: &Value) -> Option<(&str, &str)> {
    let object = value.as_object()?;
    if object.len() != 2 {
        return None;
    }
    let name = object.get("secretName")?.as_str()?;
    let key = object.get("key")?.as_str()?;
    Some((name, key))
}

/// Secret names referenced anywhere in a config blob.
pub fn referenced_secrets(config: &Value) -> HashSet<String> {
    let mut names = HashSet::new();
    walk(config, &mut |value| {
        if let Some((name, _)) = as_secret_ref(value) {
            names.insert(name.to_string());
        }
    });
    names
}

fn walk(value: &Value, visit: &mut impl FnMut(&Value)) {
    visit(value);
    match value {
        Value::Object(map) => {
            for child in map.values() {
                walk(child, visit);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, visit);
            }
        }
        _ => {}
    }
}

/// Replaces every secret reference in `config` with the referenced value.
pub async fn resolve(
    client: Option<&Client>,
    namespace: &str,
    config: &Value,
) -> Result<Value, SecretError> {
    if referenced_secrets(config).is_empty() {
        return Ok(config.clone());
    }
    let client = client.ok_or(SecretError::NoClient)?;
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let mut cache: HashMap<String, Secret> = HashMap::new();
    resolve_value(&api, &mut cache, config).await
}

async fn resolve_value(
    api: &Api<Secret>,
    cache: &mut HashMap<String, Secret>,
    value: &Value,
) -> Result<Value, SecretError> {
    if let Some((name, key)) = as_secret_ref(value) {
        let secret = match cache.get(name) {
            Some(secret) => secret.clone(),
            None => {
                let secret = api.get(name).await.map_err(|source| {
                    let missing =
                        matches!(&source, kube::Error::Api(response) if response.code == 404);
                    if missing {
                        SecretError::NotFound { name: name.into() }
                    } else {
                        SecretError::Lookup { source }
                    }
                })?;
                cache.insert(name.to_string(), secret.clone());
                secret
            }
        };
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).to_string())
            .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).cloned());
        return match data {
            Some(resolved) => Ok(Value::String(resolved)),
            None => Err(SecretError::MissingKey {
                name: name.into(),
                key: key.into(),
            }),
        };
    }

    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), Box::pin(resolve_value(api, cache, v)).await?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(resolve_value(api, cache, item)).await?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn secret_fingerprint(secret: &Secret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update(&value.0);
        }
    }
    hasher.finalize().into()
}

/// Watches Secrets in one namespace and broadcasts the names of those whose
/// data materially changed.
pub struct SecretWatcher {
    tx: broadcast::Sender<String>,
}

impl SecretWatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub async fn run(&self, client: Client, namespace: String, cancel: CancellationToken) {
        let api: Api<Secret> = Api::namespaced(client, &namespace);
        let mut fingerprints: HashMap<String, [u8; 32]> = HashMap::new();
        let mut backoff = std::time::Duration::from_millis(500);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.watch_cycle(&api, &mut fingerprints, &cancel).await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(message = "secret watch stream closed, restarting");
                }
                Err(error) => {
                    warn!(message = "secret watch failed, backing off", %error);
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(std::time::Duration::from_secs(5));
        }
    }

    /// Returns `Ok(true)` on cancellation, `Ok(false)` when the stream
    /// closed and a new cycle should start.
    async fn watch_cycle(
        &self,
        api: &Api<Secret>,
        fingerprints: &mut HashMap<String, [u8; 32]>,
        cancel: &CancellationToken,
    ) -> Result<bool, kube::Error> {
        let list = api.list(&ListParams::default()).await?;
        for secret in &list.items {
            if let Some(name) = &secret.metadata.name {
                fingerprints.insert(name.clone(), secret_fingerprint(secret));
            }
        }
        let resource_version = list.metadata.resource_version.unwrap_or_default();

        let mut stream = api
            .watch(&WatchParams::default(), &resource_version)
            .await?
            .boxed();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                next = stream.try_next() => next?,
            };
            let Some(event) = next else {
                return Ok(false);
            };
            let secret = match event {
                WatchEvent::Added(secret) | WatchEvent::Modified(secret) => secret,
                WatchEvent::Deleted(secret) => {
                    if let Some(name) = &secret.metadata.name {
                        fingerprints.remove(name);
                    }
                    continue;
                }
                WatchEvent::Bookmark(_) => continue,
                WatchEvent::Error(status) => return Err(kube::Error::Api(status)),
            };
            let Some(name) = secret.metadata.name.clone() else {
                continue;
            };
            let fingerprint = secret_fingerprint(&secret);
            let changed = fingerprints
                .insert(name.clone(), fingerprint)
                .map(|old| old != fingerprint)
                .unwrap_or(true);
            if changed {
                info!(message = "secret changed, notifying subscribers", secret = %name);
                let _ = self.tx.send(name);
            }
        }
    }
}

impl Default for SecretWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_ref_shape_is_exact() {
        assert!(as_secret_ref(&json!({"secretName": "s", "key": "k"})).is_some());
        assert!(as_secret_ref(&json!({"secretName": "s"})).is_none());
        assert!(as_secret_ref(&json!({"secretName": "s", "key": "k", "extra": 1})).is_none());
        assert!(as_secret_ref(&json!("plain")).is_none());
    }

    #[test]
    fn referenced_secrets_are_collected_recursively() {
        let config = json!({
            "url": "http://grafana",
            "auth": {"token": {"secretName": "grafana-token", "key": "token"}},
            "extra": [{"secretName": "other", "key": "password"}]
        });
        let names = referenced_secrets(&config);
        assert_eq!(names.len(), 2);
        assert!(names.contains("grafana-token"));
        assert!(names.contains("other"));
    }

    #[tokio::test]
    async fn config_without_refs_resolves_without_client() {
        let config = json!({"url": "http://vl:9428"});
        let resolved = resolve(None, "default", &config).await.unwrap();
        assert_eq!(resolved, config);
    }

    #[tokio::test]
    async fn config_with_refs_requires_client() {
        let config = json!({"token": {"secretName": "s", "key": "k"}});
        assert!(matches!(
            resolve(None, "default", &config).await,
            Err(SecretError::NoClient)
        ));
    }
}
