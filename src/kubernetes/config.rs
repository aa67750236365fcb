//! Declarative watch configuration with hash-based hot reload.
//!
//! The config file is polled on a fixed cadence and re-applied only when its
//! SHA-256 changes, so touching the file without editing it is free.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use super::fleet::WatcherFleet;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One resource to watch. `namespace` of `""` means all namespaces;
/// cluster-scoped resources ignore it entirely.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
}

impl WatchSpec {
    pub fn gvr(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub resources: Vec<WatchSpec>,
}

#[derive(Debug, Snafu)]
pub enum WatchConfigError {
    #[snafu(display("failed to read watch config {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse watch config {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

pub fn parse(path: &Path, bytes: &[u8]) -> Result<WatchConfig, WatchConfigError> {
    serde_yaml::from_slice(bytes).context(ParseSnafu { path: path.to_path_buf() })
}

pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Polls the config file and reconciles the fleet on content changes.
///
/// The first successful reconciliation marks the fleet ready.
pub async fn run_config_poller(
    path: PathBuf,
    fleet: Arc<WatcherFleet>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_hash: Option<[u8; 32]> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(message = "watch config unreadable", path = %path.display(), %error);
                continue;
            }
        };
        let hash = content_hash(&bytes);
        if last_hash == Some(hash) {
            continue;
        }

        match parse(&path, &bytes) {
            Ok(config) => {
                info!(
                    message = "watch config changed, reconciling",
                    path = %path.display(),
                    resources = config.resources.len(),
                );
                fleet.reconcile(&config).await;
                last_hash = Some(hash);
            }
            Err(error) => {
                // A broken config keeps the previous generation running.
                error!(message = "ignoring invalid watch config", %error);
                last_hash = Some(hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_spec_list() {
        let yaml = br#"
resources:
  - version: v1
    kind: Pod
    resource: pods
  - group: apps
    version: v1
    kind: Deployment
    resource: deployments
    namespace: prod
"#;
        let config = parse(Path::new("test.yaml"), yaml).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].gvr(), "v1/pods");
        assert_eq!(config.resources[0].namespace, "");
        assert_eq!(config.resources[1].gvr(), "apps/v1/deployments");
        assert_eq!(config.resources[1].namespace, "prod");
    }

    #[test]
    fn hash_is_content_sensitive() {
        let a = content_hash(b"resources: []");
        let b = content_hash(b"resources: []");
        let c = content_hash(b"resources: [x]");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
