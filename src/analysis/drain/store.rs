//! Namespace-partitioned template storage with persistence.
//!
//! Each namespace mines into its own tree behind its own lock, so busy
//! namespaces do not contend. Persistence is a JSON snapshot written with
//! the sibling-temp-then-rename pattern; templates of vanished namespaces
//! are retained until TTL, never purged eagerly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{DrainConfig, DrainTree, ProcessOutcome, Template};

pub const REBALANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Snafu)]
pub enum TemplateStoreError {
    #[snafu(display("failed to read template snapshot {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write template snapshot {}: {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed template snapshot {}: {}", path.display(), source))]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedNamespace {
    templates: Vec<Template>,
    lines_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    namespaces: HashMap<String, PersistedNamespace>,
}

pub struct TemplateStore {
    config: DrainConfig,
    path: Option<PathBuf>,
    trees: RwLock<HashMap<String, Arc<Mutex<DrainTree>>>>,
}

impl TemplateStore {
    pub fn new(config: DrainConfig, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            config,
            path,
            trees: RwLock::new(HashMap::new()),
        })
    }

    /// Loads the persisted snapshot, if one exists.
    pub async fn load(self: &Arc<Self>) -> Result<(), TemplateStoreError> {
        let Some(path) = &self.path else { return Ok(()) };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(TemplateStoreError::Read { path: path.clone(), source }),
        };
        let state: PersistedState =
            serde_json::from_slice(&bytes).context(MalformedSnafu { path: path.clone() })?;

        let mut trees = self.trees.write().await;
        for (namespace, persisted) in state.namespaces {
            let mut tree = DrainTree::new(self.config.clone());
            let count = persisted.templates.len();
            for template in persisted.templates {
                tree.insert_template(template);
            }
            trees.insert(namespace.clone(), Arc::new(Mutex::new(tree)));
            debug!(message = "restored templates", %namespace, templates = count);
        }
        Ok(())
    }

    async fn tree_for(&self, namespace: &str) -> Arc<Mutex<DrainTree>> {
        {
            let trees = self.trees.read().await;
            if let Some(tree) = trees.get(namespace) {
                return Arc::clone(tree);
            }
        }
        let mut trees = self.trees.write().await;
        Arc::clone(
            trees
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(DrainTree::new(self.config.clone())))),
        )
    }

    pub async fn process(&self, namespace: &str, line: &str, now: i64) -> Option<ProcessOutcome> {
        let tree = self.tree_for(namespace).await;
        let mut tree = tree.lock().await;
        tree.process(line, now)
    }

    pub async fn templates(&self, namespace: &str) -> Vec<Template> {
        let tree = {
            let trees = self.trees.read().await;
            trees.get(namespace).cloned()
        };
        match tree {
            Some(tree) => tree.lock().await.templates(),
            None => Vec::new(),
        }
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.trees.read().await.keys().cloned().collect()
    }

    /// Writes the snapshot atomically: sibling temp, fsync, rename.
    pub async fn persist(&self) -> Result<(), TemplateStoreError> {
        let Some(path) = &self.path else { return Ok(()) };

        let mut state = PersistedState::default();
        let trees: Vec<(String, Arc<Mutex<DrainTree>>)> = {
            let trees = self.trees.read().await;
            trees.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };
        for (namespace, tree) in trees {
            let tree = tree.lock().await;
            state.namespaces.insert(
                namespace,
                PersistedNamespace {
                    templates: tree.templates(),
                    lines_seen: tree.lines_seen(),
                },
            );
        }

        let bytes = serde_json::to_vec(&state).expect("template state serializes");
        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
            file.write_all(&bytes)
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
            file.sync_all()
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
        }
        tokio::fs::rename(&tmp, path)
            .await
            .context(WriteSnafu { path: path.clone() })?;
        Ok(())
    }

    /// Periodic rebalance plus persistence.
    pub async fn run_rebalancer(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REBALANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let trees: Vec<Arc<Mutex<DrainTree>>> = {
                let trees = self.trees.read().await;
                trees.values().cloned().collect()
            };
            let mut merged = 0;
            for tree in trees {
                merged += tree.lock().await.rebalance();
            }
            if merged > 0 {
                debug!(message = "template rebalance merged templates", merged);
            }

            if let Err(error) = self.persist().await {
                warn!(message = "template persistence failed", %error);
            }
        }

        // Final snapshot on the way out.
        if let Err(error) = self.persist().await {
            warn!(message = "final template persistence failed", %error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn namespaces_are_partitioned() {
        let store = TemplateStore::new(DrainConfig::default(), None);
        store.process("default", "connected to 10.0.0.1", 1).await;
        store.process("kube-system", "connected to 10.0.0.2", 2).await;

        assert_eq!(store.templates("default").await.len(), 1);
        assert_eq!(store.templates("kube-system").await.len(), 1);
        assert_eq!(store.templates("default").await[0].count, 1);
    }

    #[tokio::test]
    async fn persist_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");

        let store = TemplateStore::new(DrainConfig::default(), Some(path.clone()));
        store.process("default", "connected to 10.0.0.1", 1).await;
        store.process("default", "connected to 10.0.0.2", 2).await;
        store.persist().await.unwrap();

        let restored = TemplateStore::new(DrainConfig::default(), Some(path));
        restored.load().await.unwrap();
        let templates = restored.templates("default").await;
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].count, 2);

        // Mining continues into the restored tree.
        let outcome = restored
            .process("default", "connected to 10.9.9.9", 3)
            .await
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(restored.templates("default").await[0].count, 3);
    }
}
