//! The integration instance config file.
//!
//! A single YAML document lists instances. All writes go through the atomic
//! path: serialize to a sibling temp file, fsync, rename. Readers therefore
//! never observe a half-written file, and the file watcher fires exactly
//! once per logical change.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Snafu)]
pub enum ConfigStoreError {
    #[snafu(display("failed to read integrations config {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write integrations config {}: {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed integrations config {}: {}", path.display(), source))]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("no integration named {}", name))]
    NotFound { name: String },

    #[snafu(display("integration {} already exists", name))]
    AlreadyExists { name: String },
}

fn default_enabled() -> bool {
    true
}

/// One configured integration instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationInstance {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Type-specific configuration blob. Values may reference Kubernetes
    /// Secrets as `{secretName, key}` objects.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationsFile {
    #[serde(default)]
    pub integrations: Vec<IntegrationInstance>,
}

/// Reader/writer for the config file.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// A missing file is an empty config, not an error.
    pub async fn load(&self) -> Result<IntegrationsFile, ConfigStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IntegrationsFile::default())
            }
            Err(source) => {
                return Err(ConfigStoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_yaml::from_slice(&bytes).context(MalformedSnafu {
            path: self.path.clone(),
        })
    }

    /// Atomic write: sibling temp, fsync, rename.
    pub async fn save(&self, file: &IntegrationsFile) -> Result<(), ConfigStoreError> {
        let yaml = serde_yaml::to_string(file).map_err(|source| ConfigStoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.context(WriteSnafu {
                path: self.path.clone(),
            })?;
        }

        let tmp = self.path.with_extension("yaml.tmp");
        {
            let mut handle = tokio::fs::File::create(&tmp)
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
            handle
                .write_all(yaml.as_bytes())
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
            handle
                .sync_all()
                .await
                .context(WriteSnafu { path: tmp.clone() })?;
        }
        tokio::fs::rename(&tmp, &self.path).await.context(WriteSnafu {
            path: self.path.clone(),
        })
    }

    pub async fn get(&self, name: &str) -> Result<IntegrationInstance, ConfigStoreError> {
        self.load()
            .await?
            .integrations
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| ConfigStoreError::NotFound { name: name.into() })
    }

    pub async fn create(&self, instance: IntegrationInstance) -> Result<(), ConfigStoreError> {
        let mut file = self.load().await?;
        if file.integrations.iter().any(|i| i.name == instance.name) {
            return Err(ConfigStoreError::AlreadyExists {
                name: instance.name,
            });
        }
        file.integrations.push(instance);
        self.save(&file).await
    }

    pub async fn update(&self, instance: IntegrationInstance) -> Result<(), ConfigStoreError> {
        let mut file = self.load().await?;
        let slot = file
            .integrations
            .iter_mut()
            .find(|i| i.name == instance.name)
            .ok_or_else(|| ConfigStoreError::NotFound {
                name: instance.name.clone(),
            })?;
        *slot = instance;
        self.save(&file).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), ConfigStoreError> {
        let mut file = self.load().await?;
        let before = file.integrations.len();
        file.integrations.retain(|i| i.name != name);
        if file.integrations.len() == before {
            return Err(ConfigStoreError::NotFound { name: name.into() });
        }
        self.save(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn instance(name: &str) -> IntegrationInstance {
        IntegrationInstance {
            name: name.into(),
            type_name: "victorialogs".into(),
            enabled: true,
            config: json!({"url": "http://vl:9428"}),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("integrations.yaml"));
        assert!(store.load().await.unwrap().integrations.is_empty());
    }

    #[tokio::test]
    async fn crud_round_trip_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("integrations.yaml"));

        store.create(instance("prod")).await.unwrap();
        let loaded = store.get("prod").await.unwrap();
        assert_eq!(loaded, instance("prod"));

        let mut changed = instance("prod");
        changed.enabled = false;
        changed.config = json!({"url": "http://other:9428", "tenant": 7});
        store.update(changed.clone()).await.unwrap();
        assert_eq!(store.get("prod").await.unwrap(), changed);

        store.delete("prod").await.unwrap();
        assert!(matches!(
            store.get("prod").await,
            Err(ConfigStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("integrations.yaml"));
        store.create(instance("a")).await.unwrap();
        assert!(matches!(
            store.create(instance("a")).await,
            Err(ConfigStoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn no_temp_file_survives_save(){
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("integrations.yaml");
        let store = ConfigStore::new(path.clone());
        store.create(instance("a")).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["integrations.yaml".to_string()]);
    }
}
