//! The shared node registry: the runtime reads, provisioning writes.

use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const REGISTRY_TAG: &str = "Registry:";

/// One node as recorded by provisioning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub node_id: String,
    pub forest_id: String,
    pub address: String,
    pub status: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Entries recorded for `forest_id`, self included.
    async fn nodes(&self, forest_id: &str) -> Result<Vec<RegistryEntry>, ForestError>;
}

/// Directory-backed registry: one JSON document per node.
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn nodes(&self, forest_id: &str) -> Result<Vec<RegistryEntry>, ForestError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("unable to read registry {}: {err}", self.dir.display()),
            )
        })?;
        while let Ok(Some(file)) = dir.next_entry().await {
            let path = file.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("{REGISTRY_TAG} skipping unreadable {}: {err}", path.display());
                    continue;
                }
            };
            match serde_json::from_str::<RegistryEntry>(&raw) {
                Ok(entry) if entry.forest_id == forest_id => entries.push(entry),
                Ok(_) => {}
                Err(err) => {
                    warn!("{REGISTRY_TAG} skipping malformed {}: {err}", path.display());
                }
            }
        }
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(entries)
    }
}

/// HTTP registry: `GET <endpoint>?forestId=<id>` returning a JSON array of
/// entries, with optional bearer credentials.
pub struct HttpRegistry {
    endpoint: String,
    credentials: Option<String>,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(endpoint: impl Into<String>, credentials: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn nodes(&self, forest_id: &str) -> Result<Vec<RegistryEntry>, ForestError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("forestId", forest_id)])
            .timeout(std::time::Duration::from_secs(5));
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials);
        }
        let response = request.send().await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("registry unreachable: {err}"))
        })?;
        if !response.status().is_success() {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("registry returned {}", response.status()),
            ));
        }
        response.json::<Vec<RegistryEntry>>().await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("registry reply unusable: {err}"))
        })
    }
}

/// Picks the registry implementation from the locator scheme: `http(s)://`
/// is remote, `file:` or a bare path is a directory.
pub fn registry_for(locator: &str, credentials: Option<String>) -> Arc<dyn Registry> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        Arc::new(HttpRegistry::new(locator, credentials))
    } else {
        let path = locator.strip_prefix("file:").unwrap_or(locator);
        Arc::new(FileRegistry::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::{FileRegistry, Registry, RegistryEntry};

    #[tokio::test]
    async fn file_registry_filters_by_forest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = |node: &str, forest: &str| RegistryEntry {
            node_id: node.to_string(),
            forest_id: forest.to_string(),
            address: "10.0.0.1:7401".to_string(),
            status: "up".to_string(),
        };
        for (file, record) in [
            ("a.json", entry("node-a", "prod")),
            ("b.json", entry("node-b", "prod")),
            ("c.json", entry("node-c", "staging")),
        ] {
            std::fs::write(
                dir.path().join(file),
                serde_json::to_string(&record).unwrap(),
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("junk.txt"), "not json").unwrap();

        let registry = FileRegistry::new(dir.path());
        let nodes = registry.nodes("prod").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, "node-a");
        assert_eq!(nodes[1].node_id, "node-b");
    }
}
