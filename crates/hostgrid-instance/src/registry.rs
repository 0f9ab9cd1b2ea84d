//! Read-only view of the project/version registry.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use hostgrid_core::{RevisionKey, VersionConfig, VersionKey};

#[async_trait]
pub trait VersionRegistry: Send + Sync {
    async fn version(&self, key: &VersionKey) -> Option<VersionConfig>;

    async fn project_exists(&self, project_id: &str) -> bool;

    /// Current revision of every known version.
    async fn revisions(&self) -> Vec<RevisionKey>;
}

/// Registry kept in memory and fed by the scheduler through the agent API.
#[derive(Default)]
pub struct InMemoryVersionRegistry {
    versions: RwLock<HashMap<VersionKey, VersionConfig>>,
}

impl InMemoryVersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a version. Returns the previous config, if any.
    pub async fn put(&self, key: VersionKey, config: VersionConfig) -> Option<VersionConfig> {
        info!(version = %key, revision = config.revision, runtime = %config.runtime, "version registered");
        self.versions.write().await.insert(key, config)
    }

    pub async fn remove(&self, key: &VersionKey) -> Option<VersionConfig> {
        let removed = self.versions.write().await.remove(key);
        if removed.is_some() {
            info!(version = %key, "version removed");
        }
        removed
    }
}

#[async_trait]
impl VersionRegistry for InMemoryVersionRegistry {
    async fn version(&self, key: &VersionKey) -> Option<VersionConfig> {
        self.versions.read().await.get(key).cloned()
    }

    async fn project_exists(&self, project_id: &str) -> bool {
        self.versions
            .read()
            .await
            .keys()
            .any(|key| key.project_id() == project_id)
    }

    async fn revisions(&self) -> Vec<RevisionKey> {
        self.versions
            .read()
            .await
            .iter()
            .map(|(key, config)| key.revision(config.revision))
            .collect()
    }
}
