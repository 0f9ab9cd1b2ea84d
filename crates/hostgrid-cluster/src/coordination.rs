//! Coordination store client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use hostgrid_core::VersionKey;

use crate::error::{ClusterError, ClusterResult};

/// Parent node of the per-version liveness markers.
pub const VERSION_REGISTRATION_NODE: &str = "/hostgrid/instances_by_version";

/// Marker path announcing that `version` runs on at least one host.
pub fn version_registration_path(version: &VersionKey) -> String {
    format!(
        "{VERSION_REGISTRATION_NODE}/{}_{}_{}",
        version.project_id(),
        version.service_id(),
        version.version_id()
    )
}

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create `path` and any missing parents. Existing nodes are left alone.
    async fn ensure_path(&self, path: &str) -> ClusterResult<()>;
}

#[derive(Serialize)]
struct EnsurePathRequest<'a> {
    path: &'a str,
    parents: bool,
}

/// Client for the coordination store's HTTP gateway.
pub struct HttpCoordinationClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinationClient {
    pub fn new(base_url: &str, timeout: Duration) -> ClusterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::request(base_url, e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl CoordinationClient for HttpCoordinationClient {
    async fn ensure_path(&self, path: &str) -> ClusterResult<()> {
        if !path.starts_with('/') || path.contains("//") {
            return Err(ClusterError::InvalidPath(path.to_string()));
        }

        let endpoint = format!("{}/v1/nodes", self.base_url);
        let response = self
            .client
            .put(&endpoint)
            .json(&EnsurePathRequest {
                path,
                parents: true,
            })
            .send()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;

        match response.status() {
            s if s.is_success() || s == StatusCode::CONFLICT => {
                debug!(%path, "coordination path ensured");
                Ok(())
            }
            s => Err(ClusterError::Status {
                endpoint,
                status: s.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_path_flattens_version() {
        let key: VersionKey = "guestbook/default/v1".parse().unwrap();
        assert_eq!(
            version_registration_path(&key),
            "/hostgrid/instances_by_version/guestbook_default_v1"
        );
    }
}
