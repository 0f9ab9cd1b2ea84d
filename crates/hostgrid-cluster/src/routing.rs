//! Routing layer client.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hostgrid_core::{Instance, Outcome, RevisionKey, VersionKey};

use crate::error::{ClusterError, ClusterResult};

#[async_trait]
pub trait RoutingClient: Send + Sync {
    async fn register(&self, instance: &Instance) -> ClusterResult<()>;

    /// `Outcome::AlreadyAbsent` when the instance was not registered.
    async fn unregister(&self, instance: &Instance) -> ClusterResult<Outcome>;

    /// Instances on this host that the balancer considers failed.
    async fn get_failed_instances(&self) -> ClusterResult<HashSet<(VersionKey, u16)>>;

    /// Replace this host's set of known instances without health probing.
    async fn declare_known(&self, instances: &HashSet<Instance>) -> ClusterResult<()>;
}

/// One routable backend as seen by the routing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub revision_key: RevisionKey,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct FailedRoute {
    version_key: VersionKey,
    port: u16,
}

/// Client for the routing layer's admin API, scoped to one host.
pub struct HttpRoutingClient {
    base_url: String,
    host: String,
    client: reqwest::Client,
}

impl HttpRoutingClient {
    /// `host` is the address instances on this machine are reachable at.
    pub fn new(base_url: &str, host: &str, timeout: Duration) -> ClusterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::request(base_url, e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            host: host.to_string(),
            client,
        })
    }

    fn entry(&self, instance: &Instance) -> RouteEntry {
        RouteEntry {
            revision_key: instance.revision_key.clone(),
            host: self.host.clone(),
            port: instance.port,
        }
    }

    fn routes_endpoint(&self) -> String {
        format!("{}/api/v1/routes", self.base_url)
    }
}

fn status_error(endpoint: String, status: StatusCode) -> ClusterError {
    ClusterError::Status {
        endpoint,
        status: status.as_u16(),
    }
}

#[async_trait]
impl RoutingClient for HttpRoutingClient {
    async fn register(&self, instance: &Instance) -> ClusterResult<()> {
        let endpoint = self.routes_endpoint();
        let response = self
            .client
            .post(&endpoint)
            .json(&self.entry(instance))
            .send()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;

        if response.status().is_success() {
            debug!(%instance, "instance registered for routing");
            Ok(())
        } else {
            Err(status_error(endpoint, response.status()))
        }
    }

    async fn unregister(&self, instance: &Instance) -> ClusterResult<Outcome> {
        let endpoint = self.routes_endpoint();
        let response = self
            .client
            .delete(&endpoint)
            .json(&self.entry(instance))
            .send()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;

        match response.status() {
            s if s.is_success() => {
                debug!(%instance, "instance unregistered from routing");
                Ok(Outcome::Applied)
            }
            StatusCode::NOT_FOUND => {
                info!(%instance, "instance was not registered for routing");
                Ok(Outcome::AlreadyAbsent)
            }
            s => Err(status_error(endpoint, s)),
        }
    }

    async fn get_failed_instances(&self) -> ClusterResult<HashSet<(VersionKey, u16)>> {
        let endpoint = format!("{}/failed", self.routes_endpoint());
        let response = self
            .client
            .get(&endpoint)
            .query(&[("host", self.host.as_str())])
            .send()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;

        if !response.status().is_success() {
            return Err(status_error(endpoint, response.status()));
        }

        let failed: Vec<FailedRoute> = response
            .json()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;
        Ok(failed
            .into_iter()
            .map(|route| (route.version_key, route.port))
            .collect())
    }

    async fn declare_known(&self, instances: &HashSet<Instance>) -> ClusterResult<()> {
        let endpoint = format!("{}/api/v1/nodes/{}/routes", self.base_url, self.host);
        let mut entries: Vec<RouteEntry> = instances.iter().map(|i| self.entry(i)).collect();
        entries.sort_by(|a, b| (&a.revision_key, a.port).cmp(&(&b.revision_key, b.port)));

        let response = self
            .client
            .put(&endpoint)
            .json(&entries)
            .send()
            .await
            .map_err(|e| ClusterError::request(&endpoint, e))?;

        if response.status().is_success() {
            info!(count = entries.len(), "declared known instances to routing");
            Ok(())
        } else {
            Err(status_error(endpoint, response.status()))
        }
    }
}
