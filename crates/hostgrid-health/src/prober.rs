//! Readiness waiting for freshly started instances.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use hostgrid_core::config::HealthConfig;

use crate::checker::{ProbeResult, http_probe};

/// Polls an instance's health path on a fixed interval.
#[derive(Debug, Clone)]
pub struct HealthProber {
    host: String,
    path: String,
    timeout: Duration,
    interval: Duration,
    request_timeout: Duration,
}

impl HealthProber {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            host: config.host.clone(),
            path: config.path.clone(),
            timeout: config.start_timeout,
            interval: config.interval,
            request_timeout: config.request_timeout,
        }
    }

    /// Override how long `wait_until_healthy` keeps trying.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One probe against the instance on `port`.
    pub async fn probe(&self, port: u16) -> ProbeResult {
        let address = format!("{}:{port}", self.host);
        http_probe(&address, &self.path, self.request_timeout).await
    }

    /// Wait until the instance on `port` answers with any HTTP response.
    ///
    /// Returns `false` once the timeout elapses without a response. Never
    /// errors: an unreachable instance is simply not ready.
    pub async fn wait_until_healthy(&self, port: u16) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.probe(port).await.is_reachable() {
                info!(port, attempts, "instance answered health check");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            debug!(port, attempts, "instance not ready yet");
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }

        warn!(
            port,
            attempts,
            timeout_secs = self.timeout.as_secs_f64(),
            "instance did not answer health check in time"
        );
        false
    }
}
