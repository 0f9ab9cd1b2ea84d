//! Health check probe logic.
//!
//! A probe is a single GET against an instance's health path. Callers decide
//! how strict to be: the post-start wait only needs the instance to be
//! reachable, while the groomer's sweep also counts 503 as a failure.

use std::time::Duration;

use http::StatusCode;
use tracing::{debug, warn};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered with anything other than 503.
    Healthy,
    /// The endpoint answered 503 Service Unavailable.
    Unhealthy,
    /// No HTTP response: connection refused, reset, or timed out.
    Failed,
}

impl ProbeResult {
    /// Whether any HTTP response was received.
    pub fn is_reachable(self) -> bool {
        !matches!(self, ProbeResult::Failed)
    }
}

/// Counts consecutive failed probes of one running instance.
///
/// Both 503 and no response count as failures; any other answer resets the
/// count.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    failures: u32,
    threshold: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record a probe result. Returns true once `threshold` failures in a
    /// row have been seen.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        if result == ProbeResult::Healthy {
            self.failures = 0;
            return false;
        }
        self.failures += 1;
        if self.failures == self.threshold {
            warn!(failures = self.failures, "instance failed its health threshold");
        }
        self.failures >= self.threshold
    }
}

/// Perform an HTTP health probe against `address` (`host:port`).
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "hostgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status() == StatusCode::SERVICE_UNAVAILABLE => {
                debug!(%uri, "health probe got 503");
                ProbeResult::Unhealthy
            }
            Ok(resp) => {
                if !resp.status().is_success() {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                }
                ProbeResult::Healthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
