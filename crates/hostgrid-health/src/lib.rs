//! hostgrid-health — HTTP health probing for app-server instances.
//!
//! ```text
//! HealthProber::wait_until_healthy(port)
//!   └── http_probe() → ProbeResult   (any response counts, until timeout)
//!
//! Groomer sweep
//!   └── HealthTracker per instance   (503/unreachable counted against a threshold)
//! ```
//!
//! The post-start wait is deliberately lenient: a reachable app that answers
//! with an error is still up. Only the groomer treats 503 as unhealthy, and
//! only after several consecutive failures.

pub mod checker;
pub mod prober;

pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use prober::HealthProber;
