//! hostgrid-instance — makes the app servers on this host match the
//! scheduler's assignments.
//!
//! ```text
//! InstanceOrchestrator
//!   ├── start_app ── ApiServerManager::ensure ── SourceProvider ── ProcessSupervisor
//!   │                  └── health gate (background) ── HealthProber ── RoutingClient::register
//!   ├── stop_app ─── RoutingClient::unregister ── ProcessSupervisor::unmonitor ── HostProcesses
//!   ├── recover_state ── supervisor watches → running set, API-server table
//!   │                    └── ProcessCleanup::clean_up_instances
//!   └── groom (Groomer) ── failed/unavailable restarts, assignments, cleanup, sources
//! ```
//!
//! The supervisor is the source of truth for what runs here; the running set
//! is a cache rebuilt from its watches whenever the agent starts.

pub mod api_server;
pub mod cleanup;
pub mod error;
pub mod groomer;
pub mod host;
mod lifecycle;
pub mod logrotate;
pub mod orchestrator;
pub mod registry;
#[cfg(feature = "testing")]
pub mod testing;

pub use api_server::ApiServerManager;
pub use cleanup::ProcessCleanup;
pub use error::{ErrorKind, HostError, HostResult, OrchestratorError, OrchestratorResult};
pub use groomer::Groomer;
pub use host::{HostProcesses, ProcessInfo, SystemProcesses};
pub use logrotate::LogRotation;
pub use orchestrator::{Collaborators, InstanceOrchestrator, StartRequest};
pub use registry::{InMemoryVersionRegistry, VersionRegistry};
