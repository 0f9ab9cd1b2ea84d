//! hostgrid-cluster — the agent's clients for the rest of the control plane.
//!
//! ```text
//! InstanceOrchestrator
//!   ├── CoordinationClient::ensure_path     "this version runs somewhere" markers
//!   └── RoutingClient
//!       ├── register / unregister           per-instance traffic routing
//!       ├── get_failed_instances            instances the balancer gave up on
//!       └── declare_known                   bulk adoption after recovery
//! ```
//!
//! Both talk JSON over HTTP. Markers are write-only: the agent never reads
//! them back.

pub mod coordination;
pub mod error;
pub mod routing;

pub use coordination::{CoordinationClient, HttpCoordinationClient, version_registration_path};
pub use error::{ClusterError, ClusterResult};
pub use routing::{HttpRoutingClient, RouteEntry, RoutingClient};
