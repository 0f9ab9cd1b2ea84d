//! hostgridd — the per-host instance agent.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/instances` | Running and pending instances |
//! | GET | `/api/v1/api-servers` | Project API servers by port |
//! | PUT | `/api/v1/versions/{p}/{s}/{v}` | Register a version |
//! | DELETE | `/api/v1/versions/{p}/{s}/{v}` | Forget a version |
//! | POST | `/api/v1/versions/{p}/{s}/{v}/start` | Start an instance |
//! | POST | `/api/v1/versions/{p}/{s}/{v}/stop` | Stop all instances of a version |
//! | PUT | `/api/v1/assignments` | Replace the desired instance set |

pub mod api;

use axum::Router;
use axum::routing::{get, post, put};

pub use api::ApiState;

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(api::list_instances))
        .route("/api-servers", get(api::list_api_servers))
        .route(
            "/versions/{project}/{service}/{version}",
            put(api::put_version).delete(api::delete_version),
        )
        .route(
            "/versions/{project}/{service}/{version}/start",
            post(api::start_version),
        )
        .route(
            "/versions/{project}/{service}/{version}/stop",
            post(api::stop_version),
        )
        .route("/assignments", put(api::put_assignments))
        .with_state(state);

    Router::new()
        .route("/healthz", get(api::healthz))
        .nest("/api/v1", api_routes)
}
