//! HTTP clients against an in-process fake control plane.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};

use hostgrid_cluster::{
    ClusterError, CoordinationClient, HttpCoordinationClient, HttpRoutingClient, RouteEntry,
    RoutingClient, version_registration_path,
};
use hostgrid_core::{Instance, Outcome, Retryable, VersionKey};

#[derive(Default)]
struct Plane {
    routes: Vec<RouteEntry>,
    paths: Vec<String>,
    declared: Vec<(String, Vec<RouteEntry>)>,
}

type Shared = Arc<Mutex<Plane>>;

async fn register(State(plane): State<Shared>, Json(entry): Json<RouteEntry>) -> StatusCode {
    plane.lock().unwrap().routes.push(entry);
    StatusCode::CREATED
}

async fn unregister(State(plane): State<Shared>, Json(entry): Json<RouteEntry>) -> StatusCode {
    let mut plane = plane.lock().unwrap();
    let before = plane.routes.len();
    plane.routes.retain(|r| r != &entry);
    if plane.routes.len() < before {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn failed(Query(params): Query<std::collections::HashMap<String, String>>) -> Json<Value> {
    if params.get("host").map(String::as_str) == Some("10.0.0.2") {
        Json(json!([{ "version_key": "guestbook/default/v1", "port": 20001 }]))
    } else {
        Json(json!([]))
    }
}

async fn declare(
    State(plane): State<Shared>,
    Path(host): Path<String>,
    Json(entries): Json<Vec<RouteEntry>>,
) -> StatusCode {
    plane.lock().unwrap().declared.push((host, entries));
    StatusCode::OK
}

async fn ensure_path(State(plane): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    let path = body["path"].as_str().unwrap_or_default().to_string();
    let mut plane = plane.lock().unwrap();
    if plane.paths.contains(&path) {
        return StatusCode::CONFLICT;
    }
    plane.paths.push(path);
    StatusCode::CREATED
}

async fn fake_plane() -> (String, Shared) {
    let plane: Shared = Arc::default();
    let app = Router::new()
        .route("/api/v1/routes", post(register).delete(unregister))
        .route("/api/v1/routes/failed", get(failed))
        .route("/api/v1/nodes/{host}/routes", put(declare))
        .route("/v1/nodes", put(ensure_path))
        .route("/broken/v1/nodes", put(|| async { StatusCode::BAD_GATEWAY }))
        .with_state(plane.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), plane)
}

fn instance(port: u16) -> Instance {
    let key: VersionKey = "guestbook/default/v1".parse().unwrap();
    Instance::new(key.revision(3), port)
}

#[tokio::test]
async fn register_then_unregister_twice() {
    let (url, plane) = fake_plane().await;
    let routing = HttpRoutingClient::new(&url, "10.0.0.2", Duration::from_secs(5)).unwrap();

    routing.register(&instance(20000)).await.unwrap();
    assert_eq!(plane.lock().unwrap().routes.len(), 1);
    assert_eq!(plane.lock().unwrap().routes[0].host, "10.0.0.2");

    assert_eq!(
        routing.unregister(&instance(20000)).await.unwrap(),
        Outcome::Applied
    );
    assert_eq!(
        routing.unregister(&instance(20000)).await.unwrap(),
        Outcome::AlreadyAbsent
    );
}

#[tokio::test]
async fn failed_instances_are_scoped_to_host() {
    let (url, _) = fake_plane().await;
    let routing = HttpRoutingClient::new(&url, "10.0.0.2", Duration::from_secs(5)).unwrap();
    let failed = routing.get_failed_instances().await.unwrap();
    let key: VersionKey = "guestbook/default/v1".parse().unwrap();
    assert_eq!(failed, HashSet::from([(key, 20001)]));

    let other = HttpRoutingClient::new(&url, "10.0.0.9", Duration::from_secs(5)).unwrap();
    assert!(other.get_failed_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn declare_known_sends_whole_set() {
    let (url, plane) = fake_plane().await;
    let routing = HttpRoutingClient::new(&url, "10.0.0.2", Duration::from_secs(5)).unwrap();
    let set = HashSet::from([instance(20001), instance(20000)]);
    routing.declare_known(&set).await.unwrap();

    let plane = plane.lock().unwrap();
    let (host, entries) = &plane.declared[0];
    assert_eq!(host, "10.0.0.2");
    assert_eq!(
        entries.iter().map(|e| e.port).collect::<Vec<_>>(),
        vec![20000, 20001]
    );
}

#[tokio::test]
async fn ensure_path_is_idempotent() {
    let (url, plane) = fake_plane().await;
    let coordination = HttpCoordinationClient::new(&url, Duration::from_secs(5)).unwrap();
    let path = version_registration_path(&"guestbook/default/v1".parse().unwrap());

    coordination.ensure_path(&path).await.unwrap();
    coordination.ensure_path(&path).await.unwrap();
    assert_eq!(plane.lock().unwrap().paths, vec![path]);
}

#[tokio::test]
async fn gateway_errors_are_retryable() {
    let (url, _) = fake_plane().await;
    let coordination =
        HttpCoordinationClient::new(&format!("{url}/broken"), Duration::from_secs(5)).unwrap();
    let err = coordination.ensure_path("/hostgrid").await.unwrap_err();
    assert!(matches!(err, ClusterError::Status { status: 502, .. }));
    assert!(err.is_retryable());

    let err = coordination.ensure_path("relative").await.unwrap_err();
    assert!(!err.is_retryable());
}
