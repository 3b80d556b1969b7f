//! Discovery / assignment integration tests
//!
//! Runs the assignment client against an in-process mock control plane and
//! checks the request shape, auth header policy, redirect handling and
//! failure semantics.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;

use fedn_client::config::{CombinerConfig, ConfigMap, ControllerConfig};
use fedn_client::discovery::DiscoveryClient;

/// Serializes the tests that read or write `FEDN_AUTH_SCHEME`.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Default)]
struct Recorded {
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
    bodies: Arc<Mutex<Vec<serde_json::Value>>>,
}

async fn add_client(
    State(state): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.auth_headers.lock().unwrap().push(auth);
    state.bodies.lock().unwrap().push(body);
    Json(serde_json::json!({ "host": "cmb1", "fqdn": null }))
}

async fn spawn_control_plane(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config_for(addr: SocketAddr, token: Option<&str>) -> ControllerConfig {
    let mut map = ConfigMap::new();
    map.insert("discover_host".into(), addr.to_string());
    map.insert("client_id".into(), "c1".into());
    map.insert("name".into(), "alpha".into());
    map.insert("insecure".into(), "true".into());
    if let Some(token) = token {
        map.insert("token".into(), token.into());
    }
    ControllerConfig::resolve(&map).unwrap()
}

#[tokio::test]
async fn assignment_posts_identity_and_auth_header() {
    let _env = ENV_LOCK.lock().unwrap();
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/api/v1/clients/add", post(add_client))
        .with_state(recorded.clone());
    let addr = spawn_control_plane(app).await;

    // Token present: Authorization carries the default Bearer scheme.
    let config = config_for(addr, Some("T"));
    let client = DiscoveryClient::new(&config).unwrap();
    let assignment = client.assign(&config).await.unwrap();
    assert_eq!(assignment.host, "cmb1");
    assert_eq!(assignment.fqdn, None);

    // Empty token: header absent.
    let config = config_for(addr, None);
    let client = DiscoveryClient::new(&config).unwrap();
    client.assign(&config).await.unwrap();

    let headers = recorded.auth_headers.lock().unwrap().clone();
    assert_eq!(headers, vec![Some("Bearer T".to_string()), None]);

    let bodies = recorded.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["client_id"], "c1");
    assert_eq!(bodies[0]["name"], "alpha");
    assert_eq!(bodies[0]["package"], "remote");
    assert_eq!(bodies[0]["preferred_combiner"], "");
}

#[tokio::test]
async fn assignment_scheme_follows_environment_override() {
    let _env = ENV_LOCK.lock().unwrap();
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/api/v1/clients/add", post(add_client))
        .with_state(recorded.clone());
    let addr = spawn_control_plane(app).await;

    let config = config_for(addr, Some("T"));
    let client = DiscoveryClient::new(&config).unwrap();

    std::env::set_var("FEDN_AUTH_SCHEME", "Token");
    let result = client.assign(&config).await;
    std::env::remove_var("FEDN_AUTH_SCHEME");
    result.unwrap();

    let headers = recorded.auth_headers.lock().unwrap().clone();
    assert_eq!(headers, vec![Some("Token T".to_string())]);
}

#[tokio::test]
async fn assignment_follows_redirects() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/api/v1/clients/add",
            post(|| async { Redirect::permanent("/relocated") }),
        )
        .route("/relocated", post(add_client))
        .with_state(recorded.clone());
    let addr = spawn_control_plane(app).await;

    let config = config_for(addr, Some("T"));
    let client = DiscoveryClient::new(&config).unwrap();
    let assignment = client.assign(&config).await.unwrap();
    assert_eq!(assignment.host, "cmb1");
}

#[tokio::test]
async fn non_2xx_is_an_assignment_failure() {
    let app = Router::new().route(
        "/api/v1/clients/add",
        post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    let addr = spawn_control_plane(app).await;

    let config = config_for(addr, None);
    let client = DiscoveryClient::new(&config).unwrap();
    let err = client.assign(&config).await.unwrap_err();
    match err {
        fedn_client::AssignmentError::ServerError(status) => {
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn malformed_body_is_an_assignment_failure() {
    let app = Router::new().route("/api/v1/clients/add", post(|| async { "not json" }));
    let addr = spawn_control_plane(app).await;

    let config = config_for(addr, None);
    let client = DiscoveryClient::new(&config).unwrap();
    let err = client.assign(&config).await.unwrap_err();
    assert!(matches!(err, fedn_client::AssignmentError::Malformed(_)));
}

#[tokio::test]
async fn insecure_assignment_pins_host_and_port() {
    let app = Router::new().route(
        "/api/v1/clients/add",
        post(|| async { Json(serde_json::json!({ "host": "cmb1", "fqdn": null, "port": 7777 })) }),
    );
    let addr = spawn_control_plane(app).await;

    let mut map: ConfigMap = BTreeMap::new();
    map.insert("discover_host".into(), addr.to_string());
    map.insert("client_id".into(), "c1".into());
    map.insert("name".into(), "alpha".into());
    map.insert("insecure".into(), "true".into());

    let controller = ControllerConfig::resolve(&map).unwrap();
    let mut combiner = CombinerConfig::resolve(&map).unwrap();

    let client = DiscoveryClient::new(&controller).unwrap();
    let assignment = client.assign(&controller).await.unwrap();
    combiner.apply_assignment(&assignment.host, assignment.fqdn.as_deref(), assignment.port);

    assert_eq!(combiner.host, "cmb1:7777");
    assert_eq!(combiner.proxy_host, None);
}
