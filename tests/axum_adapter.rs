//! axum adapter integration tests
//!
//! Drives a protected router with `tower::ServiceExt::oneshot` against the
//! in-memory channel.

use appguard::adapter::axum::{protect, PeerAddrs};
use appguard::{
    Arbiter, CredentialManager, Credentials, DeviceIdentity, DeviceStatus, FirewallPolicy,
    MemoryChannel, MemoryTokenStore, Pipeline, Reply, ShutdownReason, ShutdownSignal, Stage,
    Verdict,
};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    channel: MemoryChannel,
    shutdown: ShutdownSignal,
    hits: Arc<AtomicUsize>,
    app: Router,
}

fn harness_with(credentials: Credentials) -> Harness {
    let channel = MemoryChannel::new();
    let shutdown = ShutdownSignal::new();
    let pipeline = Pipeline::new(
        Arc::new(channel.clone()),
        credentials,
        Arbiter::new(FirewallPolicy::Allow, Some(Duration::from_millis(1000))),
        shutdown.clone(),
    );

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new()
        .route(
            "/items",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "items"
                }
            }),
        )
        .route("/echo", post(|body: String| async move { body }));

    Harness {
        channel,
        shutdown,
        hits,
        app: protect(router, Arc::new(pipeline)),
    }
}

fn harness() -> Harness {
    harness_with(Credentials::fixed("tok"))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_allowed_request_reaches_handler() {
    let h = harness();
    let mut request = Request::builder()
        .uri("/items?limit=5")
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(PeerAddrs {
        remote: "10.0.0.1:39000".parse().unwrap(),
        local: Some("10.0.0.2:8080".parse().unwrap()),
    }));

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"items");
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);

    let calls = h.channel.calls();
    let connection = &calls.connections[0].connection;
    assert_eq!(connection.source_ip, "203.0.113.7");
    assert_eq!(connection.destination_port, Some(8080));

    let request = &calls.requests[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.original_url, "/items?limit=5");
    assert_eq!(request.query["limit"], "5");
    assert_eq!(request.token, "tok");

    assert_eq!(calls.responses[0].code, 200);
}

#[tokio::test]
async fn test_request_body_is_inspected_and_forwarded() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .body(Body::from("payload=1"))
        .unwrap();

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"payload=1");
    assert_eq!(h.channel.calls().requests[0].body.as_deref(), Some("payload=1"));
}

#[tokio::test]
async fn test_denied_request_gets_401_json() {
    let h = harness();
    h.channel.on_request(|_| Reply::Respond(Verdict::deny()));

    let request = Request::builder()
        .uri("/items")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"success": false, "message": "Unauthorized"})
    );
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.channel.calls().count(Stage::Response), 0);
}

#[tokio::test]
async fn test_denied_response_is_replaced() {
    let h = harness();
    h.channel.on_response(|_| Reply::Respond(Verdict::deny()));

    let request = Request::builder()
        .uri("/items")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_credential_gets_500_json() {
    let manager = CredentialManager::new(
        Arc::new(MemoryChannel::new()),
        DeviceIdentity::new("app", "secret"),
        Arc::new(MemoryTokenStore::default()),
        ShutdownSignal::new(),
        Duration::from_secs(10),
    );
    let h = harness_with(manager.credentials());

    let request = Request::builder()
        .uri("/items")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"success": false, "message": "Internal server error"})
    );
}

#[tokio::test]
async fn test_revoked_device_aborts_connection() {
    let h = harness();
    h.shutdown
        .trigger(ShutdownReason::DeviceRevoked(DeviceStatus::Archived));

    let request = Request::builder()
        .uri("/items")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .is_err());
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.channel.calls().count(Stage::Connection), 0);
}
