//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server,
//! backed by the in-memory store and broker.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::{Duration, Utc};
use tower::ServiceExt;

use courier_api::routes::create_router;
use courier_api::state::AppState;
use courier_common::config::AppConfig;
use courier_common::types::{Notification, Status};
use courier_queue::{BrokerConfig, InMemoryBroker};
use courier_store::{MemoryStore, Store};

// ============================================================
// Helpers
// ============================================================

struct TestApp {
    state: AppState,
    store: Arc<MemoryStore>,
    broker: Arc<InMemoryBroker>,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
    let config = AppConfig {
        default_max_retries: 4,
        ..AppConfig::default()
    };
    TestApp {
        state: AppState::new(store.clone(), broker.clone(), config),
        store,
        broker,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    create_router(app.state.clone())
        .oneshot(request)
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create(app: &TestApp, message: &str, send_at: chrono::DateTime<Utc>) -> Notification {
    let response = send(
        app,
        "POST",
        "/api/notify",
        Some(serde_json::json!({"message": message, "send_at": send_at})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    serde_json::from_value(json_body(response).await).unwrap()
}

// ============================================================
// Routes
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let response = send(&app, "GET", "/api/health", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "courier-api");
}

#[tokio::test]
async fn test_create_schedules_notification() {
    let app = test_app();
    let n = create(&app, "hello", Utc::now() + Duration::seconds(30)).await;

    assert_eq!(n.status, Status::Pending);
    assert_eq!(n.attempts, 0);
    assert_eq!(n.max_retries, 4);
    assert!(app.store.get_by_id(&n.id).await.unwrap().is_some());
    assert_eq!(app.broker.delayed_len().await, 1);
    assert_eq!(app.broker.ready_len().await, 0);
}

#[tokio::test]
async fn test_create_overdue_goes_straight_to_ready() {
    let app = test_app();
    create(&app, "late", Utc::now() - Duration::seconds(5)).await;
    assert_eq!(app.broker.ready_len().await, 1);
}

#[tokio::test]
async fn test_create_beyond_horizon_is_stored_only() {
    let app = test_app();
    let n = create(&app, "later", Utc::now() + Duration::minutes(10)).await;

    assert_eq!(app.broker.ready_len().await, 0);
    assert_eq!(app.broker.delayed_len().await, 0);
    assert_eq!(
        app.store.get_by_id(&n.id).await.unwrap().unwrap().status,
        Status::Pending
    );
}

#[tokio::test]
async fn test_create_respects_explicit_max_retries() {
    let app = test_app();
    let response = send(
        &app,
        "POST",
        "/api/notify",
        Some(serde_json::json!({"message": "x", "send_at": Utc::now(), "max_retries": 7})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["max_retries"], 7);

    let response = send(
        &app,
        "POST",
        "/api/notify",
        Some(serde_json::json!({"message": "x", "send_at": Utc::now(), "max_retries": 0})),
    )
    .await;
    assert_eq!(json_body(response).await["max_retries"], 4);
}

#[tokio::test]
async fn test_create_rejects_invalid_requests() {
    let app = test_app();

    let response = send(
        &app,
        "POST",
        "/api/notify",
        Some(serde_json::json!({"message": "  ", "send_at": Utc::now()})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "Message is required");

    let response = send(
        &app,
        "POST",
        "/api/notify",
        Some(serde_json::json!({"message": "no time"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.store.get_all().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_get_and_list_notifications() {
    let app = test_app();
    let first = create(&app, "first", Utc::now() + Duration::seconds(30)).await;
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    let second = create(&app, "second", Utc::now() + Duration::seconds(30)).await;

    let response = send(&app, "GET", &format!("/api/notify/{}", first.id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["message"], "first");

    let response = send(&app, "GET", "/api/notify", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let list = json_body(response).await;
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

    let response = send(&app, "GET", "/api/notify/missing", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_and_purge() {
    let app = test_app();
    let n = create(&app, "cancel me", Utc::now() + Duration::seconds(30)).await;

    let response = send(&app, "DELETE", &format!("/api/notify/{}", n.id), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let stored = app.store.get_by_id(&n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Cancelled);
    assert_eq!(app.store.due_len().await, 0);

    let response = send(
        &app,
        "DELETE",
        &format!("/api/notify/{}?purge=true", n.id),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(app.store.get_by_id(&n.id).await.unwrap().is_none());

    let response = send(&app, "DELETE", &format!("/api/notify/{}", n.id), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_counts_by_status() {
    let app = test_app();
    create(&app, "a", Utc::now() + Duration::seconds(30)).await;
    let b = create(&app, "b", Utc::now() + Duration::seconds(30)).await;
    send(&app, "DELETE", &format!("/api/notify/{}", b.id), None).await;

    let response = send(&app, "GET", "/api/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["pending"], 1);
    assert_eq!(json["cancelled"], 1);
    assert_eq!(json["sent"], 0);
}
