//! HTTP surface driven through `tower::ServiceExt::oneshot`

use super::fixtures::*;
use super::init_test_logging;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use sdlora_serve::server::{ErrorResponse, HealthResponse, InvocationResponse};
use sdlora_serve::{router, AppState};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

fn invocation(body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/invocations")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn failing_request() -> serde_json::Value {
    let mut body = small_request();
    body["input_image"] = "s3://bucket/input.png".into();
    body
}

#[tokio::test]
async fn test_ping() {
    let (_guard, root) = create_test_dir();
    let app = router(AppState::new(create_orchestrator(&root, test_config(&root))));

    let response = app.oneshot(get("/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invocation_returns_uris() {
    init_test_logging();
    let (_guard, root) = create_test_dir();
    let state = AppState::new(create_orchestrator(&root, test_config(&root)));
    let app = router(state.clone());

    let response = app.oneshot(invocation(&small_request())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: InvocationResponse = json(response).await;
    assert_eq!(body.result.len(), 1);
    assert!(body.result[0].starts_with("s3://outputs/"));

    let stats = state.tracker().stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.active_requests, 0);
}

#[tokio::test]
async fn test_float_and_oversized_numbers_are_clamped_not_rejected() {
    let (_guard, root) = create_test_dir();
    let app = router(AppState::new(create_orchestrator(&root, test_config(&root))));

    let mut body = small_request();
    body["steps"] = serde_json::json!(20.0);
    body["count"] = serde_json::json!(1e30);
    let response = app.oneshot(invocation(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: InvocationResponse = json(response).await;
    assert_eq!(body.result.len(), 4);
}

#[tokio::test]
async fn test_failure_is_empty_result_by_default() {
    let (_guard, root) = create_test_dir();
    let app = router(AppState::new(create_orchestrator(&root, test_config(&root))));

    let response = app.oneshot(invocation(&failing_request())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: InvocationResponse = json(response).await;
    assert!(body.result.is_empty());
}

#[tokio::test]
async fn test_failure_is_typed_500_when_strict() {
    let (_guard, root) = create_test_dir();
    let config = sdlora::ServingConfig {
        strict_errors: true,
        ..test_config(&root)
    };
    let app = router(AppState::new(create_orchestrator(&root, config)));

    let response = app.oneshot(invocation(&failing_request())).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorResponse = json(response).await;
    assert_eq!(body.code, "REMOTE_FETCH_ERROR");
    assert!(body.error.contains("s3://bucket/input.png"));
}

#[tokio::test]
async fn test_health_reports_counters() {
    let (_guard, root) = create_test_dir();
    let state = AppState::new(create_orchestrator(&root, test_config(&root)));

    router(state.clone())
        .oneshot(invocation(&failing_request()))
        .await
        .unwrap();
    let response = router(state).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = json(response).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.requests_total, 1);
    assert_eq!(health.requests_error, 1);
    assert_eq!(health.active_requests, 0);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let (_guard, root) = create_test_dir();
    let app = router(AppState::new(create_orchestrator(&root, test_config(&root))));

    let request = Request::builder()
        .method("POST")
        .uri("/invocations")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}
