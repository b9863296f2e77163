// HTTP tests for the device authorization endpoints
//
// Requests go through the full router (extractors, middleware, error mapping)
// without binding a socket.

mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use devicelink::clock::ManualClock;
use devicelink::settings::Settings;
use devicelink::web::{self, AppState, DEVICE_CODE_GRANT};
use helpers::ServiceBuilder;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app_with(builder: ServiceBuilder) -> (Arc<ManualClock>, Router) {
    let mut settings = Settings::default();
    settings.server.public_base_url = Some("https://login.example.com".to_string());
    settings.device = builder.policy();

    let clock = builder.clock();
    let state = AppState {
        settings: Arc::new(settings),
        service: Arc::new(builder.build_in_memory()),
    };
    (clock, web::router(state))
}

fn app() -> (Arc<ManualClock>, Router) {
    app_with(ServiceBuilder::new())
}

async fn post(app: &Router, uri: &str, body: Value, bearer: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn start(app: &Router) -> Value {
    let (status, body) = post(
        app,
        "/device_authorization",
        json!({ "client_id": "C" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

async fn poll(app: &Router, device_code: &str) -> (StatusCode, Value) {
    post(
        app,
        "/token",
        json!({
            "grant_type": DEVICE_CODE_GRANT,
            "device_code": device_code,
            "client_id": "C",
        }),
        None,
    )
    .await
}

fn approval(user_code: &str, subject: &str) -> Value {
    json!({
        "user_code": user_code,
        "access_token": format!("valid-{}", subject),
        "id_token": format!("id-{}", subject),
        "refresh_token": format!("refresh-{}", subject),
    })
}

#[tokio::test]
async fn test_device_authorization_response() {
    let (_clock, app) = app();
    let body = start(&app).await;

    assert_eq!(body["expires_in"], 600);
    assert_eq!(body["interval"], 5);
    assert_eq!(body["device_code"].as_str().unwrap().len(), 32);

    let user_code = body["user_code"].as_str().unwrap();
    assert_eq!(user_code.len(), 9);
    assert_eq!(&user_code[4..5], "-");
    assert_eq!(body["verification_uri"], "https://login.example.com/device");
    assert_eq!(
        body["verification_uri_complete"],
        format!("https://login.example.com/device?user_code={}", user_code)
    );
}

#[tokio::test]
async fn test_token_endpoint_lifecycle() {
    let (clock, app) = app();
    let body = start(&app).await;
    let device_code = body["device_code"].as_str().unwrap();
    let user_code = body["user_code"].as_str().unwrap();

    let (status, err) = poll(&app, device_code).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "authorization_pending");

    let (status, ok) = post(
        &app,
        "/device/authorize",
        approval(user_code, "alice"),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ok["success"], true);

    let (status, tokens) = poll(&app, device_code).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tokens["access_token"], "valid-alice");
    assert_eq!(tokens["id_token"], "id-alice");
    assert_eq!(tokens["refresh_token"], "refresh-alice");
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);

    let (status, err) = poll(&app, device_code).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_grant");

    // A second request expires while nobody acts on it
    let body = start(&app).await;
    clock.advance(601);
    let (status, err) = poll(&app, body["device_code"].as_str().unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "expired_token");
}

#[tokio::test]
async fn test_deny_reports_access_denied() {
    let (_clock, app) = app();
    let body = start(&app).await;

    let (status, _) = post(
        &app,
        "/device/deny",
        json!({ "user_code": body["user_code"] }),
        Some("valid-bob"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, err) = poll(&app, body["device_code"].as_str().unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "access_denied");
}

#[tokio::test]
async fn test_second_screen_errors() {
    let (_clock, app) = app();
    let body = start(&app).await;
    let user_code = body["user_code"].as_str().unwrap();

    // Bad bearer
    let (status, err) = post(
        &app,
        "/device/authorize",
        approval(user_code, "alice"),
        Some("forged"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["error"], "invalid_token");

    // Missing bearer on deny
    let (status, _) = post(&app, "/device/deny", json!({ "user_code": user_code }), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown and malformed codes
    let (status, err) = post(
        &app,
        "/device/authorize",
        approval("BCDF-GHJK", "alice"),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_grant");

    let (status, err) = post(
        &app,
        "/device/authorize",
        approval("not a code", "alice"),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");

    // Missing tokens
    let (status, err) = post(
        &app,
        "/device/authorize",
        json!({ "user_code": user_code, "access_token": "valid-alice" }),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");

    // Second decision after the first
    let (status, _) = post(
        &app,
        "/device/authorize",
        approval(user_code, "alice"),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, err) = post(
        &app,
        "/device/deny",
        json!({ "user_code": user_code }),
        Some("valid-alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_grant");
}

#[tokio::test]
async fn test_token_request_validation() {
    let (_clock, app) = app();
    let body = start(&app).await;

    let (status, err) = post(
        &app,
        "/token",
        json!({
            "grant_type": "authorization_code",
            "device_code": body["device_code"],
            "client_id": "C",
        }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");

    let (status, err) = post(
        &app,
        "/token",
        json!({ "grant_type": DEVICE_CODE_GRANT, "client_id": "C" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");

    // Bound to C; D learns nothing about its status
    let (status, err) = post(
        &app,
        "/token",
        json!({
            "grant_type": DEVICE_CODE_GRANT,
            "device_code": body["device_code"],
            "client_id": "D",
        }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_grant");

    let (status, err) = post(&app, "/device_authorization", json!({}), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_client_rejected() {
    let (_clock, app) = app_with(ServiceBuilder::new().with_clients(&["tv"]));

    let (status, err) = post(
        &app,
        "/device_authorization",
        json!({ "client_id": "C" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_request");

    let (status, _) = post(&app, "/device_authorization", json!({ "client_id": "tv" }), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_body_is_invalid_request() {
    let (_clock, app) = app();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let err: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(err["error"], "invalid_request");
}

#[tokio::test]
async fn test_metadata_lists_device_grant() {
    let (_clock, app) = app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/oauth-authorization-server")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let metadata: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(metadata["issuer"], "https://login.example.com");
    assert_eq!(
        metadata["device_authorization_endpoint"],
        "https://login.example.com/device_authorization"
    );
    assert_eq!(metadata["grant_types_supported"][0], DEVICE_CODE_GRANT);
}
