//! HTTP surface of the device authorization grant.
//!
//! - `POST /device_authorization`: device asks for a code pair
//! - `POST /token`: device polls with its device code
//! - `POST /device/authorize`, `POST /device/deny`: second screen resolves the request
//!
//! Bodies are JSON; errors use the OAuth `{error, error_description}` shape.
use crate::codes;
use crate::errors::DeviceError;
use crate::service::{DeviceAuthorizationService, PollOutcome};
use crate::settings::Settings;
use crate::store::TokenBundle;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: Arc<DeviceAuthorizationService>,
}

// Security and caching headers on every response
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    // Codes and tokens must never be cached by intermediaries
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    headers.insert(
        HeaderName::from_static("pragma"),
        HeaderValue::from_static("no-cache"),
    );

    // X-Content-Type-Options: Prevent MIME sniffing
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    // X-Frame-Options: Prevent clickjacking
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );

    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/device_authorization", post(device_authorization))
        .route("/token", post(token))
        .route("/device/authorize", post(device_authorize))
        .route("/device/deny", post(device_deny))
        .route("/healthz", get(health))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: Settings, service: DeviceAuthorizationService) -> miette::Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        service: Arc::new(service),
    };

    // NOTE: polling rate is advisory (`interval`); enforce request limits at the reverse proxy.

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let router = router(state);

    tracing::info!(%addr, "Device authorization API listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": description,
        })),
    )
        .into_response()
}

fn malformed_body(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection, "rejected request body");
    oauth_error(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        "Request body must be a JSON object",
    )
}

fn required(field: Option<String>, name: &str) -> Result<String, Response> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("{} required", name),
        )),
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

async fn authorization_server_metadata(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.settings.issuer();
    Json(json!({
        "issuer": issuer,
        "device_authorization_endpoint": format!("{}/device_authorization", issuer),
        "token_endpoint": format!("{}/token", issuer),
        "grant_types_supported": [DEVICE_CODE_GRANT],
        "token_endpoint_auth_methods_supported": ["none"],
    }))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ========================================
// Device Authorization Endpoint
// ========================================

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationRequest {
    client_id: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: i64,
    interval: i64,
}

/// POST /device_authorization - RFC 8628 §3.1
async fn device_authorization(
    State(state): State<AppState>,
    payload: Result<Json<DeviceAuthorizationRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };
    let client_id = match required(req.client_id, "client_id") {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let request = match state.service.issue(&client_id, req.scope.as_deref()).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let user_code = codes::format_user_code(&request.user_code);
    let verification_uri = state.settings.verification_uri();
    let verification_uri_complete = format!(
        "{}?user_code={}",
        verification_uri,
        urlencoding::encode(&user_code)
    );

    (
        StatusCode::OK,
        Json(DeviceAuthorizationResponse {
            device_code: request.device_code.clone(),
            user_code,
            verification_uri,
            verification_uri_complete,
            expires_in: request.expires_in(state.service.now()),
            interval: request.interval,
        }),
    )
        .into_response()
}

// ========================================
// Token Endpoint (device_code grant only)
// ========================================

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: Option<String>,
    device_code: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    id_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
}

/// POST /token - RFC 8628 §3.4
async fn token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };

    let grant_type = match required(req.grant_type, "grant_type") {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    if grant_type != DEVICE_CODE_GRANT {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Unsupported grant_type",
        );
    }
    let device_code = match required(req.device_code, "device_code") {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    // Device flow uses public clients, so no secret required
    let client_id = match required(req.client_id, "client_id") {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let outcome = match state.service.poll(&device_code, &client_id).await {
        Ok(o) => o,
        Err(e) => return e.into_response(),
    };

    match outcome {
        PollOutcome::Delivered(tokens) => (
            StatusCode::OK,
            Json(TokenResponse {
                access_token: tokens.access_token,
                id_token: tokens.id_token,
                refresh_token: tokens.refresh_token,
                token_type: "Bearer",
                expires_in: state.service.policy().access_token_ttl_secs,
            }),
        )
            .into_response(),
        PollOutcome::Pending { .. } => oauth_error(
            StatusCode::BAD_REQUEST,
            "authorization_pending",
            "User has not yet authorized the device",
        ),
        PollOutcome::Denied => oauth_error(
            StatusCode::BAD_REQUEST,
            "access_denied",
            "User denied the authorization request",
        ),
        PollOutcome::Expired => oauth_error(
            StatusCode::BAD_REQUEST,
            "expired_token",
            "device_code has expired",
        ),
        PollOutcome::NotFound => oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "device_code not found or already used",
        ),
        PollOutcome::ClientMismatch => oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "device_code not bound to this client",
        ),
    }
}

// ========================================
// Second screen
// ========================================

#[derive(Debug, Deserialize)]
struct DeviceAuthorizeRequest {
    user_code: Option<String>,
    access_token: Option<String>,
    id_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceDenyRequest {
    user_code: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceDecisionResponse {
    success: bool,
    message: &'static str,
}

/// POST /device/authorize - approve with the user's freshly issued tokens.
/// The bearer is the `Authorization` header if present, else `access_token`.
async fn device_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DeviceAuthorizeRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };

    let fields = required(req.user_code, "user_code").and_then(|user_code| {
        Ok((
            user_code,
            TokenBundle {
                access_token: required(req.access_token, "access_token")?,
                id_token: required(req.id_token, "id_token")?,
                refresh_token: required(req.refresh_token, "refresh_token")?,
            },
        ))
    });
    let (user_code, tokens) = match fields {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let bearer = bearer_from_headers(&headers).unwrap_or_else(|| tokens.access_token.clone());

    match state.service.authorize(&user_code, &bearer, tokens).await {
        Ok(_subject) => Json(DeviceDecisionResponse {
            success: true,
            message: "Device authorized. You can return to your device.",
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /device/deny
async fn device_deny(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DeviceDenyRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };
    let user_code = match required(req.user_code, "user_code") {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let bearer = match bearer_from_headers(&headers).or(req.access_token) {
        Some(b) => b,
        None => return DeviceError::Unauthenticated.into_response(),
    };

    match state.service.deny(&user_code, &bearer).await {
        Ok(_subject) => Json(DeviceDecisionResponse {
            success: true,
            message: "The authorization request has been rejected.",
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
