use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DeviceLinkError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(devicelink::io))]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(devicelink::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(devicelink::jose))]
    Jose(String),

    #[error("{0}")]
    #[diagnostic(code(devicelink::other))]
    Other(String),
}

impl From<josekit::JoseError> for DeviceLinkError {
    fn from(value: josekit::JoseError) -> Self {
        DeviceLinkError::Jose(value.to_string())
    }
}

/// Failures reported by a [`crate::store::CodeStore`] backend.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("device code or user code already in use")]
    #[diagnostic(code(devicelink::store::already_exists))]
    AlreadyExists,

    #[error("authorization request is absent, expired, or no longer pending")]
    #[diagnostic(code(devicelink::store::invalid_state))]
    InvalidState,

    #[error("stored record is inconsistent: {0}")]
    #[diagnostic(code(devicelink::store::corrupt))]
    Corrupt(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(devicelink::store::db))]
    Db(#[from] sea_orm::DbErr),
}

/// Outcome classification for the device authorization operations.
///
/// Caller and state errors are reported to the client verbatim; every
/// internal variant collapses to a generic `server_error` at the HTTP edge.
#[derive(Debug, Error, Diagnostic)]
pub enum DeviceError {
    #[error("{0}")]
    #[diagnostic(code(devicelink::invalid_request))]
    InvalidRequest(String),

    #[error("user code not found")]
    #[diagnostic(code(devicelink::not_found))]
    NotFound,

    #[error("authorization request expired")]
    #[diagnostic(code(devicelink::expired))]
    Expired,

    #[error("bearer credential rejected")]
    #[diagnostic(code(devicelink::unauthenticated))]
    Unauthenticated,

    #[error("authorization request was already approved or denied")]
    #[diagnostic(code(devicelink::already_acted_on))]
    AlreadyActedOn,

    #[error("could not allocate unique codes after {0} attempts")]
    #[diagnostic(
        code(devicelink::code_space_exhausted),
        help("Check the store for stale rows; the expiry sweep may not be running")
    )]
    CodeSpaceExhausted(u32),

    #[error("{0} timed out")]
    #[diagnostic(code(devicelink::timeout))]
    Timeout(&'static str),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("identity provider error: {0}")]
    #[diagnostic(code(devicelink::identity))]
    Identity(#[from] DeviceLinkError),
}

impl DeviceError {
    /// OAuth error code sent on the wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            DeviceError::InvalidRequest(_) => "invalid_request",
            DeviceError::NotFound | DeviceError::AlreadyActedOn => "invalid_grant",
            DeviceError::Expired => "expired_token",
            DeviceError::Unauthenticated => "invalid_token",
            DeviceError::CodeSpaceExhausted(_)
            | DeviceError::Timeout(_)
            | DeviceError::Store(_)
            | DeviceError::Identity(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DeviceError::InvalidRequest(_)
            | DeviceError::NotFound
            | DeviceError::AlreadyActedOn
            | DeviceError::Expired => StatusCode::BAD_REQUEST,
            DeviceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Internal failures are worth retrying with backoff; everything else is final
    /// for the request as submitted.
    pub fn is_retryable(&self) -> bool {
        self.status() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for DeviceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let description = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "device authorization failed");
            "The server could not complete the request; retry later".to_string()
        } else {
            self.to_string()
        };
        let body = json!({
            "error": self.error_code(),
            "error_description": description,
        });
        let mut resp = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            resp.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        resp
    }
}
