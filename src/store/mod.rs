//! Storage for in-flight device authorization requests.
//!
//! A [`CodeStore`] is keyed by device code with a secondary index on the
//! normalized user code. Backends must make three operations atomic across
//! processes: the uniqueness check in [`CodeStore::create`], the conditional
//! [`CodeStore::transition`] out of `pending`, and [`CodeStore::fetch_and_delete`].
//! A record past its deadline must never be returned, whatever its status.

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod memory;
pub mod sql;

pub use memory::MemoryCodeStore;
pub use sql::SqlCodeStore;

/// Credentials produced by the identity provider for the approving user.
/// Carried through untouched and handed to exactly one poll.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"<redacted>")
            .field("id_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Authorized { subject: String, tokens: TokenBundle },
    Denied,
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }
}

/// The terminal outcome written by [`CodeStore::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Authorized { subject: String, tokens: TokenBundle },
    Denied,
}

impl From<Resolution> for RequestStatus {
    fn from(value: Resolution) -> Self {
        match value {
            Resolution::Authorized { subject, tokens } => {
                RequestStatus::Authorized { subject, tokens }
            }
            Resolution::Denied => RequestStatus::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub device_code: String,
    /// Normalized (no separator, upper case).
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub status: RequestStatus,
    pub interval: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl AuthorizationRequest {
    /// A request is live up to and including its deadline second.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn expires_in(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

/// Result of a lookup. Expired rows that the sweep has not removed yet are
/// reported without their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Live(AuthorizationRequest),
    Expired { device_code: String, client_id: String },
    Absent,
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Persist a new pending request. Fails with [`StoreError::AlreadyExists`]
    /// when either code is held by a live request.
    async fn create(&self, request: &AuthorizationRequest) -> Result<(), StoreError>;

    async fn get_by_device_code(&self, device_code: &str) -> Result<Lookup, StoreError>;

    /// `user_code` may be in display form; backends normalize it.
    async fn get_by_user_code(&self, user_code: &str) -> Result<Lookup, StoreError>;

    /// Move a live pending request to a terminal status. Fails with
    /// [`StoreError::InvalidState`] if the request is absent, expired, or
    /// already resolved. Exactly one concurrent caller succeeds.
    async fn transition(&self, device_code: &str, resolution: Resolution)
        -> Result<(), StoreError>;

    /// Remove a live authorized request and return it. Exactly one concurrent
    /// caller receives `Some`.
    async fn fetch_and_delete(
        &self,
        device_code: &str,
    ) -> Result<Option<AuthorizationRequest>, StoreError>;

    async fn delete(&self, device_code: &str) -> Result<(), StoreError>;

    /// Remove every request past its deadline, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let request = AuthorizationRequest {
            device_code: "dc".into(),
            user_code: "BCDFGHJK".into(),
            client_id: "c1".into(),
            scope: "openid".into(),
            status: RequestStatus::Pending,
            interval: 5,
            created_at: 100,
            expires_at: 700,
        };
        assert!(!request.is_expired_at(700));
        assert!(request.is_expired_at(701));
        assert_eq!(request.expires_in(100), 600);
        assert_eq!(request.expires_in(800), 0);
    }

    #[test]
    fn test_token_bundle_debug_is_redacted() {
        let tokens = TokenBundle {
            access_token: "secret-at".into(),
            id_token: "secret-id".into(),
            refresh_token: "secret-rt".into(),
        };
        let rendered = format!("{:?}", tokens);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_resolution_into_status() {
        assert_eq!(RequestStatus::from(Resolution::Denied), RequestStatus::Denied);
        assert!(RequestStatus::Pending.is_pending());
        assert!(!RequestStatus::Denied.is_pending());
    }
}
