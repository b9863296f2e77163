//! Device Authorization Grant state machine (RFC 8628).
//!
//! ```text
//! pending ──authorize──▶ authorized ──poll──▶ (deleted, tokens delivered)
//!    │
//!    └────deny─────────▶ denied ─────poll──▶ (deleted)
//! ```
//!
//! Expiry is orthogonal: once the deadline passes the request is treated as
//! expired no matter what status is stored. All cross-request coordination
//! goes through the [`CodeStore`] primitives; this type holds no request state.

use crate::clock::Clock;
use crate::codes;
use crate::errors::{DeviceError, StoreError};
use crate::identity::BearerVerifier;
use crate::settings::Device as DevicePolicy;
use crate::store::{
    AuthorizationRequest, CodeStore, Lookup, RequestStatus, Resolution, TokenBundle,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_CLIENT_ID_LEN: usize = 128;
const MAX_SCOPE_LEN: usize = 1024;

/// What a polling device learns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered(TokenBundle),
    Pending { interval: i64 },
    Denied,
    Expired,
    NotFound,
    ClientMismatch,
}

#[derive(Clone)]
pub struct DeviceAuthorizationService {
    store: Arc<dyn CodeStore>,
    verifier: Arc<dyn BearerVerifier>,
    clock: Arc<dyn Clock>,
    policy: DevicePolicy,
}

impl DeviceAuthorizationService {
    pub fn new(
        store: Arc<dyn CodeStore>,
        verifier: Arc<dyn BearerVerifier>,
        clock: Arc<dyn Clock>,
        policy: DevicePolicy,
    ) -> Self {
        Self {
            store,
            verifier,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &DevicePolicy {
        &self.policy
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    async fn bounded<T, E>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, DeviceError>
    where
        DeviceError: From<E>,
    {
        let limit = Duration::from_millis(self.policy.upstream_timeout_ms);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(DeviceError::from),
            Err(_) => {
                warn!(
                    operation = what,
                    timeout_ms = self.policy.upstream_timeout_ms,
                    "upstream call timed out"
                );
                Err(DeviceError::Timeout(what))
            }
        }
    }

    /// Start a new authorization request for `client_id`.
    pub async fn issue(
        &self,
        client_id: &str,
        scope: Option<&str>,
    ) -> Result<AuthorizationRequest, DeviceError> {
        self.validate_client(client_id)?;
        let scope = match scope.map(str::trim).filter(|s| !s.is_empty()) {
            Some(scope) => scope,
            None => self.policy.default_scope.as_str(),
        };
        validate_scope(scope)?;

        for attempt in 1..=self.policy.max_code_attempts {
            let (device_code, user_code) = codes::issue_codes();
            let now = self.clock.now();
            let request = AuthorizationRequest {
                device_code,
                user_code,
                client_id: client_id.to_string(),
                scope: scope.to_string(),
                status: RequestStatus::Pending,
                interval: self.policy.interval_secs,
                created_at: now,
                expires_at: now + self.policy.code_ttl_secs,
            };

            match self
                .bounded("store create", self.store.create(&request))
                .await
            {
                Ok(()) => {
                    info!(
                        client_id,
                        scope,
                        expires_at = request.expires_at,
                        "Issued device code"
                    );
                    return Ok(request);
                }
                Err(DeviceError::Store(StoreError::AlreadyExists)) => {
                    warn!(attempt, "device or user code collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DeviceError::CodeSpaceExhausted(self.policy.max_code_attempts))
    }

    /// Approve the request behind `user_code` on behalf of the bearer's subject,
    /// attaching the tokens that the polling device will receive. Returns the subject.
    pub async fn authorize(
        &self,
        user_code: &str,
        bearer: &str,
        tokens: TokenBundle,
    ) -> Result<String, DeviceError> {
        validate_tokens(&tokens)?;
        let (request, subject) = self.pending_request_for(user_code, bearer).await?;
        self.resolve(
            &request,
            Resolution::Authorized {
                subject: subject.clone(),
                tokens,
            },
        )
        .await?;
        info!(client_id = %request.client_id, subject = %subject, "Device authorization approved");
        Ok(subject)
    }

    /// Reject the request behind `user_code`. Returns the subject that denied it.
    pub async fn deny(&self, user_code: &str, bearer: &str) -> Result<String, DeviceError> {
        let (request, subject) = self.pending_request_for(user_code, bearer).await?;
        self.resolve(&request, Resolution::Denied).await?;
        info!(client_id = %request.client_id, subject = %subject, "Device authorization denied");
        Ok(subject)
    }

    /// Look up, authenticate, and check the request is still pending.
    async fn pending_request_for(
        &self,
        user_code: &str,
        bearer: &str,
    ) -> Result<(AuthorizationRequest, String), DeviceError> {
        if !codes::is_valid_user_code(user_code) {
            return Err(DeviceError::InvalidRequest(
                "user_code is malformed".to_string(),
            ));
        }

        let request = match self
            .bounded("store lookup", self.store.get_by_user_code(user_code))
            .await?
        {
            Lookup::Live(request) => request,
            Lookup::Expired { .. } => return Err(DeviceError::Expired),
            Lookup::Absent => return Err(DeviceError::NotFound),
        };
        if request.is_expired_at(self.clock.now()) {
            return Err(DeviceError::Expired);
        }

        let subject = self
            .bounded("credential verification", self.verifier.verify(bearer))
            .await?
            .ok_or(DeviceError::Unauthenticated)?;

        match request.status {
            RequestStatus::Pending => Ok((request, subject)),
            RequestStatus::Authorized { .. } | RequestStatus::Denied => {
                Err(DeviceError::AlreadyActedOn)
            }
        }
    }

    async fn resolve(
        &self,
        request: &AuthorizationRequest,
        resolution: Resolution,
    ) -> Result<(), DeviceError> {
        match self
            .bounded(
                "store transition",
                self.store.transition(&request.device_code, resolution),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Lost the race: someone else resolved it, or the deadline passed meanwhile
            Err(DeviceError::Store(StoreError::InvalidState)) => {
                if request.is_expired_at(self.clock.now()) {
                    Err(DeviceError::Expired)
                } else {
                    Err(DeviceError::AlreadyActedOn)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// One poll from the device. Tokens are handed out at most once.
    pub async fn poll(
        &self,
        device_code: &str,
        client_id: &str,
    ) -> Result<PollOutcome, DeviceError> {
        let request = match self
            .bounded("store lookup", self.store.get_by_device_code(device_code))
            .await?
        {
            Lookup::Absent => return Ok(PollOutcome::NotFound),
            Lookup::Expired {
                device_code,
                client_id: owner,
            } => {
                if owner != client_id {
                    return Ok(PollOutcome::ClientMismatch);
                }
                self.discard(&device_code).await;
                return Ok(PollOutcome::Expired);
            }
            Lookup::Live(request) => request,
        };

        // Before anything status-revealing
        if request.client_id != client_id {
            debug!(expected = %request.client_id, got = client_id, "poll from wrong client");
            return Ok(PollOutcome::ClientMismatch);
        }

        if request.is_expired_at(self.clock.now()) {
            self.discard(&request.device_code).await;
            return Ok(PollOutcome::Expired);
        }

        match request.status {
            RequestStatus::Pending => Ok(PollOutcome::Pending {
                interval: request.interval,
            }),
            RequestStatus::Denied => {
                self.discard(&request.device_code).await;
                Ok(PollOutcome::Denied)
            }
            RequestStatus::Authorized { .. } => {
                let delivered = self
                    .bounded(
                        "store fetch_and_delete",
                        self.store.fetch_and_delete(&request.device_code),
                    )
                    .await?;
                match delivered.map(|r| r.status) {
                    Some(RequestStatus::Authorized { subject, tokens }) => {
                        info!(client_id, subject = %subject, "Delivered device tokens");
                        Ok(PollOutcome::Delivered(tokens))
                    }
                    // Another poll won the delete, or the record expired in between
                    _ => Ok(PollOutcome::NotFound),
                }
            }
        }
    }

    async fn discard(&self, device_code: &str) {
        if let Err(e) = self
            .bounded("store delete", self.store.delete(device_code))
            .await
        {
            warn!(error = %e, "failed to delete finished device code");
        }
    }

    fn validate_client(&self, client_id: &str) -> Result<(), DeviceError> {
        if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(DeviceError::InvalidRequest(
                "client_id is required".to_string(),
            ));
        }
        if !client_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
        {
            return Err(DeviceError::InvalidRequest(
                "client_id contains invalid characters".to_string(),
            ));
        }
        if !self.policy.clients.is_empty()
            && !self.policy.clients.iter().any(|c| c == client_id)
        {
            return Err(DeviceError::InvalidRequest("unknown client_id".to_string()));
        }
        Ok(())
    }
}

fn validate_tokens(tokens: &TokenBundle) -> Result<(), DeviceError> {
    for (name, value) in [
        ("access_token", &tokens.access_token),
        ("id_token", &tokens.id_token),
        ("refresh_token", &tokens.refresh_token),
    ] {
        if value.trim().is_empty() {
            return Err(DeviceError::InvalidRequest(format!("{} is required", name)));
        }
    }
    Ok(())
}

/// RFC 6749 §3.3: space separated tokens of `%x21 / %x23-5B / %x5D-7E`.
fn validate_scope(scope: &str) -> Result<(), DeviceError> {
    let valid = scope.len() <= MAX_SCOPE_LEN
        && scope.split(' ').all(|token| {
            !token.is_empty()
                && token
                    .bytes()
                    .all(|b| b == 0x21 || (0x23..=0x5B).contains(&b) || (0x5D..=0x7E).contains(&b))
        });
    if valid {
        Ok(())
    } else {
        Err(DeviceError::InvalidRequest("scope is malformed".to_string()))
    }
}
