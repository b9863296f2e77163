//! Bearer credential verification against the identity provider.
//!
//! The device flow never authenticates users itself. The second screen logs in
//! with the identity provider and presents the resulting access token; a
//! [`BearerVerifier`] turns that into a subject identifier.

use crate::errors::DeviceLinkError;
use crate::settings::Identity;
use async_trait::async_trait;
use josekit::jwk::{Jwk, JwkSet};
use josekit::jws::alg::rsassa::RsassaJwsVerifier;
use josekit::jws::{JwsHeader, JwsVerifier, RS256};
use josekit::jwt::{self, JwtPayloadValidator};
use josekit::JoseError;
use std::fs;
use std::sync::Arc;

#[async_trait]
pub trait BearerVerifier: Send + Sync {
    /// `Ok(Some(subject))` for a valid credential, `Ok(None)` when the
    /// credential is rejected, `Err` when verification itself failed.
    async fn verify(&self, bearer: &str) -> Result<Option<String>, DeviceLinkError>;
}

/// Verifies RS256 JWT access tokens with the identity provider's published keys.
#[derive(Clone)]
pub struct JwksVerifier {
    verifiers: Arc<Vec<(Option<String>, RsassaJwsVerifier)>>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwksVerifier {
    pub fn load(cfg: &Identity) -> Result<Self, DeviceLinkError> {
        let bytes = fs::read(&cfg.jwks_path)?;
        let jwks = JwkSet::from_bytes(&bytes)?;
        Self::from_keys(jwks.keys().into_iter(), cfg)
    }

    pub fn from_keys<'a>(
        keys: impl Iterator<Item = &'a Jwk>,
        cfg: &Identity,
    ) -> Result<Self, DeviceLinkError> {
        let mut verifiers = Vec::new();
        for jwk in keys {
            if jwk.key_type() != "RSA" {
                continue;
            }
            if matches!(jwk.algorithm(), Some(alg) if alg != "RS256") {
                continue;
            }
            let verifier = RS256.verifier_from_jwk(jwk)?;
            verifiers.push((jwk.key_id().map(str::to_string), verifier));
        }

        if verifiers.is_empty() {
            return Err(DeviceLinkError::Other(format!(
                "no RS256 keys in identity provider JWKS {}",
                cfg.jwks_path.display()
            )));
        }

        tracing::info!(keys = verifiers.len(), "Loaded identity provider keys");

        Ok(Self {
            verifiers: Arc::new(verifiers),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        })
    }

    fn select<'a>(
        verifiers: &'a [(Option<String>, RsassaJwsVerifier)],
        header: &JwsHeader,
    ) -> Result<Option<&'a dyn JwsVerifier>, JoseError> {
        let found = match header.key_id() {
            Some(kid) => verifiers
                .iter()
                .find(|(key_id, _)| key_id.as_deref() == Some(kid)),
            None if verifiers.len() == 1 => verifiers.first(),
            None => None,
        };
        Ok(found.map(|(_, v)| v as &dyn JwsVerifier))
    }
}

#[async_trait]
impl BearerVerifier for JwksVerifier {
    async fn verify(&self, bearer: &str) -> Result<Option<String>, DeviceLinkError> {
        let verifiers = self.verifiers.as_slice();
        let payload = match jwt::decode_with_verifier_selector(bearer, |header| {
            Self::select(verifiers, header)
        }) {
            Ok((payload, _header)) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "bearer token rejected");
                return Ok(None);
            }
        };

        if payload.expires_at().is_none() {
            tracing::debug!("bearer token has no exp claim");
            return Ok(None);
        }

        let mut validator = JwtPayloadValidator::new();
        if let Some(issuer) = &self.issuer {
            validator.set_issuer(issuer);
        }
        if let Some(audience) = &self.audience {
            validator.set_audience(audience);
        }
        if let Err(e) = validator.validate(&payload) {
            tracing::debug!(error = %e, "bearer token claims rejected");
            return Ok(None);
        }

        Ok(payload.subject().map(str::to_string))
    }
}
