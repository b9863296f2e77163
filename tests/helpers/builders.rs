use async_trait::async_trait;
use devicelink::clock::ManualClock;
use devicelink::errors::DeviceLinkError;
use devicelink::identity::BearerVerifier;
use devicelink::service::DeviceAuthorizationService;
use devicelink::settings::Device;
use devicelink::store::{CodeStore, MemoryCodeStore, TokenBundle};
use std::sync::Arc;
use tokio::sync::Barrier;

/// Accepts bearers of the form `valid-<subject>`.
pub struct PrefixVerifier;

#[async_trait]
impl BearerVerifier for PrefixVerifier {
    async fn verify(&self, bearer: &str) -> Result<Option<String>, DeviceLinkError> {
        Ok(bearer.strip_prefix("valid-").map(str::to_string))
    }
}

/// Like [`PrefixVerifier`], but holds callers until `parties` are verifying at
/// once. Every racer has then read the request as pending.
pub struct RacingVerifier {
    barrier: Barrier,
}

impl RacingVerifier {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl BearerVerifier for RacingVerifier {
    async fn verify(&self, bearer: &str) -> Result<Option<String>, DeviceLinkError> {
        self.barrier.wait().await;
        Ok(bearer.strip_prefix("valid-").map(str::to_string))
    }
}

/// Tokens the second screen hands over for `subject`.
pub fn tokens(subject: &str) -> TokenBundle {
    TokenBundle {
        access_token: format!("valid-{}", subject),
        id_token: format!("id-{}", subject),
        refresh_token: format!("refresh-{}", subject),
    }
}

/// Builder for a device authorization service under a manual clock
pub struct ServiceBuilder {
    clock: Arc<ManualClock>,
    policy: Device,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(1_700_000_000)),
            policy: Device::default(),
        }
    }

    pub fn with_clients(mut self, clients: &[&str]) -> Self {
        self.policy.clients = clients.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_code_ttl(mut self, secs: i64) -> Self {
        self.policy.code_ttl_secs = secs;
        self
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    pub fn policy(&self) -> Device {
        self.policy.clone()
    }

    /// Build over the given store
    pub fn build(self, store: Arc<dyn CodeStore>) -> DeviceAuthorizationService {
        self.build_with_verifier(store, Arc::new(PrefixVerifier))
    }

    pub fn build_with_verifier(
        self,
        store: Arc<dyn CodeStore>,
        verifier: Arc<dyn BearerVerifier>,
    ) -> DeviceAuthorizationService {
        DeviceAuthorizationService::new(store, verifier, self.clock, self.policy)
    }

    /// Build over a fresh in-memory store sharing the builder's clock
    pub fn build_in_memory(self) -> DeviceAuthorizationService {
        let store = Arc::new(MemoryCodeStore::new(self.clock.clone()));
        self.build(store)
    }
}
