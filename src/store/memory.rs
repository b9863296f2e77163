use super::{AuthorizationRequest, CodeStore, Lookup, RequestStatus, Resolution};
use crate::clock::Clock;
use crate::codes;
use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    by_device_code: HashMap<String, AuthorizationRequest>,
    // normalized user code -> device code
    by_user_code: HashMap<String, String>,
}

impl Tables {
    fn remove(&mut self, device_code: &str) -> Option<AuthorizationRequest> {
        let request = self.by_device_code.remove(device_code)?;
        self.by_user_code.remove(&request.user_code);
        Some(request)
    }

    fn lookup(&self, device_code: &str, now: i64) -> Lookup {
        match self.by_device_code.get(device_code) {
            Some(request) if request.is_expired_at(now) => Lookup::Expired {
                device_code: request.device_code.clone(),
                client_id: request.client_id.clone(),
            },
            Some(request) => Lookup::Live(request.clone()),
            None => Lookup::Absent,
        }
    }
}

/// Single-process store: one mutex guards both indexes, which makes every
/// operation atomic.
#[derive(Clone)]
pub struct MemoryCodeStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCodeStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // No operation leaves the tables half-written, so a poisoned lock is still usable.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tables().by_device_code.len()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn create(&self, request: &AuthorizationRequest) -> Result<(), StoreError> {
        let now = self.clock.now();
        let user_code = codes::normalize(&request.user_code);
        let mut tables = self.tables();

        // Reclaim codes still held by expired rows
        let stale_owner = tables.by_user_code.get(&user_code).cloned();
        for device_code in [Some(request.device_code.clone()), stale_owner]
            .into_iter()
            .flatten()
        {
            let expired = tables
                .by_device_code
                .get(&device_code)
                .map(|existing| existing.is_expired_at(now));
            match expired {
                Some(true) => {
                    tables.remove(&device_code);
                }
                Some(false) => return Err(StoreError::AlreadyExists),
                None => {}
            }
        }

        let mut stored = request.clone();
        stored.user_code = user_code.clone();
        tables
            .by_user_code
            .insert(user_code, stored.device_code.clone());
        tables
            .by_device_code
            .insert(stored.device_code.clone(), stored);
        Ok(())
    }

    async fn get_by_device_code(&self, device_code: &str) -> Result<Lookup, StoreError> {
        Ok(self.tables().lookup(device_code, self.clock.now()))
    }

    async fn get_by_user_code(&self, user_code: &str) -> Result<Lookup, StoreError> {
        let tables = self.tables();
        match tables.by_user_code.get(&codes::normalize(user_code)) {
            Some(device_code) => Ok(tables.lookup(device_code, self.clock.now())),
            None => Ok(Lookup::Absent),
        }
    }

    async fn transition(
        &self,
        device_code: &str,
        resolution: Resolution,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables();
        match tables.by_device_code.get_mut(device_code) {
            Some(request) if request.status.is_pending() && !request.is_expired_at(now) => {
                request.status = resolution.into();
                Ok(())
            }
            _ => Err(StoreError::InvalidState),
        }
    }

    async fn fetch_and_delete(
        &self,
        device_code: &str,
    ) -> Result<Option<AuthorizationRequest>, StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables();
        let deliverable = matches!(
            tables.by_device_code.get(device_code),
            Some(request) if !request.is_expired_at(now)
                && matches!(request.status, RequestStatus::Authorized { .. })
        );
        if !deliverable {
            return Ok(None);
        }
        Ok(tables.remove(device_code))
    }

    async fn delete(&self, device_code: &str) -> Result<(), StoreError> {
        self.tables().remove(device_code);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables();
        let expired: Vec<String> = tables
            .by_device_code
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.device_code.clone())
            .collect();
        for device_code in &expired {
            tables.remove(device_code);
        }
        Ok(expired.len() as u64)
    }
}
