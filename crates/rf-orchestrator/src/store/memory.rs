//! In-memory endpoint store

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use rf_core::error::StoreError;
use rf_core::time::current_time_millis;
use rf_core::{Endpoint, EndpointId, LifecycleState, NewEndpoint};

use super::EndpointStore;

/// Endpoint records plus the ID sequence.
///
/// Shared by the in-memory and file-backed stores; all constraint checks
/// live here.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    next_id: u64,
    endpoints: BTreeMap<EndpointId, Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from persisted records
    pub fn from_records(next_id: u64, records: Vec<Endpoint>) -> Self {
        let endpoints: BTreeMap<_, _> = records.into_iter().map(|e| (e.id, e)).collect();
        let mut table = Self { next_id, endpoints };
        table.next_id = table.next_id.max(table.max_id());
        table
    }

    /// Last assigned ID
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn list(&self) -> Vec<Endpoint> {
        self.endpoints.values().cloned().collect()
    }

    pub fn get(&self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.endpoints
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Reject `port` if an endpoint other than `except` already uses it
    fn check_port(&self, port: u16, except: Option<EndpointId>) -> Result<(), StoreError> {
        match self
            .endpoints
            .values()
            .find(|e| e.listen_port == port && Some(e.id) != except)
        {
            Some(owner) => Err(StoreError::DuplicatePort {
                port,
                owner: owner.id,
            }),
            None => Ok(()),
        }
    }

    pub fn insert(&mut self, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.check_port(new.listen_port, None)?;

        // IDs start at 1 and are never reused
        self.next_id += 1;
        let id = EndpointId::new(self.next_id);
        let endpoint = Endpoint::from_new(id, new, current_time_millis());
        self.endpoints.insert(id, endpoint.clone());
        Ok(endpoint)
    }

    pub fn update(&mut self, id: EndpointId, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.check_port(new.listen_port, Some(id))?;

        let endpoint = self.endpoints.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        endpoint.name = new.name;
        endpoint.backend = new.backend;
        endpoint.listen_port = new.listen_port;
        endpoint.psk = new.psk;
        endpoint.users = new.users;
        endpoint.expires_at = new.expires_at;
        endpoint.updated_at = current_time_millis();
        Ok(endpoint.clone())
    }

    pub fn update_status(
        &mut self,
        id: EndpointId,
        state: LifecycleState,
    ) -> Result<Endpoint, StoreError> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let now = current_time_millis();
        endpoint.state = state;
        endpoint.updated_at = now;
        if state == LifecycleState::Running {
            endpoint.last_healthy_at = Some(now);
        }
        Ok(endpoint.clone())
    }

    pub fn remove(&mut self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.endpoints.remove(&id).ok_or(StoreError::NotFound(id))
    }

    fn max_id(&self) -> u64 {
        self.endpoints.keys().last().map(|id| id.get()).unwrap_or(0)
    }
}

/// Store that keeps endpoints in memory only
#[derive(Default)]
pub struct MemoryStore {
    table: RwLock<EndpointTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.table.read().await.list())
    }

    async fn get(&self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.table.read().await.get(id)
    }

    async fn insert(&self, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.table.write().await.insert(new)
    }

    async fn update(&self, id: EndpointId, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.table.write().await.update(id, new)
    }

    async fn update_status(
        &self,
        id: EndpointId,
        state: LifecycleState,
    ) -> Result<Endpoint, StoreError> {
        self.table.write().await.update_status(id, state)
    }

    async fn remove(&self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.table.write().await.remove(id)
    }
}
