//! Persisted endpoint store
//!
//! The store is the single source of truth for desired state across
//! orchestrator restarts. The orchestrator only caches it.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::{EndpointTable, MemoryStore};

use async_trait::async_trait;

use rf_core::error::StoreError;
use rf_core::{Endpoint, EndpointId, LifecycleState, NewEndpoint};

/// Access to persisted endpoint records
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Load every endpoint
    async fn load_all(&self) -> Result<Vec<Endpoint>, StoreError>;

    /// Get one endpoint
    async fn get(&self, id: EndpointId) -> Result<Endpoint, StoreError>;

    /// Create an endpoint in `stopped` state. Fails on a duplicate listen port.
    async fn insert(&self, new: NewEndpoint) -> Result<Endpoint, StoreError>;

    /// Replace an endpoint's configuration, keeping its state and timestamps
    async fn update(&self, id: EndpointId, new: NewEndpoint) -> Result<Endpoint, StoreError>;

    /// Persist a lifecycle state and bump `updated_at`
    async fn update_status(
        &self,
        id: EndpointId,
        state: LifecycleState,
    ) -> Result<Endpoint, StoreError>;

    /// Delete an endpoint
    async fn remove(&self, id: EndpointId) -> Result<Endpoint, StoreError>;
}
