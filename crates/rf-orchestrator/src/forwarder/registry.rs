//! Registry of forwarders keyed by listen port
//!
//! Holds the cached endpoint record for every known listen port and at most
//! one live [`ForwarderInstance`] per port. Creation and destruction on a port
//! are serialized by a per-port lock so a lifecycle operation and the health
//! monitor never race on the same port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rf_core::config::ForwarderConfig;
use rf_core::error::ForwarderError;
use rf_core::{Endpoint, EndpointId};

use super::engine::{ForwarderInstance, ForwarderSpec};
use super::probe::{check_port_available, probe_liveness};
use crate::telemetry::{StatsHandle, TrafficTelemetry};

struct PortEntry {
    endpoint: Endpoint,
    instance: Option<Arc<ForwarderInstance>>,
}

/// Owner of all forwarders
pub struct ForwarderRegistry {
    entries: RwLock<HashMap<u16, PortEntry>>,
    port_locks: DashMap<u16, Arc<Mutex<()>>>,
    config: ForwarderConfig,
    probe_timeout: Duration,
    telemetry: Arc<TrafficTelemetry>,
    cancel: CancellationToken,
    loops: TaskTracker,
}

impl ForwarderRegistry {
    /// Create a registry.
    ///
    /// Forwarders stop when `cancel` fires; their telemetry loops are spawned
    /// on `loops`.
    pub fn new(
        config: ForwarderConfig,
        probe_timeout: Duration,
        telemetry: Arc<TrafficTelemetry>,
        cancel: CancellationToken,
        loops: TaskTracker,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            port_locks: DashMap::new(),
            config,
            probe_timeout,
            telemetry,
            cancel,
            loops,
        }
    }

    fn port_lock(&self, port: u16) -> Arc<Mutex<()>> {
        Arc::clone(self.port_locks.entry(port).or_default().value())
    }

    fn conflict(entries: &HashMap<u16, PortEntry>, endpoint: &Endpoint) -> Option<EndpointId> {
        entries
            .get(&endpoint.listen_port)
            .map(|entry| entry.endpoint.id)
            .filter(|owner| *owner != endpoint.id)
    }

    /// Cache an endpoint record under its listen port.
    ///
    /// Re-registering the same endpoint refreshes the record and keeps any
    /// running instance; a port owned by another endpoint is a conflict.
    pub async fn register(&self, endpoint: &Endpoint) -> Result<(), ForwarderError> {
        let mut entries = self.entries.write().await;
        if let Some(owner) = Self::conflict(&entries, endpoint) {
            return Err(ForwarderError::PortConflict {
                port: endpoint.listen_port,
                owner,
            });
        }
        entries
            .entry(endpoint.listen_port)
            .and_modify(|entry| entry.endpoint = endpoint.clone())
            .or_insert_with(|| PortEntry {
                endpoint: endpoint.clone(),
                instance: None,
            });
        Ok(())
    }

    /// Destroy any instance on `port` and forget the cached record
    pub async fn unregister(&self, port: u16) -> Option<Endpoint> {
        let lock = self.port_lock(port);
        let _guard = lock.lock().await;

        let entry = self.entries.write().await.remove(&port)?;
        if let Some(instance) = entry.instance {
            instance.close().await;
        }
        Some(entry.endpoint)
    }

    /// Cached record of the endpoint on `port`
    pub async fn endpoint(&self, port: u16) -> Option<Endpoint> {
        self.entries
            .read()
            .await
            .get(&port)
            .map(|entry| entry.endpoint.clone())
    }

    /// Launch a forwarder for `endpoint`, replacing any existing one.
    ///
    /// The old instance is torn down before the port is probed, so the port is
    /// never bound twice. No instance is registered unless it passed the
    /// liveness probe.
    pub async fn create_or_replace(&self, endpoint: &Endpoint) -> Result<(), ForwarderError> {
        if self.cancel.is_cancelled() {
            return Err(ForwarderError::ShutDown);
        }
        let port = endpoint.listen_port;
        let lock = self.port_lock(port);
        let _guard = lock.lock().await;

        // Check ownership and take the old instance in one critical section
        let old = {
            let mut entries = self.entries.write().await;
            if let Some(owner) = Self::conflict(&entries, endpoint) {
                return Err(ForwarderError::PortConflict { port, owner });
            }
            entries.get_mut(&port).and_then(|entry| entry.instance.take())
        };
        if let Some(old) = old {
            tracing::debug!("Replacing forwarder on port {}", port);
            old.close().await;
        }

        check_port_available(self.config.bind_address, port)?;

        let key = endpoint.stats_key();
        let spec = ForwarderSpec {
            listen_port: port,
            bind_address: self.config.bind_address,
            backend_host: endpoint.backend.host.clone(),
            backend_port: self.config.backend_port,
            connect_timeout: self.config.backend_connect_timeout,
            udp_idle: self.config.udp_session_idle,
            stats: Some(StatsHandle::new(Arc::clone(&self.telemetry), key.clone())),
        };
        let instance = ForwarderInstance::launch(spec, &self.cancel).await?;

        if let Err(message) = probe_liveness(instance.probe_addr(), self.probe_timeout).await {
            instance.close().await;
            return Err(ForwarderError::Probe { port, message });
        }
        let instance = Arc::new(instance);

        self.telemetry.ensure(&key).await;
        self.telemetry
            .spawn_refresh(key, instance.cancel_token(), &self.loops);

        self.entries.write().await.insert(
            port,
            PortEntry {
                endpoint: endpoint.clone(),
                instance: Some(instance),
            },
        );
        tracing::info!(
            "Forwarder for endpoint {} on port {} -> {}:{}",
            endpoint.id,
            port,
            endpoint.backend.host,
            self.config.backend_port
        );
        Ok(())
    }

    /// Stop the forwarder on `port`. Destroying a port without one succeeds.
    pub async fn destroy(&self, port: u16) -> Result<(), ForwarderError> {
        let lock = self.port_lock(port);
        let _guard = lock.lock().await;

        let instance = self
            .entries
            .write()
            .await
            .get_mut(&port)
            .and_then(|entry| entry.instance.take());
        if let Some(instance) = instance {
            instance.close().await;
        }
        Ok(())
    }

    /// Whether a live forwarder on `port` answers a probe within `timeout`
    pub async fn is_healthy(&self, port: u16, timeout: Duration) -> bool {
        let Some(instance) = self.instance(port).await else {
            return false;
        };
        instance.is_alive() && probe_liveness(instance.probe_addr(), timeout).await.is_ok()
    }

    /// Instance registered on `port`
    pub async fn instance(&self, port: u16) -> Option<Arc<ForwarderInstance>> {
        self.entries
            .read()
            .await
            .get(&port)
            .and_then(|entry| entry.instance.clone())
    }

    /// Number of registered instances
    pub async fn active_forwarders(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.instance.is_some())
            .count()
    }

    /// Open TCP connections plus UDP sessions across all instances
    pub async fn active_connections(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|entry| entry.instance.as_ref())
            .map(|instance| instance.active_connections())
            .sum()
    }

    /// Close every instance, keeping the cached records
    pub async fn shutdown(&self) {
        let instances: Vec<_> = {
            let mut entries = self.entries.write().await;
            entries
                .values_mut()
                .filter_map(|entry| entry.instance.take())
                .collect()
        };
        let count = instances.len();
        join_all(instances.iter().map(|instance| instance.close())).await;
        tracing::info!("Closed {} forwarders", count);
    }
}
