//! Lifecycle orchestration of endpoints
//!
//! Requests are validated and the desired state is flipped synchronously; the
//! remote procedure then runs on a tracked background task that relays each
//! step to the push channel and settles the endpoint in `running`, `stopped`
//! or `error`.
//!
//! At most one operation owns an endpoint at a time. Ownership is claimed in
//! a concurrent map before the store is touched, so a second request while one
//! is in flight is rejected rather than queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rf_core::error::{ForwarderError, LifecycleError, RelayError, StoreError};
use rf_core::ipc::{ContainerState, EndpointInfo, RuntimeStatus, SystemSummary, TrafficReport};
use rf_core::time::{current_time_millis, format_uptime};
use rf_core::{Endpoint, EndpointId, LifecycleState, NewEndpoint};

use crate::events::EventHub;
use crate::forwarder::ForwarderRegistry;
use crate::remote::{NullSink, ProgressEvent, ProgressSink, RemoteDriver};
use crate::store::EndpointStore;
use crate::telemetry::TrafficTelemetry;

/// Step name used when the forwarder cannot be created after a remote start
const FORWARDER_STEP: &str = "forwarder";

/// Kind of operation currently owning an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Starting,
    Stopping,
    Editing,
    Recovering,
}

/// Outcome of [`LifecycleManager::recover_forwarder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// A fresh forwarder replaced the dead one
    Recovered,
    /// Nothing to do: the endpoint is owned by an operation, gone, no longer
    /// `running`, or its forwarder is healthy again
    Skipped,
}

/// Releases an endpoint's claim when dropped
struct ClaimGuard {
    claims: Arc<DashMap<EndpointId, Claim>>,
    id: EndpointId,
}

impl ClaimGuard {
    fn set(&self, claim: Claim) {
        if let Some(mut current) = self.claims.get_mut(&self.id) {
            *current = claim;
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

/// Relays driver steps to observers as `[step] detail`
struct BroadcastSink {
    events: EventHub,
    id: EndpointId,
    state: LifecycleState,
}

impl ProgressSink for BroadcastSink {
    fn report(&self, event: ProgressEvent) {
        let state = if event.success {
            self.state
        } else {
            LifecycleState::Error
        };
        tracing::debug!("Endpoint {} {}", self.id, event.message());
        self.events.status(self.id, state.as_str(), event.message());
    }
}

/// Drives endpoints through their lifecycle
pub struct LifecycleManager {
    store: Arc<dyn EndpointStore>,
    driver: Arc<RemoteDriver>,
    registry: Arc<ForwarderRegistry>,
    telemetry: Arc<TrafficTelemetry>,
    events: EventHub,
    claims: Arc<DashMap<EndpointId, Claim>>,
    last_errors: DashMap<EndpointId, String>,
    operations: TaskTracker,
    cancel: CancellationToken,
    restart_settle: Duration,
    started_at: Instant,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EndpointStore>,
        driver: Arc<RemoteDriver>,
        registry: Arc<ForwarderRegistry>,
        telemetry: Arc<TrafficTelemetry>,
        events: EventHub,
        operations: TaskTracker,
        cancel: CancellationToken,
        restart_settle: Duration,
    ) -> Self {
        Self {
            store,
            driver,
            registry,
            telemetry,
            events,
            claims: Arc::new(DashMap::new()),
            last_errors: DashMap::new(),
            operations,
            cancel,
            restart_settle,
            started_at: Instant::now(),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn EndpointStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ForwarderRegistry> {
        &self.registry
    }

    /// Whether an operation currently owns the endpoint
    pub fn is_claimed(&self, id: EndpointId) -> bool {
        self.claims.contains_key(&id)
    }

    /// Last failure message recorded for the endpoint
    pub fn last_error(&self, id: EndpointId) -> Option<String> {
        self.last_errors.get(&id).map(|e| e.value().clone())
    }

    fn claim(&self, id: EndpointId, claim: Claim) -> Result<ClaimGuard, LifecycleError> {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }
        match self.claims.entry(id) {
            Entry::Occupied(held) => Err(match *held.get() {
                Claim::Starting => LifecycleError::AlreadyStarting(id),
                Claim::Stopping => LifecycleError::AlreadyStopping(id),
                Claim::Editing => LifecycleError::Busy {
                    id,
                    state: LifecycleState::Stopped,
                },
                Claim::Recovering => LifecycleError::Busy {
                    id,
                    state: LifecycleState::Running,
                },
            }),
            Entry::Vacant(slot) => {
                slot.insert(claim);
                Ok(ClaimGuard {
                    claims: Arc::clone(&self.claims),
                    id,
                })
            }
        }
    }

    async fn get(&self, id: EndpointId) -> Result<Endpoint, LifecycleError> {
        self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            other => LifecycleError::Store(other),
        })
    }

    /// Persist a state, refresh the cached record and broadcast it
    async fn transition(
        &self,
        id: EndpointId,
        state: LifecycleState,
        message: impl Into<String>,
    ) -> Result<Endpoint, LifecycleError> {
        let endpoint = self.store.update_status(id, state).await?;
        if let Err(e) = self.registry.register(&endpoint).await {
            tracing::warn!("Cached record of endpoint {} not refreshed: {}", id, e);
        }
        self.events.status(id, state.as_str(), message);
        Ok(endpoint)
    }

    /// Record a failure and settle the endpoint in `error`
    async fn fail(&self, id: EndpointId, message: String) {
        tracing::warn!("Endpoint {} failed: {}", id, message);
        self.last_errors.insert(id, message.clone());
        if let Err(e) = self.transition(id, LifecycleState::Error, message).await {
            tracing::error!("Failed to persist error state of endpoint {}: {}", id, e);
        }
    }

    fn check_startable(endpoint: &Endpoint) -> Result<(), LifecycleError> {
        let id = endpoint.id;
        match endpoint.state {
            LifecycleState::Running => Err(LifecycleError::AlreadyRunning(id)),
            LifecycleState::Starting => Err(LifecycleError::AlreadyStarting(id)),
            LifecycleState::Stopping => Err(LifecycleError::AlreadyStopping(id)),
            LifecycleState::Stopped | LifecycleState::Error => {
                if endpoint.is_expired(current_time_millis()) {
                    Err(LifecycleError::Expired(id))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Start an endpoint.
    ///
    /// Returns once the endpoint is persisted as `starting`; the remote start
    /// and forwarder creation continue in the background.
    pub async fn start_endpoint(self: &Arc<Self>, id: EndpointId) -> Result<Endpoint, LifecycleError> {
        let guard = self.claim(id, Claim::Starting)?;
        let endpoint = self.get(id).await?;
        Self::check_startable(&endpoint)?;

        let endpoint = self
            .transition(id, LifecycleState::Starting, LifecycleState::Starting.message())
            .await?;

        let this = Arc::clone(self);
        let target = endpoint.clone();
        self.operations.spawn(async move {
            this.run_start(target).await;
            drop(guard);
        });
        Ok(endpoint)
    }

    /// Stop an endpoint. Returns once it is persisted as `stopping`.
    pub async fn stop_endpoint(self: &Arc<Self>, id: EndpointId) -> Result<Endpoint, LifecycleError> {
        let guard = self.claim(id, Claim::Stopping)?;
        let endpoint = self.get(id).await?;
        match endpoint.state {
            LifecycleState::Stopped => return Err(LifecycleError::AlreadyStopped(id)),
            LifecycleState::Stopping => return Err(LifecycleError::AlreadyStopping(id)),
            LifecycleState::Starting => return Err(LifecycleError::AlreadyStarting(id)),
            LifecycleState::Running | LifecycleState::Error => {}
        }

        let endpoint = self
            .transition(id, LifecycleState::Stopping, LifecycleState::Stopping.message())
            .await?;

        let this = Arc::clone(self);
        let target = endpoint.clone();
        self.operations.spawn(async move {
            this.run_stop(target).await;
            drop(guard);
        });
        Ok(endpoint)
    }

    /// Restart an endpoint.
    ///
    /// A running endpoint is stopped, and after the stop succeeded and the
    /// settle delay passed, started again. A stopped or failed endpoint is
    /// simply started.
    pub async fn restart_endpoint(
        self: &Arc<Self>,
        id: EndpointId,
    ) -> Result<Endpoint, LifecycleError> {
        let guard = self.claim(id, Claim::Stopping)?;
        let endpoint = self.get(id).await?;

        if endpoint.state != LifecycleState::Running {
            Self::check_startable(&endpoint)?;
            guard.set(Claim::Starting);
            let endpoint = self
                .transition(id, LifecycleState::Starting, LifecycleState::Starting.message())
                .await?;
            let this = Arc::clone(self);
            let target = endpoint.clone();
            self.operations.spawn(async move {
                this.run_start(target).await;
                drop(guard);
            });
            return Ok(endpoint);
        }

        let endpoint = self
            .transition(id, LifecycleState::Stopping, "Endpoint restarting...")
            .await?;

        let this = Arc::clone(self);
        let target = endpoint.clone();
        self.operations.spawn(async move {
            if !this.run_stop(target).await {
                return;
            }
            tokio::time::sleep(this.restart_settle).await;
            if this.cancel.is_cancelled() {
                tracing::info!("Shutdown interrupted restart of endpoint {}", id);
                return;
            }

            guard.set(Claim::Starting);
            let endpoint = match this.get(id).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("Restart of endpoint {} abandoned: {}", id, e);
                    return;
                }
            };
            if let Err(e) = Self::check_startable(&endpoint) {
                this.fail(id, e.to_string()).await;
                return;
            }
            match this
                .transition(id, LifecycleState::Starting, LifecycleState::Starting.message())
                .await
            {
                Ok(endpoint) => this.run_start(endpoint).await,
                Err(e) => tracing::error!("Restart of endpoint {} failed: {}", id, e),
            }
            drop(guard);
        });
        Ok(endpoint)
    }

    /// Background half of a start
    async fn run_start(&self, endpoint: Endpoint) {
        let id = endpoint.id;
        let sink = BroadcastSink {
            events: self.events.clone(),
            id,
            state: LifecycleState::Starting,
        };

        if let Err(e) = self.driver.start(&endpoint, &sink).await {
            self.fail(id, e.to_string()).await;
            return;
        }
        match self.registry.create_or_replace(&endpoint).await {
            Ok(()) => {}
            // The backend is up; the next load restores the forwarder
            Err(ForwarderError::ShutDown) => {
                tracing::info!(
                    "Endpoint {} started during shutdown, forwarder deferred to next load",
                    id
                );
            }
            Err(e) => {
                self.fail(id, format!("[{}] {}", FORWARDER_STEP, e)).await;
                return;
            }
        }

        self.last_errors.remove(&id);
        if let Err(e) = self
            .transition(id, LifecycleState::Running, LifecycleState::Running.message())
            .await
        {
            tracing::error!("Failed to persist running state of endpoint {}: {}", id, e);
        }
    }

    /// Background half of a stop. Returns whether the endpoint stopped.
    async fn run_stop(&self, endpoint: Endpoint) -> bool {
        let id = endpoint.id;
        let sink = BroadcastSink {
            events: self.events.clone(),
            id,
            state: LifecycleState::Stopping,
        };

        if let Err(e) = self.driver.stop(&endpoint, &sink).await {
            self.fail(id, e.to_string()).await;
            return false;
        }
        if let Err(e) = self.registry.destroy(endpoint.listen_port).await {
            self.fail(id, format!("[{}] {}", FORWARDER_STEP, e)).await;
            return false;
        }

        self.last_errors.remove(&id);
        match self
            .transition(id, LifecycleState::Stopped, LifecycleState::Stopped.message())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to persist stopped state of endpoint {}: {}", id, e);
                false
            }
        }
    }

    /// Recreate the forwarder of a running endpoint whose forwarder is down.
    ///
    /// The endpoint is claimed and re-read from the store first, so a stop or
    /// removal that completed after the caller looked is never undone.
    pub async fn recover_forwarder(
        &self,
        id: EndpointId,
        probe_timeout: Duration,
    ) -> Result<Recovery, RelayError> {
        let Ok(_guard) = self.claim(id, Claim::Recovering) else {
            return Ok(Recovery::Skipped);
        };
        let endpoint = match self.get(id).await {
            Ok(endpoint) => endpoint,
            Err(LifecycleError::NotFound(_)) => return Ok(Recovery::Skipped),
            Err(e) => return Err(e.into()),
        };
        if endpoint.state != LifecycleState::Running {
            return Ok(Recovery::Skipped);
        }

        let port = endpoint.listen_port;
        if self.registry.is_healthy(port, probe_timeout).await {
            return Ok(Recovery::Skipped);
        }
        if let Err(e) = self.registry.destroy(port).await {
            tracing::debug!("Teardown of stale forwarder on port {} failed: {}", port, e);
        }
        self.registry.register(&endpoint).await?;
        self.registry.create_or_replace(&endpoint).await?;
        Ok(Recovery::Recovered)
    }

    /// Runtime status, including a live container query for running endpoints
    pub async fn endpoint_runtime_status(
        &self,
        id: EndpointId,
    ) -> Result<RuntimeStatus, LifecycleError> {
        let endpoint = self.get(id).await?;
        let forwarder_active = self.registry.instance(endpoint.listen_port).await.is_some();

        let mut uptime = None;
        let mut observed_error = None;
        let container_state = match endpoint.state {
            LifecycleState::Running => match self.driver.container_status(&endpoint).await {
                Ok(status) if status.running => {
                    uptime = status.uptime.map(format_uptime);
                    ContainerState::Running
                }
                Ok(_) => {
                    observed_error = Some("Container is not running".to_string());
                    ContainerState::Stopped
                }
                Err(e) => {
                    observed_error = Some(format!("Container status unavailable: {}", e));
                    ContainerState::Unknown
                }
            },
            LifecycleState::Starting => ContainerState::Starting,
            LifecycleState::Stopping => ContainerState::Stopping,
            LifecycleState::Stopped => ContainerState::Stopped,
            LifecycleState::Error => ContainerState::Error,
        };

        let now = current_time_millis();
        Ok(RuntimeStatus {
            endpoint_id: id,
            name: endpoint.name.clone(),
            backend_host: endpoint.backend.host.clone(),
            listen_port: endpoint.listen_port,
            state: endpoint.state,
            container_state,
            uptime,
            forwarder_active,
            message: endpoint.state.message().to_string(),
            last_error: observed_error.or_else(|| self.last_error(id)),
            is_expired: endpoint.is_expired(now),
            updated_at: endpoint.updated_at,
        })
    }

    /// Traffic of every forwarder plus totals
    pub async fn aggregate_traffic(&self) -> TrafficReport {
        self.telemetry.snapshot().await
    }

    /// Fleet-wide counts
    pub async fn system_summary(&self) -> Result<SystemSummary, LifecycleError> {
        let endpoints = self.store.load_all().await?;
        Ok(SystemSummary {
            total_endpoints: endpoints.len(),
            running_endpoints: endpoints
                .iter()
                .filter(|e| e.state == LifecycleState::Running)
                .count(),
            active_forwarders: self.registry.active_forwarders().await,
            active_connections: self.registry.active_connections().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Public views of all endpoints
    pub async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, LifecycleError> {
        let now = current_time_millis();
        Ok(self
            .store
            .load_all()
            .await?
            .iter()
            .map(|e| EndpointInfo::from_endpoint(e, now))
            .collect())
    }

    /// Create an endpoint in `stopped` state
    pub async fn add_endpoint(&self, new: NewEndpoint) -> Result<Endpoint, LifecycleError> {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }
        new.validate().map_err(LifecycleError::Invalid)?;

        let endpoint = self.store.insert(new).await?;
        if let Err(e) = self.registry.register(&endpoint).await {
            // Roll back so the store and the port cache agree
            self.store.remove(endpoint.id).await?;
            return Err(e.into());
        }

        tracing::info!(
            "Endpoint {} \"{}\" created on port {}",
            endpoint.id,
            endpoint.name,
            endpoint.listen_port
        );
        self.events.created(&endpoint);
        Ok(endpoint)
    }

    /// Replace the configuration of an endpoint that is stopped or failed
    pub async fn update_endpoint(
        &self,
        id: EndpointId,
        new: NewEndpoint,
    ) -> Result<Endpoint, LifecycleError> {
        let _guard = self.claim(id, Claim::Editing)?;
        new.validate().map_err(LifecycleError::Invalid)?;

        let current = self.get(id).await?;
        if matches!(
            current.state,
            LifecycleState::Running | LifecycleState::Starting | LifecycleState::Stopping
        ) {
            return Err(LifecycleError::Busy {
                id,
                state: current.state,
            });
        }

        let updated = self.store.update(id, new).await?;
        if updated.listen_port != current.listen_port {
            self.registry.unregister(current.listen_port).await;
        }
        self.registry.register(&updated).await?;
        if updated.stats_key() != current.stats_key() {
            self.telemetry.remove(&current.stats_key()).await;
        }

        tracing::info!("Endpoint {} updated", id);
        self.events.updated(&updated);
        Ok(updated)
    }

    /// Delete an endpoint, its forwarder and its traffic record.
    ///
    /// The backend container of a running or failed endpoint is stopped in
    /// the background on a best-effort basis.
    pub async fn remove_endpoint(&self, id: EndpointId) -> Result<Endpoint, LifecycleError> {
        let _guard = self.claim(id, Claim::Editing)?;
        let endpoint = self.get(id).await?;
        if endpoint.state.is_in_flight() {
            return Err(LifecycleError::Busy {
                id,
                state: endpoint.state,
            });
        }

        let removed = self.store.remove(id).await?;
        self.registry.unregister(removed.listen_port).await;
        self.telemetry.remove(&removed.stats_key()).await;
        self.last_errors.remove(&id);

        if matches!(
            removed.state,
            LifecycleState::Running | LifecycleState::Error
        ) {
            let driver = Arc::clone(&self.driver);
            let target = removed.clone();
            self.operations.spawn(async move {
                if let Err(e) = driver.stop(&target, &NullSink).await {
                    tracing::warn!("Backend of removed endpoint {} not stopped: {}", target.id, e);
                }
            });
        }

        tracing::info!("Endpoint {} \"{}\" removed", id, removed.name);
        self.events.deleted(id, &removed.name);
        Ok(removed)
    }

    /// Tail of the backend container log
    pub async fn endpoint_logs(&self, id: EndpointId, lines: u32) -> Result<String, RelayError> {
        let endpoint = self.get(id).await?;
        Ok(self.driver.logs(&endpoint, lines).await?)
    }

    /// Populate the registry from the store.
    ///
    /// Operations interrupted by a process exit leave endpoints in `error`;
    /// running endpoints get their forwarder back.
    pub async fn load(&self) -> Result<usize, LifecycleError> {
        let endpoints = self.store.load_all().await?;
        let count = endpoints.len();

        for endpoint in endpoints {
            if let Err(e) = self.registry.register(&endpoint).await {
                tracing::warn!("Endpoint {} not cached: {}", endpoint.id, e);
                continue;
            }

            match endpoint.state {
                LifecycleState::Starting | LifecycleState::Stopping => {
                    let message = format!(
                        "Endpoint was {} when the orchestrator exited",
                        endpoint.state
                    );
                    self.fail(endpoint.id, message).await;
                }
                LifecycleState::Running => {
                    if let Err(e) = self.registry.create_or_replace(&endpoint).await {
                        tracing::warn!(
                            "Forwarder for endpoint {} not restored, health monitor will retry: {}",
                            endpoint.id,
                            e
                        );
                    }
                }
                LifecycleState::Stopped | LifecycleState::Error => {}
            }
        }

        tracing::info!("Loaded {} endpoints", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteConnector, RemoteShell};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rf_core::config::{ForwarderConfig, RemoteConfig};
    use rf_core::error::RemoteError;
    use rf_core::types::BackendAccess;
    use std::net::{IpAddr, Ipv4Addr};

    /// Backend that refuses every connection
    struct Unreachable;

    #[async_trait]
    impl RemoteConnector for Unreachable {
        async fn connect(
            &self,
            backend: &BackendAccess,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteShell>, RemoteError> {
            Err(RemoteError::Connect {
                address: backend.ssh_address(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn manager() -> Arc<LifecycleManager> {
        let telemetry = Arc::new(TrafficTelemetry::new(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let registry = Arc::new(ForwarderRegistry::new(
            ForwarderConfig {
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..ForwarderConfig::default()
            },
            Duration::from_secs(1),
            Arc::clone(&telemetry),
            cancel.clone(),
            TaskTracker::new(),
        ));
        Arc::new(LifecycleManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RemoteDriver::new(Arc::new(Unreachable), RemoteConfig::default())),
            registry,
            telemetry,
            EventHub::default(),
            TaskTracker::new(),
            cancel,
            Duration::from_millis(10),
        ))
    }

    fn new_endpoint(port: u16) -> NewEndpoint {
        NewEndpoint {
            name: "edge".to_string(),
            backend: BackendAccess::with_password("10.0.0.5", "root", "secret"),
            listen_port: port,
            psk: "psk".to_string(),
            users: vec![],
            expires_at: None,
        }
    }

    async fn settle(manager: &LifecycleManager, id: EndpointId) -> Endpoint {
        for _ in 0..200 {
            if !manager.is_claimed(id) {
                return manager.get(id).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("endpoint {} never settled", id);
    }

    #[tokio::test]
    async fn test_stop_while_stopped_is_rejected() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5000)).await.unwrap();

        let err = manager.stop_endpoint(ep.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyStopped(_)));
        assert!(!manager.is_claimed(ep.id));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_not_found() {
        let manager = manager();
        let err = manager.start_endpoint(EndpointId::new(42)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_endpoint_refuses_to_start() {
        let manager = manager();
        let mut new = new_endpoint(5001);
        new.expires_at = Some(1);
        let ep = manager.add_endpoint(new).await.unwrap();

        let err = manager.start_endpoint(ep.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Expired(_)));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let manager = manager();
        let mut new = new_endpoint(5002);
        new.name = " ".to_string();
        assert!(matches!(
            manager.add_endpoint(new).await,
            Err(LifecycleError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_port_rejected() {
        let manager = manager();
        manager.add_endpoint(new_endpoint(5003)).await.unwrap();
        assert!(matches!(
            manager.add_endpoint(new_endpoint(5003)).await,
            Err(LifecycleError::Store(StoreError::DuplicatePort { port: 5003, .. }))
        ));
        assert_eq!(manager.list_endpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_ends_in_error_with_step() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5004)).await.unwrap();
        let mut events = manager.events().subscribe();

        let accepted = manager.start_endpoint(ep.id).await.unwrap();
        assert_eq!(accepted.state, LifecycleState::Starting);

        let settled = settle(&manager, ep.id).await;
        assert_eq!(settled.state, LifecycleState::Error);
        let last_error = manager.last_error(ep.id).unwrap();
        assert!(last_error.contains("[connect]"), "{}", last_error);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(states.first().map(String::as_str), Some("starting"));
        assert_eq!(states.last().map(String::as_str), Some("error"));
        assert_eq!(manager.registry().active_forwarders().await, 0);
    }

    #[tokio::test]
    async fn test_second_start_while_in_flight_rejected() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5005)).await.unwrap();

        let _guard = manager.claim(ep.id, Claim::Starting).unwrap();
        assert!(matches!(
            manager.start_endpoint(ep.id).await,
            Err(LifecycleError::AlreadyStarting(_))
        ));
        assert!(matches!(
            manager.stop_endpoint(ep.id).await,
            Err(LifecycleError::AlreadyStarting(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_released_on_drop() {
        let manager = manager();
        let id = EndpointId::new(1);
        {
            let guard = manager.claim(id, Claim::Stopping).unwrap();
            guard.set(Claim::Starting);
            assert!(matches!(
                manager.claim(id, Claim::Editing),
                Err(LifecycleError::AlreadyStarting(_))
            ));
        }
        assert!(!manager.is_claimed(id));
    }

    #[tokio::test]
    async fn test_recovery_skips_claimed_and_stopped_endpoints() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5012)).await.unwrap();
        let probe = Duration::from_millis(100);

        // Stopped: nothing to recover
        assert_eq!(
            manager.recover_forwarder(ep.id, probe).await.unwrap(),
            Recovery::Skipped
        );

        manager
            .store()
            .update_status(ep.id, LifecycleState::Running)
            .await
            .unwrap();
        let guard = manager.claim(ep.id, Claim::Stopping).unwrap();
        assert_eq!(
            manager.recover_forwarder(ep.id, probe).await.unwrap(),
            Recovery::Skipped
        );
        drop(guard);
        assert_eq!(manager.registry().active_forwarders().await, 0);

        // Gone from the store
        assert_eq!(
            manager
                .recover_forwarder(EndpointId::new(99), probe)
                .await
                .unwrap(),
            Recovery::Skipped
        );
    }

    #[tokio::test]
    async fn test_stop_rejected_while_recovering() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5013)).await.unwrap();
        let _guard = manager.claim(ep.id, Claim::Recovering).unwrap();
        assert!(matches!(
            manager.stop_endpoint(ep.id).await,
            Err(LifecycleError::Busy {
                state: LifecycleState::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_rejected_while_running() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5006)).await.unwrap();
        manager
            .store()
            .update_status(ep.id, LifecycleState::Running)
            .await
            .unwrap();

        assert!(matches!(
            manager.update_endpoint(ep.id, new_endpoint(5007)).await,
            Err(LifecycleError::Busy {
                state: LifecycleState::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_moves_port_registration() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5008)).await.unwrap();

        let updated = manager
            .update_endpoint(ep.id, new_endpoint(5009))
            .await
            .unwrap();
        assert_eq!(updated.listen_port, 5009);
        assert!(manager.registry().endpoint(5008).await.is_none());
        assert_eq!(
            manager.registry().endpoint(5009).await.map(|e| e.id),
            Some(ep.id)
        );
    }

    #[tokio::test]
    async fn test_load_marks_interrupted_operations_failed() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5010)).await.unwrap();
        manager
            .store()
            .update_status(ep.id, LifecycleState::Stopping)
            .await
            .unwrap();

        assert_eq!(manager.load().await.unwrap(), 1);
        let loaded = manager.get(ep.id).await.unwrap();
        assert_eq!(loaded.state, LifecycleState::Error);
        assert!(manager.last_error(ep.id).is_some());
    }

    #[tokio::test]
    async fn test_remove_forgets_endpoint() {
        let manager = manager();
        let ep = manager.add_endpoint(new_endpoint(5011)).await.unwrap();
        let mut events = manager.events().subscribe();

        manager.remove_endpoint(ep.id).await.unwrap();
        assert!(matches!(
            manager.get(ep.id).await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(manager.registry().endpoint(5011).await.is_none());
        assert_eq!(events.recv().await.unwrap().state, "deleted");
    }
}
