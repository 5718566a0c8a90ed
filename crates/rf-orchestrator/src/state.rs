//! Global orchestrator state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rf_core::config::OrchestratorConfig;
use rf_core::error::LifecycleError;

use crate::events::EventHub;
use crate::forwarder::ForwarderRegistry;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::remote::{RemoteConnector, RemoteDriver};
use crate::store::EndpointStore;
use crate::telemetry::TrafficTelemetry;

/// Composition root of the orchestrator daemon
pub struct OrchestratorState {
    /// Configuration
    pub config: OrchestratorConfig,
    /// Push channel shared by every publisher
    pub events: EventHub,
    /// Traffic counters
    pub telemetry: Arc<TrafficTelemetry>,
    /// Forwarders by listen port
    pub registry: Arc<ForwarderRegistry>,
    /// Endpoint lifecycle
    pub lifecycle: Arc<LifecycleManager>,
    /// Process-wide shutdown signal
    cancel: CancellationToken,
    /// Health monitor and telemetry loops
    loops: TaskTracker,
    /// Background lifecycle operations
    operations: TaskTracker,
}

impl OrchestratorState {
    /// Wire every component together
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn EndpointStore>,
        connector: Arc<dyn RemoteConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let events = EventHub::default();
        let loops = TaskTracker::new();
        let operations = TaskTracker::new();

        let telemetry = Arc::new(TrafficTelemetry::new(config.telemetry_interval));
        let registry = Arc::new(ForwarderRegistry::new(
            config.forwarder.clone(),
            config.create_probe_timeout,
            Arc::clone(&telemetry),
            cancel.clone(),
            loops.clone(),
        ));
        let driver = Arc::new(RemoteDriver::new(connector, config.remote.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store,
            driver,
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            events.clone(),
            operations.clone(),
            cancel.clone(),
            config.restart_settle,
        ));

        Self {
            config,
            events,
            telemetry,
            registry,
            lifecycle,
            cancel,
            loops,
            operations,
        }
    }

    /// Restore endpoints from the store and start the health monitor
    pub async fn start(&self) -> Result<usize, LifecycleError> {
        let loaded = self.lifecycle.load().await?;

        let monitor = HealthMonitor::new(
            Arc::clone(&self.lifecycle),
            self.config.health_interval,
            self.config.sweep_probe_timeout,
        );
        self.loops.spawn(monitor.run(self.cancel.clone()));
        Ok(loaded)
    }

    /// Shutdown signal shared with the IPC server
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop loops, wait for in-flight operations up to the grace period and
    /// close every forwarder
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        self.loops.close();
        self.loops.wait().await;

        self.operations.close();
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.operations.wait()).await.is_err() {
            tracing::warn!(
                "{} lifecycle operations still running after {:?}",
                self.operations.len(),
                grace
            );
        }

        self.registry.shutdown().await;
        tracing::info!("Orchestrator state shut down");
    }
}
