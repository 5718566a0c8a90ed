//! Forwarder health monitor
//!
//! Periodically reconciles the desired state in the store against the
//! forwarders actually registered. Every endpoint that should be `running`
//! but has no live forwarder gets its stale registration torn down and a
//! fresh forwarder created, under the same per-endpoint claim lifecycle
//! operations take. Other states are left alone; `error` in
//! particular is only ever left through an operator request.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rf_core::LifecycleState;

use crate::lifecycle::{LifecycleManager, Recovery};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running endpoints examined
    pub checked: usize,
    /// Forwarders recreated
    pub recovered: usize,
    /// Recreations that failed (retried next sweep)
    pub failed: usize,
}

/// Periodic reconciler of running endpoints
pub struct HealthMonitor {
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(lifecycle: Arc<LifecycleManager>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            lifecycle,
            interval,
            probe_timeout,
        }
    }

    /// Run sweeps until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; forwarders were just restored by load
        interval.tick().await;

        tracing::info!(
            "Starting health monitor (interval: {:?}, probe timeout: {:?})",
            self.interval,
            self.probe_timeout
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Check every running endpoint once
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let endpoints = match self.lifecycle.store().load_all().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("Health sweep skipped, store unavailable: {}", e);
                return report;
            }
        };

        let registry = self.lifecycle.registry();
        for endpoint in endpoints {
            if endpoint.state != LifecycleState::Running {
                continue;
            }
            // An operation in flight owns the forwarder
            if self.lifecycle.is_claimed(endpoint.id) {
                continue;
            }
            report.checked += 1;

            let port = endpoint.listen_port;
            if registry.is_healthy(port, self.probe_timeout).await {
                continue;
            }

            tracing::warn!(
                "Forwarder for endpoint {} on port {} is unhealthy, recreating",
                endpoint.id,
                port
            );
            match self
                .lifecycle
                .recover_forwarder(endpoint.id, self.probe_timeout)
                .await
            {
                Ok(Recovery::Recovered) => {
                    tracing::info!("Recovered forwarder for endpoint {} on port {}", endpoint.id, port);
                    report.recovered += 1;
                }
                Ok(Recovery::Skipped) => {
                    tracing::debug!("Endpoint {} changed during sweep, left alone", endpoint.id);
                }
                Err(e) => {
                    tracing::error!(
                        "Recovery of forwarder for endpoint {} failed: {}",
                        endpoint.id,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        if report.recovered > 0 || report.failed > 0 {
            tracing::info!(
                "Health sweep: {} checked, {} recovered, {} failed",
                report.checked,
                report.recovered,
                report.failed
            );
        }
        report
    }
}
