//! Approximate per-forwarder traffic counters
//!
//! Records are keyed by `backendHost:listenPort`. A record is created with the
//! forwarder and lives until its endpoint is removed. Counters only move when
//! [`TrafficTelemetry::record`] is called; the refresh loop of each forwarder
//! just touches the timestamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rf_core::ipc::{TrafficReport, TrafficSnapshot};
use rf_core::time::current_time_millis;

/// Counter increments reported by a forwarder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl TrafficDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Live traffic records
pub struct TrafficTelemetry {
    stats: RwLock<HashMap<String, Arc<Mutex<TrafficSnapshot>>>>,
    interval: Duration,
}

impl TrafficTelemetry {
    /// Create telemetry refreshing records every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Create a zeroed record for `key` unless one exists
    pub async fn ensure(&self, key: &str) {
        let mut stats = self.stats.write().await;
        stats.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TrafficSnapshot {
                last_update: current_time_millis(),
                ..TrafficSnapshot::default()
            }))
        });
    }

    async fn record_of(&self, key: &str) -> Option<Arc<Mutex<TrafficSnapshot>>> {
        self.stats.read().await.get(key).cloned()
    }

    /// Add `delta` to the record. Returns false when no record exists.
    pub async fn record(&self, key: &str, delta: TrafficDelta) -> bool {
        let Some(record) = self.record_of(key).await else {
            return false;
        };
        let mut stat = record.lock().await;
        stat.bytes_sent = stat.bytes_sent.saturating_add(delta.bytes_sent);
        stat.bytes_received = stat.bytes_received.saturating_add(delta.bytes_received);
        stat.packets_sent = stat.packets_sent.saturating_add(delta.packets_sent);
        stat.packets_received = stat.packets_received.saturating_add(delta.packets_received);
        stat.last_update = current_time_millis();
        true
    }

    /// Refresh the record's timestamp
    pub async fn touch(&self, key: &str) {
        if let Some(record) = self.record_of(key).await {
            record.lock().await.last_update = current_time_millis();
        }
    }

    /// Delete the record
    pub async fn remove(&self, key: &str) -> bool {
        self.stats.write().await.remove(key).is_some()
    }

    /// Copy of one record
    pub async fn get(&self, key: &str) -> Option<TrafficSnapshot> {
        match self.record_of(key).await {
            Some(record) => Some(*record.lock().await),
            None => None,
        }
    }

    /// Copy of every record plus totals
    pub async fn snapshot(&self) -> TrafficReport {
        let records: Vec<_> = {
            let stats = self.stats.read().await;
            stats
                .iter()
                .map(|(key, record)| (key.clone(), Arc::clone(record)))
                .collect()
        };

        let mut report = TrafficReport::default();
        for (key, record) in records {
            let stat = *record.lock().await;
            let totals = &mut report.totals;
            totals.bytes_sent = totals.bytes_sent.saturating_add(stat.bytes_sent);
            totals.bytes_received = totals.bytes_received.saturating_add(stat.bytes_received);
            totals.packets_sent = totals.packets_sent.saturating_add(stat.packets_sent);
            totals.packets_received = totals.packets_received.saturating_add(stat.packets_received);
            report.per_key.insert(key, stat);
        }
        report
    }

    /// Spawn the refresh loop of one forwarder, stopping with `cancel`
    pub fn spawn_refresh(
        self: &Arc<Self>,
        key: String,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let telemetry = Arc::clone(self);
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(telemetry.interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => telemetry.touch(&key).await,
                    _ = cancel.cancelled() => {
                        tracing::debug!("Telemetry loop for {} stopped", key);
                        break;
                    }
                }
            }
        });
    }
}

/// Handle a forwarder uses to report traffic for its record
#[derive(Clone)]
pub struct StatsHandle {
    telemetry: Arc<TrafficTelemetry>,
    key: String,
}

impl StatsHandle {
    pub fn new(telemetry: Arc<TrafficTelemetry>, key: impl Into<String>) -> Self {
        Self {
            telemetry,
            key: key.into(),
        }
    }

    pub async fn record(&self, delta: TrafficDelta) {
        if !delta.is_empty() {
            self.telemetry.record(&self.key, delta).await;
        }
    }
}
