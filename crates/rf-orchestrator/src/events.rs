//! Push channel for real-time observers
//!
//! The hub is constructed once by the composition root and handed to every
//! component that publishes. Delivery is best effort: a receiver that falls
//! more than `capacity` events behind loses the oldest events and is expected
//! to disconnect (see the IPC server), so publishing never blocks.

use tokio::sync::broadcast;

use rf_core::ipc::{EndpointInfo, PushEvent, PushEventKind};
use rf_core::time::current_time_millis;
use rf_core::{Endpoint, EndpointId};

/// Default number of buffered events per subscriber
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub for [`PushEvent`]s
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<PushEvent>,
}

impl EventHub {
    /// Create a hub buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    /// Number of connected observers
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event to all observers
    pub fn publish(&self, event: PushEvent) {
        // No observers is not an error
        let _ = self.tx.send(event);
    }

    /// Publish a status change or progress step
    pub fn status(&self, endpoint_id: EndpointId, state: &str, message: impl Into<String>) {
        self.publish(PushEvent {
            kind: PushEventKind::Status,
            endpoint_id,
            state: state.to_string(),
            message: message.into(),
            data: None,
        });
    }

    /// Publish an endpoint creation
    pub fn created(&self, endpoint: &Endpoint) {
        self.publish(PushEvent {
            kind: PushEventKind::Created,
            endpoint_id: endpoint.id,
            state: endpoint.state.to_string(),
            message: format!("Endpoint \"{}\" created", endpoint.name),
            data: Some(EndpointInfo::from_endpoint(endpoint, current_time_millis())),
        });
    }

    /// Publish an endpoint configuration update
    pub fn updated(&self, endpoint: &Endpoint) {
        self.publish(PushEvent {
            kind: PushEventKind::Updated,
            endpoint_id: endpoint.id,
            state: endpoint.state.to_string(),
            message: format!("Endpoint \"{}\" updated", endpoint.name),
            data: Some(EndpointInfo::from_endpoint(endpoint, current_time_millis())),
        });
    }

    /// Publish an endpoint removal
    pub fn deleted(&self, endpoint_id: EndpointId, name: &str) {
        self.status(
            endpoint_id,
            "deleted",
            format!("Endpoint \"{}\" deleted", name),
        );
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
