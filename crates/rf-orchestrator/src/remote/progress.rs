//! Step-by-step progress reporting

use std::sync::Mutex;

/// Outcome of one driver step. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub step: &'static str,
    pub success: bool,
    pub detail: String,
}

impl ProgressEvent {
    /// Render as `[step] detail`
    pub fn message(&self) -> String {
        format!("[{}] {}", self.step, self.detail)
    }
}

/// Receives progress events as a remote operation advances
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink discarding every event
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _event: ProgressEvent) {}
}

/// Sink keeping every event in order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events reported so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of the reported steps, in order
    pub fn steps(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.step).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
