//! rf-orchestrator: Control plane for a fleet of relay endpoints
//!
//! Each endpoint pairs a remote backend host, on which a tunnel service runs
//! in a container, with a public listen port on this machine whose traffic is
//! forwarded to that backend. The orchestrator drives the remote start/stop
//! procedure over SSH, owns the local forwarders, heals drift between desired
//! and actual state, and exposes an IPC interface for admin clients.

pub mod events;
pub mod forwarder;
pub mod health;
pub mod ipc;
pub mod lifecycle;
pub mod remote;
pub mod state;
pub mod store;
pub mod telemetry;

pub use events::EventHub;
pub use lifecycle::LifecycleManager;
pub use state::OrchestratorState;
