//! rf-core: Core abstractions and configuration for relayfleet
//!
//! This crate provides the endpoint model, lifecycle states, error types,
//! configuration structures and the IPC protocol shared by the orchestrator
//! daemon and its clients.

pub mod config;
pub mod error;
pub mod ipc;
pub mod time;
pub mod types;

pub use error::RelayError;
pub use types::{Endpoint, EndpointId, LifecycleState, NewEndpoint, TunnelUser};
