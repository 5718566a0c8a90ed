//! Core error types for relayfleet

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{EndpointId, LifecycleState};

/// Top-level error type for the relayfleet ecosystem
#[derive(Error, Debug)]
pub enum RelayError {
    /// Lifecycle request rejected or failed
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Remote backend operation failed
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local forwarder error
    #[error("Forwarder error: {0}")]
    Forwarder(#[from] ForwarderError),

    /// Persisted store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validation errors raised synchronously by start/stop/restart requests
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Endpoint does not exist
    #[error("Endpoint not found: {0}")]
    NotFound(EndpointId),

    /// Start requested while already running
    #[error("Endpoint {0} is already running")]
    AlreadyRunning(EndpointId),

    /// Start or restart requested while a start is in flight
    #[error("Endpoint {0} is already starting, please wait")]
    AlreadyStarting(EndpointId),

    /// Stop requested while already stopped
    #[error("Endpoint {0} is already stopped")]
    AlreadyStopped(EndpointId),

    /// Stop or restart requested while a stop is in flight
    #[error("Endpoint {0} is already stopping, please wait")]
    AlreadyStopping(EndpointId),

    /// Endpoint expired and can no longer be started
    #[error("Endpoint {0} has expired and cannot be started")]
    Expired(EndpointId),

    /// Endpoint configuration cannot change while an operation owns it
    #[error("Endpoint {id} is {state}; wait for the operation to finish")]
    Busy { id: EndpointId, state: LifecycleState },

    /// Invalid endpoint definition
    #[error("Invalid endpoint: {0}")]
    Invalid(String),

    /// Orchestrator is shutting down
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// Store failure while flipping state
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Listen port conflict detected while registering
    #[error(transparent)]
    Forwarder(#[from] ForwarderError),
}

/// Errors from the remote execution channel
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Could not reach the backend
    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// Connection attempt exceeded the configured timeout
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// Backend rejected our credentials
    #[error("Authentication rejected for {user}@{address}")]
    AuthRejected { user: String, address: String },

    /// No usable credentials configured
    #[error("No credentials configured: {0}")]
    Credentials(String),

    /// Channel-level SSH failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Command exited non-zero
    #[error("Command `{command}` failed with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: u32,
        output: String,
    },

    /// Command did not finish within the configured timeout
    #[error("Command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// Command ended without reporting an exit status
    #[error("Command `{0}` terminated without exit status")]
    NoExitStatus(String),
}

/// A driver step failure, tagged with the step that failed
#[derive(Error, Debug)]
#[error("[{step}] {message}")]
pub struct StepError {
    /// Name of the failing step
    pub step: &'static str,
    /// Human-readable detail
    pub message: String,
    #[source]
    pub source: Option<RemoteError>,
}

impl StepError {
    pub fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            source: None,
        }
    }

    pub fn remote(step: &'static str, message: impl Into<String>, source: RemoteError) -> Self {
        Self {
            step,
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Protocol of a listen socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// Local forwarder errors
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// Listen port already bound on this host
    #[error("{transport} port {port} is already in use: {source}")]
    PortInUse {
        port: u16,
        transport: Transport,
        #[source]
        source: std::io::Error,
    },

    /// Listen port owned by another endpoint
    #[error("Listen port {port} is already assigned to endpoint {owner}")]
    PortConflict { port: u16, owner: EndpointId },

    /// Engine could not start
    #[error("Failed to launch forwarder on port {port}: {source}")]
    Launch {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Post-launch liveness probe failed
    #[error("Forwarder on port {port} failed liveness probe: {message}")]
    Probe { port: u16, message: String },

    /// Registry is shutting down
    #[error("Forwarder registry is shut down")]
    ShutDown,
}

/// Persisted store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No endpoint with this ID
    #[error("Endpoint not found: {0}")]
    NotFound(EndpointId),

    /// Unique listen port constraint violated
    #[error("Listen port {port} is already used by endpoint {owner}")]
    DuplicatePort { port: u16, owner: EndpointId },

    /// Store file could not be read or written
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Store file contents are invalid
    #[error("Store data error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_carries_step_name() {
        let err = StepError::remote(
            "image_pull",
            "Failed to pull image",
            RemoteError::CommandFailed {
                command: "docker pull x".to_string(),
                status: 1,
                output: "denied".to_string(),
            },
        );
        assert_eq!(err.to_string(), "[image_pull] Failed to pull image");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_lifecycle_error_messages() {
        let err = LifecycleError::AlreadyStopped(EndpointId::new(1));
        assert!(err.to_string().contains("already stopped"));

        let err = LifecycleError::Busy {
            id: EndpointId::new(2),
            state: LifecycleState::Starting,
        };
        assert!(err.to_string().contains("starting"));
    }

    #[test]
    fn test_port_in_use_mentions_transport() {
        let err = ForwarderError::PortInUse {
            port: 5000,
            transport: Transport::Udp,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("UDP port 5000"));
    }
}
