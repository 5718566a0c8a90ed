//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unique identifier for an endpoint, assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl EndpointId {
    /// Create a new endpoint ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric ID
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EndpointId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Desired lifecycle state of an endpoint.
///
/// `Starting` and `Stopping` mark an in-flight transition; at most one of them
/// can hold for an endpoint at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Backend service and forwarder are down
    #[default]
    Stopped,
    /// Remote start sequence in progress
    Starting,
    /// Backend service up, forwarder bound
    Running,
    /// Remote stop sequence in progress
    Stopping,
    /// Last operation failed; needs an explicit start or stop
    Error,
}

impl LifecycleState {
    /// Whether a remote operation currently owns this endpoint
    pub fn is_in_flight(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }

    /// Stable lowercase name used in events and the store
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        }
    }

    /// Default human-readable message broadcast when entering this state
    pub fn message(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "Endpoint stopped",
            LifecycleState::Starting => "Endpoint starting...",
            LifecycleState::Running => "Endpoint running",
            LifecycleState::Stopping => "Endpoint stopping...",
            LifecycleState::Error => "Endpoint operation failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(LifecycleState::Stopped),
            "starting" => Ok(LifecycleState::Starting),
            "running" => Ok(LifecycleState::Running),
            "stopping" => Ok(LifecycleState::Stopping),
            "error" => Ok(LifecycleState::Error),
            other => Err(format!("unknown lifecycle state: {}", other)),
        }
    }
}

/// Credentials of a user allowed through the tunnel service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelUser {
    pub username: String,
    pub password: String,
}

impl TunnelUser {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// How to reach and authenticate against the backend host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAccess {
    /// Backend host name or IP; also the forwarding target
    pub host: String,

    /// SSH port on the backend
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// SSH user
    pub username: String,

    /// SSH password (used when no private key is configured)
    #[serde(default)]
    pub password: Option<String>,

    /// Private key for public-key authentication
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Expected host key fingerprint. When set, other keys are rejected.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl BackendAccess {
    /// Password-authenticated access on the default SSH port
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            ssh_port: default_ssh_port(),
            username: username.into(),
            password: Some(password.into()),
            private_key_path: None,
            host_key_fingerprint: None,
        }
    }

    /// `host:port` address of the SSH service
    pub fn ssh_address(&self) -> String {
        format!("{}:{}", self.host, self.ssh_port)
    }
}

/// A configured relay endpoint: a backend plus its public listen port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,

    /// Operator-facing label
    pub name: String,

    pub backend: BackendAccess,

    /// Public port bound locally; unique across all endpoints
    pub listen_port: u16,

    /// Pre-shared key handed to the tunnel service
    pub psk: String,

    #[serde(default)]
    pub users: Vec<TunnelUser>,

    /// Desired lifecycle state (authoritative)
    #[serde(default)]
    pub state: LifecycleState,

    /// Last time the endpoint entered `running` (ms since epoch)
    #[serde(default)]
    pub last_healthy_at: Option<u64>,

    /// Expiry (ms since epoch); expired endpoints refuse to start
    #[serde(default)]
    pub expires_at: Option<u64>,

    pub created_at: u64,
    pub updated_at: u64,
}

impl Endpoint {
    /// Build a stored endpoint from a creation request
    pub fn from_new(id: EndpointId, new: NewEndpoint, now_millis: u64) -> Self {
        Self {
            id,
            name: new.name,
            backend: new.backend,
            listen_port: new.listen_port,
            psk: new.psk,
            users: new.users,
            state: LifecycleState::Stopped,
            last_healthy_at: None,
            expires_at: new.expires_at,
            created_at: now_millis,
            updated_at: now_millis,
        }
    }

    /// Key of the traffic record for this endpoint (`backendHost:listenPort`)
    pub fn stats_key(&self) -> String {
        format!("{}:{}", self.backend.host, self.listen_port)
    }

    /// Whether the endpoint is past its expiry at `now_millis`
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| now_millis > at)
    }
}

/// Request to create or replace an endpoint's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEndpoint {
    pub name: String,
    pub backend: BackendAccess,
    pub listen_port: u16,
    pub psk: String,
    #[serde(default)]
    pub users: Vec<TunnelUser>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl NewEndpoint {
    /// Check required fields before the request reaches the store
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.backend.host.trim().is_empty() {
            return Err("backend host is required".to_string());
        }
        if self.backend.username.trim().is_empty() {
            return Err("backend username is required".to_string());
        }
        if self.backend.password.is_none() && self.backend.private_key_path.is_none() {
            return Err("backend password or private key is required".to_string());
        }
        if self.listen_port == 0 {
            return Err("listen port must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_new() -> NewEndpoint {
        NewEndpoint {
            name: "edge-1".to_string(),
            backend: BackendAccess::with_password("10.0.0.5", "root", "secret"),
            listen_port: 5000,
            psk: "psk".to_string(),
            users: vec![],
            expires_at: None,
        }
    }

    #[test]
    fn test_lifecycle_state_display_roundtrip() {
        for state in [
            LifecycleState::Stopped,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Error,
        ] {
            assert_eq!(state.to_string().parse::<LifecycleState>(), Ok(state));
        }
        assert!("paused".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_in_flight_states() {
        assert!(LifecycleState::Starting.is_in_flight());
        assert!(LifecycleState::Stopping.is_in_flight());
        assert!(!LifecycleState::Running.is_in_flight());
        assert!(!LifecycleState::Error.is_in_flight());
    }

    #[test]
    fn test_stats_key() {
        let endpoint = Endpoint::from_new(EndpointId::new(1), sample_new(), 0);
        assert_eq!(endpoint.stats_key(), "10.0.0.5:5000");
        assert_eq!(endpoint.state, LifecycleState::Stopped);
    }

    #[test]
    fn test_expiry() {
        let mut new = sample_new();
        new.expires_at = Some(1_000);
        let endpoint = Endpoint::from_new(EndpointId::new(1), new, 0);
        assert!(!endpoint.is_expired(999));
        assert!(endpoint.is_expired(1_001));
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut new = sample_new();
        assert!(new.validate().is_ok());
        new.backend.password = None;
        assert!(new.validate().is_err());
        new.backend.private_key_path = Some(PathBuf::from("/tmp/key"));
        assert!(new.validate().is_ok());
        new.listen_port = 0;
        assert!(new.validate().is_err());
    }

    #[test]
    fn test_endpoint_id_serializes_as_number() {
        let json = serde_json::to_string(&EndpointId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
