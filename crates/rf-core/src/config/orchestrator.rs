//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::types::TunnelUser;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// IPC port for CLI/admin communication (localhost only)
    pub ipc_port: u16,

    /// Path of the JSON endpoint store
    pub store_path: PathBuf,

    /// Interval between health sweeps
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,

    /// Interval between telemetry refreshes of each forwarder
    #[serde(with = "duration_secs")]
    pub telemetry_interval: Duration,

    /// Liveness probe timeout right after creating a forwarder
    #[serde(with = "duration_millis")]
    pub create_probe_timeout: Duration,

    /// Liveness probe timeout during health sweeps
    #[serde(with = "duration_millis")]
    pub sweep_probe_timeout: Duration,

    /// Delay between the stop and start halves of a restart
    #[serde(with = "duration_millis")]
    pub restart_settle: Duration,

    /// How long shutdown waits for in-flight remote operations
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Remote backend driver settings
    pub remote: RemoteConfig,

    /// Local forwarding engine settings
    pub forwarder: ForwarderConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            ipc_port: 22240,
            store_path: config_dir.join("endpoints.json"),
            health_interval: Duration::from_secs(15),
            telemetry_interval: Duration::from_secs(10),
            create_probe_timeout: Duration::from_secs(3),
            sweep_probe_timeout: Duration::from_secs(1),
            restart_settle: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            remote: RemoteConfig::default(),
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Get the IPC address (localhost:port)
    pub fn ipc_address(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port)
    }
}

/// Settings for the remote start/stop procedure on backend hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// SSH connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Upper bound on a single remote command, image pulls included
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Upper bound on waiting for the container to report running
    #[serde(with = "duration_secs")]
    pub readiness_timeout: Duration,

    /// Pause between readiness polls
    #[serde(with = "duration_millis")]
    pub readiness_poll_interval: Duration,

    /// Fail the start when the container is observed not running at the
    /// readiness deadline. Off by default: an unobservable or late readiness
    /// signal counts as success.
    pub strict_readiness: bool,

    /// Name of the tunnel container on the backend
    pub container_name: String,

    /// Image of the tunnel service
    pub image: String,

    /// Command installing the container runtime when absent
    pub runtime_install_command: String,

    /// `-p` mappings published by the container
    pub published_ports: Vec<String>,

    /// Users configured when an endpoint defines none
    pub default_users: Vec<TunnelUser>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(600),
            readiness_timeout: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_secs(1),
            strict_readiness: false,
            container_name: "l2tp-server".to_string(),
            image: "siomiz/softethervpn:4.38-alpine".to_string(),
            runtime_install_command: "curl -fsSL https://get.docker.com | sh".to_string(),
            published_ports: vec![
                "500:500/udp".to_string(),
                "4500:4500/udp".to_string(),
                "1701:1701/udp".to_string(),
            ],
            default_users: vec![TunnelUser::new("test", "test123")],
        }
    }
}

/// Settings for locally bound forwarders
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Address the public listen ports bind to
    pub bind_address: IpAddr,

    /// Fixed tunnel port on every backend
    pub backend_port: u16,

    /// Timeout for opening a TCP connection to the backend
    #[serde(with = "duration_secs")]
    pub backend_connect_timeout: Duration,

    /// Idle time after which a UDP client session is dropped
    #[serde(with = "duration_secs")]
    pub udp_session_idle: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backend_port: 1701,
            backend_connect_timeout: Duration::from_secs(10),
            udp_session_idle: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.health_interval, Duration::from_secs(15));
        assert_eq!(config.telemetry_interval, Duration::from_secs(10));
        assert_eq!(config.remote.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.remote.readiness_timeout, Duration::from_secs(30));
        assert_eq!(config.remote.command_timeout, Duration::from_secs(600));
        assert!(!config.remote.strict_readiness);
    }

    #[test]
    fn test_ipc_address_is_loopback() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.ipc_address(), "127.0.0.1:22240");
    }
}
