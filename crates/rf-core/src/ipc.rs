//! IPC protocol between admin clients and the orchestrator
//!
//! Uses newline-delimited JSON messages over TCP on localhost (127.0.0.1).
//! Push events share the same connection as request/response traffic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Endpoint, EndpointId, LifecycleState, NewEndpoint};

/// IPC request from an admin client to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// List configured endpoints
    ListEndpoints,

    /// Create an endpoint (initially stopped)
    AddEndpoint { endpoint: NewEndpoint },

    /// Replace an endpoint's configuration
    UpdateEndpoint {
        endpoint_id: EndpointId,
        endpoint: NewEndpoint,
    },

    /// Remove an endpoint, its forwarder and its traffic record
    RemoveEndpoint { endpoint_id: EndpointId },

    /// Start the backend service and forwarder
    StartEndpoint { endpoint_id: EndpointId },

    /// Stop the backend service and forwarder
    StopEndpoint { endpoint_id: EndpointId },

    /// Restart the backend service and forwarder
    RestartEndpoint { endpoint_id: EndpointId },

    /// Runtime status of one endpoint
    GetRuntimeStatus { endpoint_id: EndpointId },

    /// Tail of the backend container log
    GetLogs { endpoint_id: EndpointId, lines: u32 },

    /// Aggregate traffic counters
    GetTrafficStats,

    /// Fleet-wide summary
    GetSummary,

    /// Ping (for keepalive)
    Ping,

    /// Shutdown the orchestrator
    Shutdown,
}

/// IPC response from orchestrator to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// List of endpoints
    Endpoints { endpoints: Vec<EndpointInfo> },

    /// Single endpoint
    Endpoint(EndpointInfo),

    /// Runtime status
    RuntimeStatus(RuntimeStatus),

    /// Container log output
    Logs { endpoint_id: EndpointId, output: String },

    /// Traffic report
    Traffic(TrafficReport),

    /// Fleet summary
    Summary(SystemSummary),

    /// Request accepted; the operation continues in the background
    Accepted { endpoint_id: EndpointId, state: LifecycleState },

    /// Generic success
    Ok,

    /// Error response
    Error { message: String },

    /// Pong response
    Pong,
}

/// Kind of push event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEventKind {
    /// Lifecycle state change or progress step
    Status,
    /// Endpoint created
    Created,
    /// Endpoint configuration updated
    Updated,
}

/// Event pushed to every connected observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushEventKind,
    pub endpoint_id: EndpointId,
    /// State name; `deleted` is used when an endpoint is removed
    pub state: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EndpointInfo>,
}

/// Endpoint view without secrets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub name: String,
    pub backend_host: String,
    pub ssh_port: u16,
    pub listen_port: u16,
    pub state: LifecycleState,
    pub user_count: usize,
    pub is_expired: bool,
    pub last_healthy_at: Option<u64>,
    pub expires_at: Option<u64>,
    pub updated_at: u64,
}

impl EndpointInfo {
    /// Build the public view of an endpoint at `now_millis`
    pub fn from_endpoint(endpoint: &Endpoint, now_millis: u64) -> Self {
        Self {
            id: endpoint.id,
            name: endpoint.name.clone(),
            backend_host: endpoint.backend.host.clone(),
            ssh_port: endpoint.backend.ssh_port,
            listen_port: endpoint.listen_port,
            state: endpoint.state,
            user_count: endpoint.users.len(),
            is_expired: endpoint.is_expired(now_millis),
            last_healthy_at: endpoint.last_healthy_at,
            expires_at: endpoint.expires_at,
            updated_at: endpoint.updated_at,
        }
    }
}

/// Observed state of the backend container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

/// Runtime status of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub endpoint_id: EndpointId,
    pub name: String,
    pub backend_host: String,
    pub listen_port: u16,
    /// Persisted desired state
    pub state: LifecycleState,
    pub container_state: ContainerState,
    /// Container uptime, e.g. `1h2m3s`
    pub uptime: Option<String>,
    /// Whether a forwarder is currently registered for the listen port
    pub forwarder_active: bool,
    pub message: String,
    pub last_error: Option<String>,
    pub is_expired: bool,
    pub updated_at: u64,
}

/// Counters of one traffic record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Last refresh (ms since epoch)
    pub last_update: u64,
}

/// Sum over all traffic records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// Aggregate traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficReport {
    /// Records keyed by `backendHost:listenPort`
    pub per_key: BTreeMap<String, TrafficSnapshot>,
    pub totals: TrafficTotals,
}

/// Fleet-wide summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSummary {
    pub total_endpoints: usize,
    pub running_endpoints: usize,
    pub active_forwarders: usize,
    /// Open TCP connections plus live UDP sessions across forwarders
    pub active_connections: usize,
    pub uptime_secs: u64,
    pub version: String,
}

/// IPC message wrapper (for framing)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcMessage {
    Request(IpcRequest),
    Response(IpcResponse),
    Event(PushEvent),
}

impl IpcMessage {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<IpcRequest> for IpcMessage {
    fn from(req: IpcRequest) -> Self {
        IpcMessage::Request(req)
    }
}

impl From<IpcResponse> for IpcMessage {
    fn from(resp: IpcResponse) -> Self {
        IpcMessage::Response(resp)
    }
}

impl From<PushEvent> for IpcMessage {
    fn from(event: PushEvent) -> Self {
        IpcMessage::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = IpcRequest::StartEndpoint {
            endpoint_id: EndpointId::new(3),
        };

        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"start_endpoint","endpoint_id":3}"#);

        match serde_json::from_str::<IpcRequest>(&json).unwrap() {
            IpcRequest::StartEndpoint { endpoint_id } => assert_eq!(endpoint_id.get(), 3),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_push_event_shape() {
        let event = PushEvent {
            kind: PushEventKind::Status,
            endpoint_id: EndpointId::new(1),
            state: "starting".to_string(),
            message: "[connect] connected".to_string(),
            data: None,
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["endpoint_id"], 1);
        assert_eq!(value["state"], "starting");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_accepted_response_roundtrip() {
        let resp = IpcResponse::Accepted {
            endpoint_id: EndpointId::new(9),
            state: LifecycleState::Stopping,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"state\":\"stopping\""));

        match serde_json::from_str::<IpcResponse>(&json).unwrap() {
            IpcResponse::Accepted { endpoint_id, state } => {
                assert_eq!(endpoint_id.get(), 9);
                assert_eq!(state, LifecycleState::Stopping);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_empty_traffic_report_serializes() {
        let resp = IpcResponse::Traffic(TrafficReport::default());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("perKey"));
    }
}
