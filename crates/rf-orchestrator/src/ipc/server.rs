//! IPC server implementation
//!
//! Listens on localhost TCP for requests from admin clients.
//! Uses TCP on 127.0.0.1 for cross-platform compatibility.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use rf_core::ipc::{EndpointInfo, IpcMessage, IpcRequest, IpcResponse};
use rf_core::time::current_time_millis;

use crate::state::OrchestratorState;

/// Longest request line accepted from a client
const MAX_REQUEST_LINE: usize = 1024 * 1024;

/// IPC server for admin clients
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct IpcServer {
    listener: TcpListener,
    /// Orchestrator state
    state: Arc<OrchestratorState>,
    /// Cancelled on shutdown, either by a signal or by a shutdown request
    shutdown_token: CancellationToken,
}

impl IpcServer {
    /// Bind the IPC listener
    pub async fn bind(address: &str, state: Arc<OrchestratorState>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", address))?;
        let shutdown_token = state.cancel_token();
        Ok(Self {
            listener,
            state,
            shutdown_token,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("IPC listener has no local address")
    }

    /// Accept clients until shutdown
    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown_token.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Only accept connections from localhost
                    if !peer_addr.ip().is_loopback() {
                        tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                        continue;
                    }

                    let state = Arc::clone(&self.state);
                    let shutdown_token = self.shutdown_token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, state, shutdown_token).await {
                            tracing::warn!("IPC client {} error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept IPC connection: {}", e);
                }
            }
        }

        tracing::info!("IPC server stopped");
        Ok(())
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<OrchestratorState>,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));

    // Subscribe before serving requests so no event of this client's own
    // operations is missed
    let mut event_rx = state.events.subscribe();

    loop {
        tokio::select! {
            next = lines.next() => {
                let response = match next {
                    None => break, // EOF
                    Some(Ok(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<IpcRequest>(trimmed) {
                            Ok(request) => handle_request(request, &state, &shutdown_token).await,
                            Err(e) => IpcResponse::Error {
                                message: format!("Invalid request: {}", e),
                            },
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => IpcResponse::Error {
                        message: format!("Request exceeds {} bytes", MAX_REQUEST_LINE),
                    },
                    Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                };
                write_message(&mut writer, response.into()).await?;
            }

            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        write_message(&mut writer, event.into()).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("IPC client lagged by {} events, disconnecting", n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            _ = shutdown_token.cancelled() => break,
        }
    }

    Ok(())
}

/// Write one newline-terminated message
async fn write_message<W>(writer: &mut W, message: IpcMessage) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut bytes = message.to_bytes()?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

fn error_response(error: impl std::fmt::Display) -> IpcResponse {
    IpcResponse::Error {
        message: error.to_string(),
    }
}

async fn handle_request(
    request: IpcRequest,
    state: &OrchestratorState,
    shutdown_token: &CancellationToken,
) -> IpcResponse {
    let lifecycle = &state.lifecycle;

    match request {
        IpcRequest::ListEndpoints => match lifecycle.list_endpoints().await {
            Ok(endpoints) => IpcResponse::Endpoints { endpoints },
            Err(e) => error_response(e),
        },

        IpcRequest::AddEndpoint { endpoint } => match lifecycle.add_endpoint(endpoint).await {
            Ok(created) => {
                IpcResponse::Endpoint(EndpointInfo::from_endpoint(&created, current_time_millis()))
            }
            Err(e) => error_response(e),
        },

        IpcRequest::UpdateEndpoint {
            endpoint_id,
            endpoint,
        } => match lifecycle.update_endpoint(endpoint_id, endpoint).await {
            Ok(updated) => {
                IpcResponse::Endpoint(EndpointInfo::from_endpoint(&updated, current_time_millis()))
            }
            Err(e) => error_response(e),
        },

        IpcRequest::RemoveEndpoint { endpoint_id } => {
            match lifecycle.remove_endpoint(endpoint_id).await {
                Ok(_) => IpcResponse::Ok,
                Err(e) => error_response(e),
            }
        }

        IpcRequest::StartEndpoint { endpoint_id } => {
            match lifecycle.start_endpoint(endpoint_id).await {
                Ok(endpoint) => IpcResponse::Accepted {
                    endpoint_id,
                    state: endpoint.state,
                },
                Err(e) => error_response(e),
            }
        }

        IpcRequest::StopEndpoint { endpoint_id } => {
            match lifecycle.stop_endpoint(endpoint_id).await {
                Ok(endpoint) => IpcResponse::Accepted {
                    endpoint_id,
                    state: endpoint.state,
                },
                Err(e) => error_response(e),
            }
        }

        IpcRequest::RestartEndpoint { endpoint_id } => {
            match lifecycle.restart_endpoint(endpoint_id).await {
                Ok(endpoint) => IpcResponse::Accepted {
                    endpoint_id,
                    state: endpoint.state,
                },
                Err(e) => error_response(e),
            }
        }

        IpcRequest::GetRuntimeStatus { endpoint_id } => {
            match lifecycle.endpoint_runtime_status(endpoint_id).await {
                Ok(status) => IpcResponse::RuntimeStatus(status),
                Err(e) => error_response(e),
            }
        }

        IpcRequest::GetLogs { endpoint_id, lines } => {
            match lifecycle.endpoint_logs(endpoint_id, lines).await {
                Ok(output) => IpcResponse::Logs {
                    endpoint_id,
                    output,
                },
                Err(e) => error_response(e),
            }
        }

        IpcRequest::GetTrafficStats => IpcResponse::Traffic(lifecycle.aggregate_traffic().await),

        IpcRequest::GetSummary => match lifecycle.system_summary().await {
            Ok(summary) => IpcResponse::Summary(summary),
            Err(e) => error_response(e),
        },

        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::Shutdown => {
            tracing::info!("Shutdown requested via IPC");
            shutdown_token.cancel();
            IpcResponse::Ok
        }
    }
}
