//! SSH command channel to backend hosts

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use rf_core::error::RemoteError;
use rf_core::types::BackendAccess;

use super::{RemoteConnector, RemoteShell};

/// Connects to backends over SSH with password or public-key auth
#[derive(Default)]
pub struct SshConnector {
    config: Arc<Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        backend: &BackendAccess,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, RemoteError> {
        let address = backend.ssh_address();
        let handler = HostKeyCheck {
            expected: backend.host_key_fingerprint.clone(),
        };

        tracing::debug!("Connecting to {}", address);
        let mut session = tokio::time::timeout(
            timeout,
            client::connect(Arc::clone(&self.config), address.as_str(), handler),
        )
        .await
        .map_err(|_| RemoteError::ConnectTimeout(address.clone()))?
        .map_err(|e| RemoteError::Connect {
            address: address.clone(),
            message: e.to_string(),
        })?;

        let authenticated = tokio::time::timeout(timeout, authenticate(&mut session, backend))
            .await
            .map_err(|_| RemoteError::ConnectTimeout(address.clone()))??;

        if !authenticated {
            return Err(RemoteError::AuthRejected {
                user: backend.username.clone(),
                address,
            });
        }

        tracing::debug!("Authenticated as '{}' on {}", backend.username, address);
        Ok(Box::new(SshShell {
            session: Mutex::new(session),
        }))
    }
}

/// Password or public-key authentication, whichever `backend` configures
async fn authenticate(
    session: &mut Handle<HostKeyCheck>,
    backend: &BackendAccess,
) -> Result<bool, RemoteError> {
    let address = backend.ssh_address();
    let auth = if let Some(key_path) = &backend.private_key_path {
        let key = russh_keys::load_secret_key(key_path, None).map_err(|e| {
            RemoteError::Credentials(format!("failed to load {}: {}", key_path.display(), e))
        })?;
        session
            .authenticate_publickey(&backend.username, Arc::new(key))
            .await
    } else if let Some(password) = &backend.password {
        session
            .authenticate_password(&backend.username, password)
            .await
    } else {
        return Err(RemoteError::Credentials(format!(
            "no password or private key for {}",
            address
        )));
    };
    auth.map_err(|e| RemoteError::Connect {
        address,
        message: format!("authentication error: {}", e),
    })
}

/// Client handler enforcing an optional pinned host key
struct HostKeyCheck {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        match &self.expected {
            Some(expected) if !fingerprint_matches(expected, &fingerprint) => {
                tracing::warn!(
                    "Host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

/// Compare fingerprints, accepting an optional `SHA256:` prefix on either side
fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("SHA256:").to_string();
    strip(expected) == strip(actual)
}

/// Authenticated SSH session; every command gets its own channel
struct SshShell {
    session: Mutex<Handle<HostKeyCheck>>,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<String, RemoteError> {
        let mut channel = self
            .session
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::Channel(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::Channel(format!("failed to exec: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Some(status) => {
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                let output = if stderr.is_empty() {
                    String::from_utf8_lossy(&stdout).trim().to_string()
                } else {
                    stderr
                };
                Err(RemoteError::CommandFailed {
                    command: command.to_string(),
                    status,
                    output,
                })
            }
            None => Err(RemoteError::NoExitStatus(command.to_string())),
        }
    }

    async fn close(&self) {
        let session = self.session.lock().await;
        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }
}
