//! Shared fixtures: a scripted backend host and loopback configuration

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use rf_core::config::OrchestratorConfig;
use rf_core::error::RemoteError;
use rf_core::types::BackendAccess;
use rf_core::NewEndpoint;
use rf_orchestrator::remote::{RemoteConnector, RemoteShell};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Simulated backend host running the container runtime.
///
/// Tracks whether the tunnel container exists and answers the commands the
/// driver issues. Commands containing a configured pattern fail, and image
/// pulls can be held until released.
pub struct FakeBackend {
    container: AtomicBool,
    connects: AtomicUsize,
    fail_on: Mutex<Option<&'static str>>,
    hold: watch::Sender<bool>,
    log: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (hold, _) = watch::channel(false);
        Arc::new(Self {
            container: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
            hold,
            log: Mutex::new(Vec::new()),
        })
    }

    /// Fail every command containing `pattern` with exit status 1
    pub fn fail_on(&self, pattern: &'static str) {
        *self.fail_on.lock().unwrap() = Some(pattern);
    }

    /// Block image pulls until [`FakeBackend::release`]
    pub fn hold_pulls(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    pub fn container_running(&self) -> bool {
        self.container.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn reply(&self, command: &str) -> Result<String, RemoteError> {
        if let Some(pattern) = *self.fail_on.lock().unwrap() {
            if command.contains(pattern) {
                return Err(RemoteError::CommandFailed {
                    command: command.to_string(),
                    status: 1,
                    output: "simulated failure".to_string(),
                });
            }
        }

        let running = self.container.load(Ordering::SeqCst);
        let out = if command.starts_with("docker run") {
            self.container.store(true, Ordering::SeqCst);
            "c0ffee\n"
        } else if command.starts_with("docker rm") {
            self.container.store(false, Ordering::SeqCst);
            ""
        } else if command.starts_with("docker ps") {
            if running {
                "c0ffee\n"
            } else {
                ""
            }
        } else if command.contains("State.Running") {
            if running {
                "true\n"
            } else {
                "false\n"
            }
        } else if command.contains("State.StartedAt") {
            "2024-01-01T00:00:00.000000000Z\n"
        } else if command.starts_with("docker logs") {
            "tunnel service ready\n"
        } else {
            ""
        };
        Ok(out.to_string())
    }
}

struct FakeShell(Arc<FakeBackend>);

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, command: &str) -> Result<String, RemoteError> {
        self.0.log.lock().unwrap().push(command.to_string());
        if command.starts_with("docker pull") {
            let mut held = self.0.hold.subscribe();
            loop {
                let holding = *held.borrow_and_update();
                if !holding || held.changed().await.is_err() {
                    break;
                }
            }
        }
        self.0.reply(command)
    }

    async fn close(&self) {}
}

/// Connector handing out shells on one [`FakeBackend`]
pub struct FakeConnector(pub Arc<FakeBackend>);

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        _backend: &BackendAccess,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, RemoteError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeShell(Arc::clone(&self.0))))
    }
}

/// Loopback configuration with short timeouts
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.ipc_port = 0;
    config.health_interval = Duration::from_millis(100);
    config.create_probe_timeout = Duration::from_secs(1);
    config.sweep_probe_timeout = Duration::from_millis(500);
    config.restart_settle = Duration::from_millis(20);
    config.shutdown_grace = Duration::from_secs(2);
    config.remote.readiness_timeout = Duration::from_millis(200);
    config.remote.readiness_poll_interval = Duration::from_millis(10);
    config.remote.command_timeout = Duration::from_secs(5);
    config.forwarder.bind_address = LOOPBACK;
    config
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn new_endpoint(host: &str, listen_port: u16) -> NewEndpoint {
    NewEndpoint {
        name: format!("edge-{}", listen_port),
        backend: BackendAccess::with_password(host, "root", "secret"),
        listen_port,
        psk: "shared-key".to_string(),
        users: vec![],
        expires_at: None,
    }
}
