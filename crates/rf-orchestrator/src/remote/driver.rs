//! Start/stop procedures for the tunnel container on a backend host

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use rf_core::config::RemoteConfig;
use rf_core::error::{RemoteError, StepError};
use rf_core::types::TunnelUser;
use rf_core::Endpoint;

use super::{ProgressEvent, ProgressSink, RemoteConnector, RemoteShell};

/// Step names reported through the progress sink
pub mod steps {
    pub const CONNECT: &str = "connect";
    pub const RUNTIME_CHECK: &str = "runtime_check";
    pub const CLEANUP: &str = "cleanup";
    pub const CREDENTIALS: &str = "credentials";
    pub const IMAGE_PULL: &str = "image_pull";
    pub const CONTAINER_LAUNCH: &str = "container_launch";
    pub const READINESS: &str = "readiness";
    pub const CONTAINER_CHECK: &str = "container_check";
    pub const CONTAINER_STOP: &str = "container_stop";
}

/// Observed state of the tunnel container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    /// Time since the container started, when running and parseable
    pub uptime: Option<Duration>,
}

/// Runs the remote step sequences against backend hosts
pub struct RemoteDriver {
    connector: Arc<dyn RemoteConnector>,
    config: RemoteConfig,
}

impl RemoteDriver {
    pub fn new(connector: Arc<dyn RemoteConnector>, config: RemoteConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Bring the tunnel container up on the endpoint's backend.
    ///
    /// Every step is reported to `sink`; the first failing step aborts the
    /// sequence and is returned.
    pub async fn start(
        &self,
        endpoint: &Endpoint,
        sink: &dyn ProgressSink,
    ) -> Result<(), StepError> {
        let shell = self.connect(endpoint, sink).await?;
        let result = self.run_start(shell.as_ref(), endpoint, sink).await;
        shell.close().await;
        result
    }

    /// Stop and remove the tunnel container. A missing container is success.
    pub async fn stop(&self, endpoint: &Endpoint, sink: &dyn ProgressSink) -> Result<(), StepError> {
        let shell = self.connect(endpoint, sink).await?;
        let result = self.run_stop(shell.as_ref(), sink).await;
        shell.close().await;
        result
    }

    /// Query whether the container runs and for how long
    pub async fn container_status(&self, endpoint: &Endpoint) -> Result<ContainerStatus, RemoteError> {
        let shell = self.open(endpoint).await?;
        let result = self.query_status(shell.as_ref()).await;
        shell.close().await;
        result
    }

    /// Last `lines` lines of the container log
    pub async fn logs(&self, endpoint: &Endpoint, lines: u32) -> Result<String, RemoteError> {
        let shell = self.open(endpoint).await?;
        let result = self.query_logs(shell.as_ref(), lines).await;
        shell.close().await;
        result
    }

    /// Connect to the endpoint's backend with every command bounded by
    /// `command_timeout`
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteShell>, RemoteError> {
        let shell = self
            .connector
            .connect(&endpoint.backend, self.config.connect_timeout)
            .await?;
        Ok(Box::new(TimedShell {
            inner: shell,
            timeout: self.config.command_timeout,
        }))
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        sink: &dyn ProgressSink,
    ) -> Result<Box<dyn RemoteShell>, StepError> {
        match self.open(endpoint).await {
            Ok(shell) => {
                report_ok(
                    sink,
                    steps::CONNECT,
                    format!("Connected to {}", endpoint.backend.ssh_address()),
                );
                Ok(shell)
            }
            Err(e) => Err(report_err(sink, steps::CONNECT, "Connection failed", e)),
        }
    }

    async fn run_start(
        &self,
        shell: &dyn RemoteShell,
        endpoint: &Endpoint,
        sink: &dyn ProgressSink,
    ) -> Result<(), StepError> {
        let name = &self.config.container_name;

        if let Err(e) = self.ensure_runtime(shell).await {
            return Err(report_err(
                sink,
                steps::RUNTIME_CHECK,
                "Container runtime unavailable",
                e,
            ));
        }
        report_ok(sink, steps::RUNTIME_CHECK, "Container runtime ready");

        remove_container(shell, name).await;
        report_ok(sink, steps::CLEANUP, "Stale container removed");

        let users = match users_env(&endpoint.users, &self.config.default_users) {
            Ok(users) => users,
            Err(message) => {
                let err = StepError::new(steps::CREDENTIALS, message);
                sink.report(failed(&err));
                return Err(err);
            }
        };
        report_ok(sink, steps::CREDENTIALS, "Tunnel users resolved");

        let pull = format!("docker pull {}", shell_quote(&self.config.image));
        if let Err(e) = shell.exec(&pull).await {
            return Err(report_err(
                sink,
                steps::IMAGE_PULL,
                format!("Failed to pull {}", self.config.image),
                e,
            ));
        }
        report_ok(sink, steps::IMAGE_PULL, format!("Pulled {}", self.config.image));

        let run = self.run_command(&endpoint.psk, &users);
        if let Err(e) = shell.exec(&run).await {
            return Err(report_err(
                sink,
                steps::CONTAINER_LAUNCH,
                "Failed to launch container",
                e,
            ));
        }
        report_ok(sink, steps::CONTAINER_LAUNCH, format!("Container {} launched", name));

        self.await_readiness(shell, sink).await
    }

    async fn ensure_runtime(&self, shell: &dyn RemoteShell) -> Result<(), RemoteError> {
        if shell.exec("docker --version").await.is_ok() && shell.exec("docker info").await.is_ok()
        {
            return Ok(());
        }

        tracing::info!("Container runtime missing, installing");
        shell.exec(&self.config.runtime_install_command).await?;
        shell.exec("docker --version").await?;
        Ok(())
    }

    /// Poll the container's running flag until it is set or the deadline passes
    async fn await_readiness(
        &self,
        shell: &dyn RemoteShell,
        sink: &dyn ProgressSink,
    ) -> Result<(), StepError> {
        let name = &self.config.container_name;
        let inspect = format!("docker inspect -f '{{{{.State.Running}}}}' {}", shell_quote(name));
        let deadline = Instant::now() + self.config.readiness_timeout;

        loop {
            match shell.exec(&inspect).await {
                Ok(out) if out.trim() == "true" => {
                    report_ok(sink, steps::READINESS, "Container is running");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Readiness not observable: {}", e);
                    report_ok(
                        sink,
                        steps::READINESS,
                        "Readiness not observable, assuming running",
                    );
                    return Ok(());
                }
            }

            if Instant::now() + self.config.readiness_poll_interval > deadline {
                break;
            }
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }

        if self.config.strict_readiness {
            remove_container(shell, name).await;
            let err = StepError::new(
                steps::READINESS,
                format!(
                    "Container not running after {:?}",
                    self.config.readiness_timeout
                ),
            );
            sink.report(failed(&err));
            return Err(err);
        }

        report_ok(
            sink,
            steps::READINESS,
            "Readiness timed out, assuming running",
        );
        Ok(())
    }

    fn run_command(&self, psk: &str, users: &str) -> String {
        let mut cmd = format!(
            "docker run -d --name {} --restart always",
            shell_quote(&self.config.container_name)
        );
        for mapping in &self.config.published_ports {
            cmd.push_str(&format!(" -p {}", shell_quote(mapping)));
        }
        cmd.push_str(&format!(
            " -e {} -e {} --cap-add NET_ADMIN -v /lib/modules:/lib/modules:ro {}",
            shell_quote(&format!("PSK={}", psk)),
            shell_quote(&format!("USERS={}", users)),
            shell_quote(&self.config.image),
        ));
        cmd
    }

    async fn run_stop(&self, shell: &dyn RemoteShell, sink: &dyn ProgressSink) -> Result<(), StepError> {
        let name = &self.config.container_name;

        let exists = match container_exists(shell, name).await {
            Ok(exists) => exists,
            Err(e) => {
                return Err(report_err(
                    sink,
                    steps::CONTAINER_CHECK,
                    "Failed to check container",
                    e,
                ))
            }
        };
        if !exists {
            report_ok(
                sink,
                steps::CONTAINER_CHECK,
                "Container does not exist, nothing to stop",
            );
            return Ok(());
        }
        report_ok(sink, steps::CONTAINER_CHECK, format!("Found container {}", name));

        let quoted = shell_quote(name);
        for cmd in [format!("docker stop {}", quoted), format!("docker rm {}", quoted)] {
            if let Err(e) = shell.exec(&cmd).await {
                return Err(report_err(
                    sink,
                    steps::CONTAINER_STOP,
                    "Failed to stop container",
                    e,
                ));
            }
        }
        report_ok(sink, steps::CONTAINER_STOP, "Container stopped and removed");
        Ok(())
    }

    async fn query_status(&self, shell: &dyn RemoteShell) -> Result<ContainerStatus, RemoteError> {
        let name = &self.config.container_name;
        let running = shell
            .exec(&format!("docker ps -q -f {}", name_filter(name)))
            .await?;
        if running.trim().is_empty() {
            return Ok(ContainerStatus {
                running: false,
                uptime: None,
            });
        }

        let started = shell
            .exec(&format!(
                "docker inspect -f '{{{{.State.StartedAt}}}}' {}",
                shell_quote(name)
            ))
            .await
            .ok();
        let uptime = started.and_then(|s| uptime_since(s.trim(), Utc::now()));

        Ok(ContainerStatus {
            running: true,
            uptime,
        })
    }

    async fn query_logs(&self, shell: &dyn RemoteShell, lines: u32) -> Result<String, RemoteError> {
        let name = &self.config.container_name;
        if !container_exists(shell, name).await? {
            return Ok("Container does not exist".to_string());
        }
        shell
            .exec(&format!("docker logs --tail {} {} 2>&1", lines, shell_quote(name)))
            .await
    }
}

/// Shell whose commands fail with `CommandTimeout` once they run too long
struct TimedShell {
    inner: Box<dyn RemoteShell>,
    timeout: Duration,
}

#[async_trait]
impl RemoteShell for TimedShell {
    async fn exec(&self, command: &str) -> Result<String, RemoteError> {
        tokio::time::timeout(self.timeout, self.inner.exec(command))
            .await
            .map_err(|_| RemoteError::CommandTimeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

async fn container_exists(shell: &dyn RemoteShell, name: &str) -> Result<bool, RemoteError> {
    let out = shell
        .exec(&format!("docker ps -a -q -f {}", name_filter(name)))
        .await?;
    Ok(!out.trim().is_empty())
}

/// Stop and remove a container, ignoring failures
async fn remove_container(shell: &dyn RemoteShell, name: &str) {
    let quoted = shell_quote(name);
    for cmd in [format!("docker stop {}", quoted), format!("docker rm {}", quoted)] {
        if let Err(e) = shell.exec(&cmd).await {
            tracing::debug!("Ignoring cleanup failure: {}", e);
        }
    }
}

/// Exact-match container name filter
fn name_filter(name: &str) -> String {
    shell_quote(&format!("name=^/{}$", name))
}

/// Quote `s` for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Build the `USERS` value (`name:password,...`), using `defaults` when empty
fn users_env(users: &[TunnelUser], defaults: &[TunnelUser]) -> Result<String, String> {
    let users = if users.is_empty() { defaults } else { users };
    if users.is_empty() {
        return Err("No tunnel users configured".to_string());
    }

    let mut entries = Vec::with_capacity(users.len());
    for user in users {
        if user.username.is_empty() || user.username.contains(&[':', ','][..]) {
            return Err(format!("Invalid tunnel user name {:?}", user.username));
        }
        if user.password.contains(',') {
            return Err(format!("Password of {} contains ','", user.username));
        }
        entries.push(format!("{}:{}", user.username, user.password));
    }
    Ok(entries.join(","))
}

/// Uptime from an RFC 3339 start time
fn uptime_since(started_at: &str, now: DateTime<Utc>) -> Option<Duration> {
    let started = DateTime::parse_from_rfc3339(started_at).ok()?;
    (now - started.with_timezone(&Utc)).to_std().ok()
}

fn report_ok(sink: &dyn ProgressSink, step: &'static str, detail: impl Into<String>) {
    sink.report(ProgressEvent {
        step,
        success: true,
        detail: detail.into(),
    });
}

fn failed(err: &StepError) -> ProgressEvent {
    ProgressEvent {
        step: err.step,
        success: false,
        detail: err.message.clone(),
    }
}

/// Report a failed step and build its error
fn report_err(
    sink: &dyn ProgressSink,
    step: &'static str,
    message: impl Into<String>,
    source: RemoteError,
) -> StepError {
    let err = StepError::remote(step, format!("{}: {}", message.into(), source), source);
    tracing::warn!("Step {} failed: {}", step, err.message);
    sink.report(failed(&err));
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RecordingSink;
    use rf_core::types::{BackendAccess, NewEndpoint};
    use rf_core::EndpointId;
    use std::sync::Mutex;

    /// Shell answering by the first rule whose pattern the command contains
    #[derive(Default)]
    struct Script {
        rules: Vec<(&'static str, Result<&'static str, u32>)>,
        log: Mutex<Vec<String>>,
    }

    impl Script {
        fn on(mut self, pattern: &'static str, reply: Result<&'static str, u32>) -> Self {
            self.rules.push((pattern, reply));
            self
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct ScriptShell(Arc<Script>);

    #[async_trait]
    impl RemoteShell for ScriptShell {
        async fn exec(&self, command: &str) -> Result<String, RemoteError> {
            self.0.log.lock().unwrap().push(command.to_string());
            let reply = self
                .0
                .rules
                .iter()
                .find(|(pattern, _)| command.contains(pattern))
                .map(|(_, reply)| *reply)
                .unwrap_or(Ok(""));
            reply
                .map(str::to_string)
                .map_err(|status| RemoteError::CommandFailed {
                    command: command.to_string(),
                    status,
                    output: "scripted failure".to_string(),
                })
        }

        async fn close(&self) {}
    }

    struct ScriptConnector {
        script: Arc<Script>,
        refuse: bool,
    }

    #[async_trait]
    impl RemoteConnector for ScriptConnector {
        async fn connect(
            &self,
            backend: &BackendAccess,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteShell>, RemoteError> {
            if self.refuse {
                return Err(RemoteError::Connect {
                    address: backend.ssh_address(),
                    message: "refused".to_string(),
                });
            }
            Ok(Box::new(ScriptShell(Arc::clone(&self.script))))
        }
    }

    fn driver(script: Script, config: RemoteConfig) -> (RemoteDriver, Arc<Script>) {
        let script = Arc::new(script);
        let connector = ScriptConnector {
            script: Arc::clone(&script),
            refuse: false,
        };
        (RemoteDriver::new(Arc::new(connector), config), script)
    }

    fn fast_config() -> RemoteConfig {
        RemoteConfig {
            readiness_timeout: Duration::from_millis(50),
            readiness_poll_interval: Duration::from_millis(10),
            ..RemoteConfig::default()
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::from_new(
            EndpointId::new(1),
            NewEndpoint {
                name: "edge".to_string(),
                backend: BackendAccess::with_password("10.0.0.5", "root", "secret"),
                listen_port: 5000,
                psk: "s3cr'et".to_string(),
                users: vec![],
                expires_at: None,
            },
            0,
        )
    }

    #[tokio::test]
    async fn test_start_reports_every_step_in_order() {
        let script = Script::default().on("State.Running", Ok("true\n"));
        let (driver, script) = driver(script, fast_config());
        let sink = RecordingSink::new();

        driver.start(&endpoint(), &sink).await.unwrap();

        assert_eq!(
            sink.steps(),
            vec![
                steps::CONNECT,
                steps::RUNTIME_CHECK,
                steps::CLEANUP,
                steps::CREDENTIALS,
                steps::IMAGE_PULL,
                steps::CONTAINER_LAUNCH,
                steps::READINESS,
            ]
        );
        assert!(sink.events().iter().all(|e| e.success));

        let run = script
            .commands()
            .into_iter()
            .find(|c| c.starts_with("docker run"))
            .unwrap();
        assert!(run.contains("--restart always"));
        assert!(run.contains("--cap-add NET_ADMIN"));
        assert!(run.contains("-p '1701:1701/udp'"));
        assert!(run.contains("/lib/modules:/lib/modules:ro"));
        assert!(run.contains(r"'PSK=s3cr'\''et'"));
        assert!(run.contains("'USERS=test:test123'"));
    }

    #[tokio::test]
    async fn test_pull_failure_aborts_with_step_name() {
        let script = Script::default().on("docker pull", Err(1));
        let (driver, script) = driver(script, fast_config());
        let sink = RecordingSink::new();

        let err = driver.start(&endpoint(), &sink).await.unwrap_err();
        assert_eq!(err.step, steps::IMAGE_PULL);
        assert!(err.to_string().starts_with("[image_pull]"));

        let last = sink.events().pop().unwrap();
        assert_eq!(last.step, steps::IMAGE_PULL);
        assert!(!last.success);
        assert!(!script.commands().iter().any(|c| c.starts_with("docker run")));
    }

    #[tokio::test]
    async fn test_runtime_installed_when_missing() {
        let script = Script::default()
            .on("docker info", Err(1))
            .on("State.Running", Ok("true"));
        let (driver, script) = driver(script, fast_config());

        driver.start(&endpoint(), &RecordingSink::new()).await.unwrap();
        assert!(script
            .commands()
            .iter()
            .any(|c| c.contains("get.docker.com")));
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_ignored() {
        let script = Script::default()
            .on("docker stop", Err(1))
            .on("docker rm", Err(1))
            .on("State.Running", Ok("true"));
        let (driver, _) = driver(script, fast_config());

        assert!(driver.start(&endpoint(), &RecordingSink::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_optimistic_by_default() {
        let script = Script::default().on("State.Running", Ok("false"));
        let (driver, _) = driver(script, fast_config());
        let sink = RecordingSink::new();

        driver.start(&endpoint(), &sink).await.unwrap();
        let last = sink.events().pop().unwrap();
        assert_eq!(last.step, steps::READINESS);
        assert!(last.success);
    }

    #[tokio::test]
    async fn test_strict_readiness_fails_and_removes_container() {
        let script = Script::default().on("State.Running", Ok("false"));
        let config = RemoteConfig {
            strict_readiness: true,
            ..fast_config()
        };
        let (driver, script) = driver(script, config);

        let err = driver
            .start(&endpoint(), &RecordingSink::new())
            .await
            .unwrap_err();
        assert_eq!(err.step, steps::READINESS);

        let commands = script.commands();
        let run_at = commands.iter().position(|c| c.starts_with("docker run")).unwrap();
        assert!(commands[run_at..].iter().any(|c| c.starts_with("docker rm")));
    }

    /// Shell whose image pull never finishes
    struct HangingPull;

    #[async_trait]
    impl RemoteShell for HangingPull {
        async fn exec(&self, command: &str) -> Result<String, RemoteError> {
            if command.starts_with("docker pull") {
                std::future::pending::<()>().await;
            }
            Ok(String::new())
        }

        async fn close(&self) {}
    }

    struct HangingConnector;

    #[async_trait]
    impl RemoteConnector for HangingConnector {
        async fn connect(
            &self,
            _backend: &BackendAccess,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteShell>, RemoteError> {
            Ok(Box::new(HangingPull))
        }
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let config = RemoteConfig {
            command_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let driver = RemoteDriver::new(Arc::new(HangingConnector), config);
        let sink = RecordingSink::new();

        let err = tokio::time::timeout(Duration::from_secs(5), driver.start(&endpoint(), &sink))
            .await
            .expect("start never returned")
            .unwrap_err();
        assert_eq!(err.step, steps::IMAGE_PULL);
        assert!(err.message.contains("timed out"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_connect_failure_is_tagged() {
        let connector = ScriptConnector {
            script: Arc::new(Script::default()),
            refuse: true,
        };
        let driver = RemoteDriver::new(Arc::new(connector), fast_config());
        let sink = RecordingSink::new();

        let err = driver.stop(&endpoint(), &sink).await.unwrap_err();
        assert_eq!(err.step, steps::CONNECT);
        assert_eq!(sink.steps(), vec![steps::CONNECT]);
    }

    #[tokio::test]
    async fn test_stop_missing_container_is_success() {
        let (driver, script) = driver(Script::default(), fast_config());
        let sink = RecordingSink::new();

        driver.stop(&endpoint(), &sink).await.unwrap();
        assert_eq!(sink.steps(), vec![steps::CONNECT, steps::CONTAINER_CHECK]);
        assert!(!script.commands().iter().any(|c| c.starts_with("docker stop")));
    }

    #[tokio::test]
    async fn test_stop_existing_container() {
        let script = Script::default().on("docker ps -a -q", Ok("f00d\n"));
        let (driver, _) = driver(script, fast_config());
        let sink = RecordingSink::new();

        driver.stop(&endpoint(), &sink).await.unwrap();
        assert_eq!(
            sink.steps(),
            vec![steps::CONNECT, steps::CONTAINER_CHECK, steps::CONTAINER_STOP]
        );
    }

    #[tokio::test]
    async fn test_container_status_reports_uptime() {
        let script = Script::default()
            .on("docker ps -q", Ok("f00d\n"))
            .on("StartedAt", Ok("2020-01-01T00:00:00.123456789Z\n"));
        let (driver, _) = driver(script, fast_config());

        let status = driver.container_status(&endpoint()).await.unwrap();
        assert!(status.running);
        assert!(status.uptime.unwrap() > Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_logs_of_missing_container() {
        let (driver, _) = driver(Script::default(), fast_config());
        let logs = driver.logs(&endpoint(), 50).await.unwrap();
        assert_eq!(logs, "Container does not exist");
    }

    #[test]
    fn test_users_env() {
        let defaults = vec![TunnelUser::new("test", "test123")];
        assert_eq!(users_env(&[], &defaults).unwrap(), "test:test123");

        let users = vec![TunnelUser::new("a", "1"), TunnelUser::new("b", "2")];
        assert_eq!(users_env(&users, &defaults).unwrap(), "a:1,b:2");

        assert!(users_env(&[TunnelUser::new("a:b", "1")], &defaults).is_err());
        assert!(users_env(&[], &[]).is_err());
    }

    #[test]
    fn test_uptime_since() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T01:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            uptime_since("2024-01-01T00:00:00.5Z", now),
            Some(Duration::from_millis(3_604_500))
        );
        assert_eq!(uptime_since("garbage", now), None);
        assert_eq!(uptime_since("2024-01-01T02:00:00Z", now), None);
    }
}
