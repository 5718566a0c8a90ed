//! Remote backend operations
//!
//! The driver runs named, ordered steps over a command channel to a backend
//! host and reports each one through a [`ProgressSink`]. The channel itself is
//! behind [`RemoteConnector`]/[`RemoteShell`] so the lifecycle can be exercised
//! without a real SSH server.

mod driver;
mod progress;
mod ssh;

pub use driver::{steps, ContainerStatus, RemoteDriver};
pub use progress::{NullSink, ProgressEvent, ProgressSink, RecordingSink};
pub use ssh::SshConnector;

use async_trait::async_trait;
use std::time::Duration;

use rf_core::error::RemoteError;
use rf_core::types::BackendAccess;

/// Opens command channels to backend hosts
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect and authenticate against `backend` within `timeout`
    async fn connect(
        &self,
        backend: &BackendAccess,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, RemoteError>;
}

/// An authenticated command channel to one backend host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and return its stdout.
    ///
    /// A non-zero exit is an error carrying the exit status and stderr.
    async fn exec(&self, command: &str) -> Result<String, RemoteError>;

    /// Close the connection
    async fn close(&self);
}
