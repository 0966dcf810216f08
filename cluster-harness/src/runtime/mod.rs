//! Container runtime abstraction.
//!
//! The composition drives services through the [`Runtime`] trait and never
//! talks to Docker directly. [`DockerRuntime`] is the real backend;
//! [`MockRuntime`] keeps everything in memory for unit tests.
//!
//! # Design
//!
//! The runtime is stateless with respect to the harness's own bookkeeping:
//! - `start()` receives the full set of visible definitions so the backend
//!   can render a consistent project
//! - `is_running()` / `is_healthy()` report what the backend observes
//! - `kill()` / `stop()` / `down()` change container state only

mod compose;
mod docker;
mod mock;

pub use compose::ComposeFile;
pub use docker::DockerRuntime;
pub use mock::{MockCall, MockRuntime};

use async_trait::async_trait;
use thiserror::Error;

use crate::service::ServiceDefinition;

/// Container runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Docker API error.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Docker Compose CLI error.
    #[error("compose error: {0}")]
    Compose(String),

    /// Container port has no host binding.
    #[error("port {port} of {service} is not published")]
    PortNotPublished {
        /// Service name.
        service: String,
        /// Container port.
        port: u16,
    },

    /// Compose file could not be rendered.
    #[error("render error: {0}")]
    Render(#[from] serde_json::Error),

    /// General I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of executing a command inside a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i64,
}

impl ExecOutput {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Start/stop/kill/exec primitives the composition is built on.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start (or restart) `service`. `project` holds every visible definition.
    ///
    /// Does not wait for health; the composition polls `is_healthy()`.
    async fn start(
        &self,
        service: &ServiceDefinition,
        project: &[ServiceDefinition],
    ) -> Result<(), RuntimeError>;

    /// Stop one service, keeping its container.
    async fn stop(&self, service: &str) -> Result<(), RuntimeError>;

    /// Stop and remove every service, optionally discarding volumes.
    async fn down(&self, destroy_volumes: bool) -> Result<(), RuntimeError>;

    /// Send `signal` to the service's main process.
    async fn kill(&self, service: &str, signal: &str) -> Result<(), RuntimeError>;

    /// Whether the service's container is currently running.
    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError>;

    /// Whether the service passes its health check.
    ///
    /// Services without a health check are healthy once running.
    async fn is_healthy(&self, service: &str) -> Result<bool, RuntimeError>;

    /// Run a command inside the service and capture its output.
    async fn exec(&self, service: &str, cmd: &[&str]) -> Result<ExecOutput, RuntimeError>;

    /// Host port a container port is published on.
    async fn host_port(&self, service: &str, container_port: u16) -> Result<u16, RuntimeError>;

    /// Run an administrative command against the orchestration layer.
    async fn invoke(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError>;
}
