//! Docker backend: `docker compose` for lifecycle, bollard for the rest.
//!
//! Each runtime owns a unique compose project name and a temp directory
//! holding the rendered compose file, so concurrent harness runs on one
//! host never see each other's containers.

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, KillContainerOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HealthStatusEnum;
use bollard::Docker;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{ComposeFile, ExecOutput, Runtime, RuntimeError};
use crate::config::ProjectConfig;
use crate::service::ServiceDefinition;

/// Runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    /// Unique project name for Docker Compose isolation.
    project_name: String,
    /// Compose CLI binary (`docker`).
    compose_binary: String,
    /// bollard Docker client.
    docker: Docker,
    /// Holds the rendered compose file; removed on drop.
    work_dir: tempfile::TempDir,
    /// Serializes rewrites of the compose file. Readers see either the old
    /// or the new file, never a partial one.
    render_lock: Mutex<()>,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("project_name", &self.project_name)
            .field("work_dir", &self.work_dir.path())
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local daemon and allocate a unique project.
    pub fn new(config: &ProjectConfig) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        let project_name = format!(
            "{}-{}",
            config.name_prefix,
            &uuid::Uuid::new_v4().as_simple().to_string()[..12]
        );
        let work_dir = tempfile::Builder::new().prefix("cluster-harness-").tempdir()?;

        let runtime = Self {
            project_name,
            compose_binary: config.compose_binary.clone(),
            docker,
            work_dir,
            render_lock: Mutex::new(()),
        };

        // An empty project keeps `invoke` and `down` valid before any `up`.
        std::fs::write(
            runtime.compose_file(),
            ComposeFile::from_definitions(&[]).to_json()?,
        )?;

        Ok(runtime)
    }

    /// Get the unique project name.
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Path of the rendered compose file.
    pub fn compose_file(&self) -> PathBuf {
        self.work_dir.path().join("compose.json")
    }

    /// Build the full container name from project name and service.
    ///
    /// Docker Compose naming: `<project>-<service>-1`
    fn container_name(&self, service: &str) -> String {
        container_name(&self.project_name, service)
    }

    async fn render(&self, project: &[ServiceDefinition]) -> Result<(), RuntimeError> {
        let json = ComposeFile::from_definitions(project).to_json()?;
        replace_file(&self.compose_file(), json.as_bytes()).await?;
        Ok(())
    }

    /// Run `docker compose -f <file> -p <project> <args>` and capture output.
    async fn compose(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
        let file = self.compose_file();
        let output = tokio::process::Command::new(&self.compose_binary)
            .arg("compose")
            .arg("-f")
            .arg(&file)
            .arg("-p")
            .arg(&self.project_name)
            .args(args)
            .output()
            .await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }

    async fn compose_ok(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
        let output = self.compose(args).await?;
        if !output.success() {
            return Err(RuntimeError::Compose(format!(
                "docker compose {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn inspect(
        &self,
        service: &str,
    ) -> Result<Option<bollard::models::ContainerInspectResponse>, RuntimeError> {
        let name = self.container_name(service);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn start(
        &self,
        service: &ServiceDefinition,
        project: &[ServiceDefinition],
    ) -> Result<(), RuntimeError> {
        let _guard = self.render_lock.lock().await;
        self.render(project).await?;
        // Dependencies are started by the composition, in order.
        self.compose_ok(&["up", "-d", "--no-deps", &service.name])
            .await?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        self.compose_ok(&["stop", service]).await?;
        Ok(())
    }

    async fn down(&self, destroy_volumes: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["down", "--remove-orphans"];
        if destroy_volumes {
            args.push("-v");
        }
        self.compose_ok(&args).await?;
        Ok(())
    }

    async fn kill(&self, service: &str, signal: &str) -> Result<(), RuntimeError> {
        let name = self.container_name(service);
        self.docker
            .kill_container(&name, Some(KillContainerOptions { signal }))
            .await?;
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError> {
        let info = self.inspect(service).await?;
        Ok(info
            .and_then(|i| i.state)
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn is_healthy(&self, service: &str) -> Result<bool, RuntimeError> {
        let Some(state) = self.inspect(service).await?.and_then(|i| i.state) else {
            return Ok(false);
        };
        if !state.running.unwrap_or(false) {
            return Ok(false);
        }
        Ok(match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => true,
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => true,
            Some(_) => false,
        })
    }

    async fn exec(&self, service: &str, cmd: &[&str]) -> Result<ExecOutput, RuntimeError> {
        let container_name = self.container_name(service);

        let exec_options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&container_name, exec_options)
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn host_port(&self, service: &str, container_port: u16) -> Result<u16, RuntimeError> {
        let key = format!("{}/tcp", container_port);
        let port = self
            .inspect(service)
            .await?
            .and_then(|i| i.network_settings)
            .and_then(|n| n.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            });

        port.ok_or_else(|| RuntimeError::PortNotPublished {
            service: service.to_string(),
            port: container_port,
        })
    }

    async fn invoke(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
        self.compose(args).await
    }
}

fn container_name(project: &str, service: &str) -> String {
    format!("{}-{}-1", project, service)
}

/// Write `contents` next to `path`, then rename it into place.
async fn replace_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, contents).await?;
    tokio::fs::rename(&staging, path).await
}
