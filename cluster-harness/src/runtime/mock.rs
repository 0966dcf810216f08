//! Mock runtime for testing.
//!
//! Keeps container state in memory, records every call, and lets tests
//! script health-check outcomes and exec output.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::{ExecOutput, Runtime, RuntimeError};
use crate::service::ServiceDefinition;

/// A call made against the mock runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `start(service)`
    Start(String),
    /// `stop(service)`
    Stop(String),
    /// `down(destroy_volumes)`
    Down(bool),
    /// `kill(service, signal)`
    Kill(String, String),
    /// `exec(service, cmd)`
    Exec(String, Vec<String>),
    /// `invoke(args)`
    Invoke(Vec<String>),
}

/// Health behaviour of a mock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    /// Healthy as soon as it runs.
    Immediate,
    /// Healthy after this many failed checks.
    AfterChecks(u32),
    /// Never becomes healthy.
    Never,
}

#[derive(Debug)]
struct MockContainer {
    running: bool,
    checks: u32,
    definition: ServiceDefinition,
}

#[derive(Debug, Default)]
struct MockRuntimeInner {
    containers: HashMap<String, MockContainer>,
    health: HashMap<String, Health>,
    exec_outputs: HashMap<String, ExecOutput>,
    invoke_output: ExecOutput,
    fail_next_start: Option<String>,
    start_delay: Option<Duration>,
    start_gate: Option<Arc<Notify>>,
    host_ports: HashMap<(String, u16), u16>,
    calls: Vec<MockCall>,
}

/// Mock runtime for testing.
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    inner: Arc<Mutex<MockRuntimeInner>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` fail every health check.
    pub fn never_healthy(&self, service: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.health.insert(service.to_string(), Health::Never);
    }

    /// Make `service` pass its health check after `failed` failing checks.
    pub fn healthy_after(&self, service: &str, failed: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .health
            .insert(service.to_string(), Health::AfterChecks(failed));
    }

    /// Cause the next start() to fail with the given error.
    pub fn fail_next_start(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_start = Some(error.to_string());
    }

    /// Delay every start() by `delay`.
    pub fn set_start_delay(&self, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_delay = Some(delay);
    }

    /// Hold every start() until the returned gate is notified, once per start.
    pub fn gate_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let mut inner = self.inner.lock().unwrap();
        inner.start_gate = Some(gate.clone());
        gate
    }

    /// Publish `container_port` of `service` on `host_port`.
    ///
    /// Unmapped ports are published on the same number.
    pub fn map_port(&self, service: &str, container_port: u16, host_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .host_ports
            .insert((service.to_string(), container_port), host_port);
    }

    /// Output returned by exec() in `service`.
    pub fn set_exec_output(&self, service: &str, output: ExecOutput) {
        let mut inner = self.inner.lock().unwrap();
        inner.exec_outputs.insert(service.to_string(), output);
    }

    /// Output returned by invoke().
    pub fn set_invoke_output(&self, output: ExecOutput) {
        let mut inner = self.inner.lock().unwrap();
        inner.invoke_output = output;
    }

    /// Simulate the service's process exiting on its own.
    pub fn crash(&self, service: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(service) {
            container.running = false;
        }
    }

    /// Whether the mock considers `service` running.
    pub fn running(&self, service: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(service)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Definition `service` was last started with.
    pub fn started_definition(&self, service: &str) -> Option<ServiceDefinition> {
        let inner = self.inner.lock().unwrap();
        inner.containers.get(service).map(|c| c.definition.clone())
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        let inner = self.inner.lock().unwrap();
        inner.calls.clone()
    }

    /// Names passed to start(), in order.
    pub fn start_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start(
        &self,
        service: &ServiceDefinition,
        _project: &[ServiceDefinition],
    ) -> Result<(), RuntimeError> {
        self.record(MockCall::Start(service.name.clone()));

        let (delay, gate) = {
            let inner = self.inner.lock().unwrap();
            (inner.start_delay, inner.start_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_start.take() {
            return Err(RuntimeError::Compose(error));
        }
        inner.containers.insert(
            service.name.clone(),
            MockContainer {
                running: true,
                checks: 0,
                definition: service.clone(),
            },
        );
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        self.record(MockCall::Stop(service.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(service) {
            container.running = false;
        }
        Ok(())
    }

    async fn down(&self, destroy_volumes: bool) -> Result<(), RuntimeError> {
        self.record(MockCall::Down(destroy_volumes));
        let mut inner = self.inner.lock().unwrap();
        inner.containers.clear();
        Ok(())
    }

    async fn kill(&self, service: &str, signal: &str) -> Result<(), RuntimeError> {
        self.record(MockCall::Kill(service.to_string(), signal.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(service) {
            Some(container) if container.running => {
                container.running = false;
                Ok(())
            }
            _ => Err(RuntimeError::Compose(format!("{} is not running", service))),
        }
    }

    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError> {
        Ok(self.running(service))
    }

    async fn is_healthy(&self, service: &str) -> Result<bool, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let health = inner
            .health
            .get(service)
            .copied()
            .unwrap_or(Health::Immediate);
        let Some(container) = inner.containers.get_mut(service) else {
            return Ok(false);
        };
        if !container.running {
            return Ok(false);
        }
        container.checks += 1;
        Ok(match health {
            Health::Immediate => true,
            Health::AfterChecks(failed) => container.checks > failed,
            Health::Never => false,
        })
    }

    async fn exec(&self, service: &str, cmd: &[&str]) -> Result<ExecOutput, RuntimeError> {
        self.record(MockCall::Exec(
            service.to_string(),
            cmd.iter().map(|s| s.to_string()).collect(),
        ));
        let inner = self.inner.lock().unwrap();
        Ok(inner.exec_outputs.get(service).cloned().unwrap_or_default())
    }

    async fn host_port(&self, service: &str, container_port: u16) -> Result<u16, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        match inner.containers.get(service) {
            Some(c) if c.running && c.definition.ports.contains(&container_port) => Ok(inner
                .host_ports
                .get(&(service.to_string(), container_port))
                .copied()
                .unwrap_or(container_port)),
            _ => Err(RuntimeError::PortNotPublished {
                service: service.to_string(),
                port: container_port,
            }),
        }
    }

    async fn invoke(&self, args: &[&str]) -> Result<ExecOutput, RuntimeError> {
        self.record(MockCall::Invoke(args.iter().map(|s| s.to_string()).collect()));
        let inner = self.inner.lock().unwrap();
        Ok(inner.invoke_output.clone())
    }
}
