//! Service registry and lifecycle.
//!
//! A [`Composition`] holds the base service definitions, a stack of scoped
//! overrides per name, and one state slot per service. Structural
//! operations (`up`, `kill`, `down`) take the slot lock of the service they
//! act on, so operations on the same name are mutually exclusive while
//! operations on different names proceed independently.
//!
//! ```text
//! definitions: name ─► [(scope 0, base), (scope 3, override), ...]   innermost wins
//! slots:       name ─► Mutex<RunningService>                          Stopped/Starting/Running/Killed
//! ```

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{ExecError, HarnessError};
use crate::metrics::{MetricsScraper, MetricsSnapshot};
use crate::runtime::{ExecOutput, Runtime};
use crate::script::{ScriptOptions, ScriptRunner, SqlBackend};
use crate::service::ServiceDefinition;
use crate::sql::{Rows, SqlClient, SqlOptions};

/// Scope id of the base definitions.
const BASE_SCOPE: u64 = 0;

/// Signal used by [`Composition::kill`].
pub const KILL_SIGNAL: &str = "SIGKILL";

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not started, stopped, or failed to start.
    Stopped,
    /// Started, waiting for the health check.
    Starting,
    /// Health check passed.
    Running,
    /// Forcefully terminated.
    Killed,
}

/// Runtime record for one service name.
#[derive(Debug)]
pub struct RunningService {
    /// Service name.
    pub name: String,
    /// Current state.
    pub state: ServiceState,
    /// Definition the current instance was started with.
    started: Option<ServiceDefinition>,
}

impl RunningService {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ServiceState::Stopped,
            started: None,
        }
    }
}

type DefinitionStack = Vec<(u64, ServiceDefinition)>;

/// Named services, their overrides, and their running state.
pub struct Composition {
    config: HarnessConfig,
    runtime: Box<dyn Runtime>,
    definitions: std::sync::Mutex<BTreeMap<String, DefinitionStack>>,
    next_scope: AtomicU64,
    slots: DashMap<String, Arc<Mutex<RunningService>>>,
    metrics: MetricsScraper,
}

impl std::fmt::Debug for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composition")
            .field("services", &self.service_names())
            .finish_non_exhaustive()
    }
}

impl Composition {
    /// Create a composition from base definitions.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if two definitions share a name.
    pub fn new(
        config: HarnessConfig,
        runtime: Box<dyn Runtime>,
        services: Vec<ServiceDefinition>,
    ) -> Result<Self, HarnessError> {
        let mut definitions = BTreeMap::new();
        for def in services {
            if definitions.contains_key(&def.name) {
                return Err(HarnessError::Configuration(format!(
                    "duplicate service name: {}",
                    def.name
                )));
            }
            definitions.insert(def.name.clone(), vec![(BASE_SCOPE, def)]);
        }

        let metrics = MetricsScraper::new(config.metrics.request_timeout)?;

        Ok(Self {
            config,
            runtime,
            definitions: std::sync::Mutex::new(definitions),
            next_scope: AtomicU64::new(BASE_SCOPE + 1),
            slots: DashMap::new(),
            metrics,
        })
    }

    /// Harness configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Names of all visible services.
    pub fn service_names(&self) -> Vec<String> {
        self.definitions().keys().cloned().collect()
    }

    /// Definition currently visible for `name` (innermost override wins).
    pub fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.definitions()
            .get(name)
            .and_then(|stack| stack.last())
            .map(|(_, def)| def.clone())
    }

    /// Push replacement definitions for the lifetime of the returned guard.
    ///
    /// Names not yet registered become visible for the scope only.
    pub fn override_services(&self, services: Vec<ServiceDefinition>) -> OverrideGuard<'_> {
        let scope = self.next_scope.fetch_add(1, Ordering::SeqCst);
        let mut names = Vec::with_capacity(services.len());
        {
            let mut definitions = self.definitions();
            for def in services {
                debug!(service = %def.name, scope, "pushing override");
                names.push(def.name.clone());
                definitions
                    .entry(def.name.clone())
                    .or_default()
                    .push((scope, def));
            }
        }
        OverrideGuard {
            composition: self,
            scope,
            names,
        }
    }

    /// Start `names` and their dependencies, waiting for each to be healthy.
    ///
    /// Services already running with their visible definition are left
    /// alone. A running service whose visible definition changed is
    /// recreated.
    ///
    /// # Errors
    ///
    /// - `UnknownService` for a name with no visible definition
    /// - `Configuration` for an unknown dependency or a dependency cycle
    /// - `Startup` if the service is not started and healthy within the deadline
    pub async fn up(&self, names: &[&str]) -> Result<(), HarnessError> {
        for name in self.start_order(names)? {
            self.up_one(&name).await?;
        }
        Ok(())
    }

    /// Stop every service, optionally discarding volumes.
    pub async fn down(&self, destroy_volumes: bool) -> Result<(), HarnessError> {
        let mut slots: Vec<(String, Arc<Mutex<RunningService>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        // Fixed lock order; every other operation holds at most one slot.
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut guards = Vec::with_capacity(slots.len());
        for (_, slot) in &slots {
            guards.push(slot.lock().await);
        }

        info!(destroy_volumes, "bringing composition down");
        self.runtime.down(destroy_volumes).await?;

        for svc in guards.iter_mut() {
            svc.state = ServiceState::Stopped;
            svc.started = None;
        }
        Ok(())
    }

    /// Forcefully terminate a running service.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` unless the service is `Running`.
    pub async fn kill(&self, name: &str) -> Result<(), HarnessError> {
        self.require_known(name)?;
        let slot = self.slot(name);
        let mut svc = slot.lock().await;
        if svc.state != ServiceState::Running {
            return Err(HarnessError::NotRunning {
                service: name.to_string(),
            });
        }

        info!(service = name, "killing service");
        self.runtime.kill(name, KILL_SIGNAL).await?;
        svc.state = ServiceState::Killed;
        Ok(())
    }

    /// Lifecycle state of `name`.
    pub async fn state(&self, name: &str) -> ServiceState {
        let Some(slot) = self.slots.get(name).map(|s| s.value().clone()) else {
            return ServiceState::Stopped;
        };
        let svc = slot.lock().await;
        svc.state
    }

    /// Run a command inside a running service.
    pub async fn exec(&self, name: &str, cmd: &[&str]) -> Result<ExecOutput, HarnessError> {
        self.require_known(name)?;
        let running = self.state(name).await == ServiceState::Running
            && self.runtime.is_running(name).await?;
        if !running {
            return Err(ExecError::NotRunning {
                service: name.to_string(),
            }
            .into());
        }

        debug!(service = name, ?cmd, "exec");
        Ok(self.runtime.exec(name, cmd).await?)
    }

    /// Like [`exec`](Self::exec), but a non-zero exit is an error.
    pub async fn exec_ok(&self, name: &str, cmd: &[&str]) -> Result<ExecOutput, HarnessError> {
        let output = self.exec(name, cmd).await?;
        if !output.success() {
            return Err(ExecError::Failed {
                service: name.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }

    /// Run an administrative command against the orchestration layer.
    pub async fn invoke(&self, args: &[&str]) -> Result<ExecOutput, HarnessError> {
        Ok(self.runtime.invoke(args).await?)
    }

    /// Client for the cluster's SQL endpoint.
    pub async fn sql_client(&self) -> Result<SqlClient, HarnessError> {
        let sql = &self.config.sql;
        self.sql_client_for(&sql.service, sql.port).await
    }

    /// Client for a pgwire endpoint published by any service.
    ///
    /// User and database default to the `[sql]` configuration.
    pub async fn sql_client_for(&self, service: &str, port: u16) -> Result<SqlClient, HarnessError> {
        let host_port = self.runtime.host_port(service, port).await?;
        Ok(SqlClient::new(&self.config.sql, &self.config.sql.host, host_port))
    }

    /// Execute a statement block on a fresh session.
    pub async fn sql(&self, block: &str) -> Result<(), HarnessError> {
        self.sql_with(block, &SqlOptions::default()).await
    }

    /// Execute a statement block on a fresh session with `options` applied.
    pub async fn sql_with(&self, block: &str, options: &SqlOptions) -> Result<(), HarnessError> {
        let client = self.sql_client().await?;
        client.execute(block, options).await?;
        Ok(())
    }

    /// Run one query on a fresh session and return its rows.
    pub async fn sql_query(&self, statement: &str) -> Result<Rows, HarnessError> {
        let client = self.sql_client().await?;
        Ok(client.query(statement).await?)
    }

    /// Scrape and parse the metrics endpoint of `service`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the service declares no metrics port.
    pub async fn scrape_metrics(
        &self,
        service: &str,
        path: &str,
    ) -> Result<MetricsSnapshot, HarnessError> {
        let def = self.require_known(service)?;
        let port = def.metrics_port.ok_or_else(|| {
            HarnessError::Configuration(format!("service {} has no metrics port", service))
        })?;
        let host_port = self.runtime.host_port(service, port).await?;
        let url = format!("http://{}:{}{}", self.config.sql.host, host_port, path);
        let text = self.metrics.scrape(&url).await?;
        Ok(MetricsSnapshot::parse(&text))
    }

    /// Assertion script runner bound to the SQL endpoint.
    ///
    /// A missing `default_timeout` is filled from `[scripts]`.
    pub async fn script_runner(
        &self,
        mut options: ScriptOptions,
    ) -> Result<ScriptRunner, HarnessError> {
        let client = self.sql_client().await?;
        options
            .default_timeout
            .get_or_insert(self.config.scripts.default_timeout);
        let backend = SqlBackend::new(client, &options);
        Ok(ScriptRunner::new(
            Box::new(backend),
            options,
            self.config.scripts.directory.clone(),
        ))
    }

    async fn up_one(&self, name: &str) -> Result<(), HarnessError> {
        let def = self.require_known(name)?;
        let slot = self.slot(name);
        let mut svc = slot.lock().await;

        if svc.state == ServiceState::Running {
            let same_definition = svc.started.as_ref() == Some(&def);
            if same_definition && self.runtime.is_running(name).await? {
                debug!(service = name, "already running");
                return Ok(());
            }
            if same_definition {
                warn!(service = name, "container exited, restarting");
            } else {
                info!(service = name, "definition changed, recreating");
            }
        }

        svc.state = ServiceState::Starting;
        info!(service = name, image = %def.image, "starting service");

        let project = self.visible_definitions();
        let timeout = def.startup_timeout.unwrap_or(self.config.startup.timeout);
        // The deadline covers container creation as well as the health check.
        let outcome = tokio::time::timeout(timeout, async {
            self.runtime
                .start(&def, &project)
                .await
                .map_err(HarnessError::from)?;
            self.wait_healthy(name).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                svc.state = ServiceState::Running;
                svc.started = Some(def);
                info!(service = name, "service healthy");
                Ok(())
            }
            Ok(Err(e)) => {
                self.stop_quietly(name).await;
                svc.state = ServiceState::Stopped;
                svc.started = None;
                Err(e)
            }
            Err(_) => {
                self.stop_quietly(name).await;
                svc.state = ServiceState::Stopped;
                svc.started = None;
                Err(HarnessError::Startup {
                    service: name.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn wait_healthy(&self, name: &str) -> Result<(), HarnessError> {
        let interval: Duration = self.config.startup.poll_interval;
        loop {
            if self.runtime.is_healthy(name).await? {
                return Ok(());
            }
            debug!(service = name, "not healthy yet");
            tokio::time::sleep(interval).await;
        }
    }

    async fn stop_quietly(&self, name: &str) {
        if let Err(e) = self.runtime.stop(name).await {
            warn!(service = name, "failed to stop service: {}", e);
        }
    }

    /// Dependencies first, each name once, in request order otherwise.
    fn start_order(&self, names: &[&str]) -> Result<Vec<String>, HarnessError> {
        let definitions = self.definitions();
        let mut order = Vec::new();
        let mut done = BTreeSet::new();

        for name in names {
            if !definitions.contains_key(*name) {
                return Err(HarnessError::UnknownService(name.to_string()));
            }
            let mut visiting = Vec::new();
            visit(name, &definitions, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visible_definitions(&self) -> Vec<ServiceDefinition> {
        self.definitions()
            .values()
            .filter_map(|stack| stack.last().map(|(_, def)| def.clone()))
            .collect()
    }

    fn require_known(&self, name: &str) -> Result<ServiceDefinition, HarnessError> {
        self.definition(name)
            .ok_or_else(|| HarnessError::UnknownService(name.to_string()))
    }

    fn slot(&self, name: &str) -> Arc<Mutex<RunningService>> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RunningService::new(name))))
            .value()
            .clone()
    }

    fn definitions(&self) -> MutexGuard<'_, BTreeMap<String, DefinitionStack>> {
        self.definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn visit(
    name: &str,
    definitions: &BTreeMap<String, DefinitionStack>,
    visiting: &mut Vec<String>,
    done: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) -> Result<(), HarnessError> {
    if done.contains(name) {
        return Ok(());
    }
    if visiting.iter().any(|v| v == name) {
        visiting.push(name.to_string());
        return Err(HarnessError::Configuration(format!(
            "dependency cycle: {}",
            visiting.join(" -> ")
        )));
    }

    let def = definitions
        .get(name)
        .and_then(|stack| stack.last())
        .map(|(_, def)| def)
        .ok_or_else(|| {
            HarnessError::Configuration(format!(
                "{} depends on unknown service {}",
                visiting.last().map(String::as_str).unwrap_or("?"),
                name
            ))
        })?;

    visiting.push(name.to_string());
    for dep in &def.depends_on {
        visit(dep, definitions, visiting, done, order)?;
    }
    visiting.pop();

    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

/// Scoped override; dropping it restores the previously visible definitions.
#[must_use = "the override is removed as soon as the guard is dropped"]
pub struct OverrideGuard<'a> {
    composition: &'a Composition,
    scope: u64,
    names: Vec<String>,
}

impl std::fmt::Debug for OverrideGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideGuard")
            .field("scope", &self.scope)
            .field("names", &self.names)
            .finish()
    }
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        let mut definitions = self.composition.definitions();
        for name in &self.names {
            let now_empty = match definitions.get_mut(name) {
                Some(stack) => {
                    stack.retain(|(scope, _)| *scope != self.scope);
                    stack.is_empty()
                }
                None => false,
            };
            if now_empty {
                definitions.remove(name);
            }
            debug!(service = %name, scope = self.scope, "override removed");
        }
    }
}
