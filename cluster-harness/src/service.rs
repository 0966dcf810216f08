//! Service definitions.
//!
//! A [`ServiceDefinition`] is immutable once built. Overrides replace a
//! definition wholesale; they never mutate one in place.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Health check policy for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Check command, in compose `test` form (e.g. `["CMD", "pg_isready"]`).
    pub test: Vec<String>,
    /// Interval between checks inside the container.
    pub interval: Duration,
    /// Number of consecutive failures before the container is unhealthy.
    pub retries: u32,
    /// Grace period before failures count.
    pub start_period: Duration,
}

impl HealthCheck {
    /// Check with a command run directly (no shell).
    pub fn cmd(args: &[&str]) -> Self {
        let mut test = vec!["CMD".to_string()];
        test.extend(args.iter().map(|s| s.to_string()));
        Self {
            test,
            interval: Duration::from_secs(1),
            retries: 60,
            start_period: Duration::from_secs(0),
        }
    }

    /// Check with a shell command line.
    pub fn shell(line: &str) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), line.to_string()],
            interval: Duration::from_secs(1),
            retries: 60,
            start_period: Duration::from_secs(0),
        }
    }

    /// Set the check interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the retry budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Definition of one service in the composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Unique service name.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Entrypoint override, if any.
    pub entrypoint: Option<Vec<String>>,
    /// Command arguments (startup options are appended here).
    pub command: Vec<String>,
    /// Container ports published to the host.
    pub ports: Vec<u16>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Volume mounts in compose short syntax (`source:target`).
    pub volumes: Vec<String>,
    /// Services that must be running first.
    pub depends_on: BTreeSet<String>,
    /// Health check policy; `None` means "running is healthy".
    pub healthcheck: Option<HealthCheck>,
    /// Per-service startup deadline overriding the configured default.
    pub startup_timeout: Option<Duration>,
    /// Container port serving exposition-format metrics.
    pub metrics_port: Option<u16>,
}

impl ServiceDefinition {
    /// Create a definition with just a name and an image.
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            entrypoint: None,
            command: Vec::new(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            depends_on: BTreeSet::new(),
            healthcheck: None,
            startup_timeout: None,
            metrics_port: None,
        }
    }

    /// Replace the image.
    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    /// Replace the entrypoint.
    pub fn entrypoint(mut self, args: &[&str]) -> Self {
        self.entrypoint = Some(args.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Append command arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    /// Publish container ports.
    pub fn ports(mut self, ports: &[u16]) -> Self {
        self.ports.extend_from_slice(ports);
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Set an environment variable from `KEY=value` form.
    ///
    /// Entries without `=` are set to the empty string.
    pub fn env_entry(self, entry: &str) -> Self {
        match entry.split_once('=') {
            Some((key, value)) => self.env(key.trim(), value),
            None => self.env(entry.trim(), ""),
        }
    }

    /// Add a volume mount.
    pub fn volume(mut self, mount: &str) -> Self {
        self.volumes.push(mount.to_string());
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.insert(service.to_string());
        self
    }

    /// Set the health check policy.
    pub fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.healthcheck = Some(check);
        self
    }

    /// Set the startup deadline.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Set the metrics port (also published).
    pub fn metrics_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self.metrics_port = Some(port);
        self
    }

    /// Named volumes referenced by this service's mounts.
    ///
    /// Bind mounts (sources starting with `.`, `/` or `~`) are excluded.
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().filter_map(|mount| {
            let source = mount.split(':').next()?;
            if source.is_empty() || source.starts_with(['.', '/', '~']) {
                None
            } else {
                Some(source)
            }
        })
    }
}
