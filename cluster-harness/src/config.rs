//! Configuration loading for the harness.
//!
//! Configuration is loaded from a TOML file (default: `harness.toml`). Every
//! field has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the harness.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Compose project configuration.
    pub project: ProjectConfig,
    /// SQL endpoint configuration.
    pub sql: SqlConfig,
    /// Service startup configuration.
    pub startup: StartupConfig,
    /// Metrics scraping configuration.
    pub metrics: MetricsConfig,
    /// Assertion script configuration.
    pub scripts: ScriptsConfig,
    /// Fault injection configuration.
    pub fault: FaultConfig,
}

/// Compose project configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Prefix for the unique compose project name (default: "cluster").
    pub name_prefix: String,
    /// Binary used to drive compose (default: "docker").
    pub compose_binary: String,
}

/// SQL endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Service exposing the SQL endpoint (default: "materialized").
    pub service: String,
    /// Container port of the SQL endpoint (default: 6875).
    pub port: u16,
    /// Host the published port is reachable on (default: "127.0.0.1").
    pub host: String,
    /// User to connect as (default: "materialize").
    pub user: String,
    /// Database to connect to (default: "materialize").
    pub database: String,
    /// Connection establishment timeout (default: 10s).
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Extra time past a statement timeout before the client cancels (default: 2s).
    #[serde(with = "duration_str")]
    pub cancel_grace: Duration,
}

/// Service startup configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Default health check deadline per service (default: 120s).
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Interval between health checks (default: 500ms).
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

/// Metrics scraping configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// HTTP request timeout (default: 10s).
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

/// Assertion script configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory script file arguments are resolved against.
    pub directory: PathBuf,
    /// Statement timeout applied to script sessions (default: 30s).
    #[serde(with = "duration_str")]
    pub default_timeout: Duration,
}

/// Fault injection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Time past the foreground deadline before the call counts as hung (default: 5s).
    #[serde(with = "duration_str")]
    pub join_grace: Duration,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name_prefix: "cluster".to_string(),
            compose_binary: "docker".to_string(),
        }
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            service: "materialized".to_string(),
            port: 6875,
            host: "127.0.0.1".to_string(),
            user: "materialize".to_string(),
            database: "materialize".to_string(),
            connect_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("scripts"),
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            join_grace: Duration::from_secs(5),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

/// Serde adapter for `"1m 30s"` style durations.
mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
