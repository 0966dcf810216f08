//! Error types for harness operations.

use std::time::Duration;

use crate::metrics::MetricsError;
use crate::runtime::RuntimeError;
use crate::script::ScriptError;
use crate::sql::SqlError;

/// Main error type for harness operations.
///
/// Orchestration errors propagate to the calling scenario unchanged. The
/// harness never retries or masks them.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Health check not reached within the startup timeout.
    #[error("service {service} did not become healthy within {timeout:?}")]
    Startup {
        /// Service that failed to start.
        service: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// In-service command failed or its target was not running.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Structural operation against a service that is not running.
    #[error("service {service} is not running")]
    NotRunning {
        /// Service name.
        service: String,
    },

    /// No definition is visible for this service name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Invalid harness or scenario configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Container runtime failure.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// SQL statement failed.
    #[error("sql error: {0}")]
    Sql(#[from] SqlError),

    /// Metrics scrape or lookup failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Assertion script failed.
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// Fault-injected foreground call ran past its deadline.
    #[error("foreground call still running after {after:?}")]
    ForegroundHung {
        /// Deadline (including grace) that elapsed.
        after: Duration,
    },

    /// Scenario-level assertion failed.
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl HarnessError {
    /// Returns the SQL error if this is one.
    pub fn as_sql(&self) -> Option<&SqlError> {
        match self {
            HarnessError::Sql(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from running a command inside a service.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Target service is not running.
    #[error("cannot exec in {service}: not running")]
    NotRunning {
        /// Service name.
        service: String,
    },

    /// Command exited non-zero.
    #[error("exec failed in {service}: exit={exit_code}, stderr={stderr}")]
    Failed {
        /// Service name.
        service: String,
        /// Exit code from command.
        exit_code: i64,
        /// Standard error output.
        stderr: String,
    },
}

/// Fail a scenario with a formatted assertion message unless `cond` holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::HarnessError::Assertion(format!($($arg)+)));
        }
    };
}
