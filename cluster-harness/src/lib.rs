//! # cluster-harness
//!
//! Integration-test harness for a distributed, multi-node compute cluster.
//!
//! This crate provides the infrastructure scenario code is written against:
//! - Service lifecycle with dependency ordering and scoped overrides ([`composition`])
//! - SQL sessions with statement timeouts and typed errors ([`sql`])
//! - Metrics scraping with exact-name parsing ([`metrics`])
//! - Ordered command/expected-output scripts ([`script`])
//! - Delayed background faults joined before assertions ([`fault`])
//! - Named scenarios and the default suite ([`workflow`])
//! - An in-process pgwire server for testing SQL paths ([`pgwire`])
//!
//! ## Control flow
//!
//! ```text
//! WorkflowRegistry ──► scenario(&Composition)
//!                          │
//!          ┌───────────────┼────────────────┬───────────────┐
//!          ▼               ▼                ▼               ▼
//!     up/kill/down     sql/sql_query    ScriptRunner   FaultInjector
//!          │               │                │               │
//!       Runtime       tokio-postgres   SqlSession      join before
//!   (docker/mock)                                        assertions
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composition;
pub mod config;
pub mod error;
pub mod fault;
pub mod logging;
pub mod metrics;
pub mod pgwire;
pub mod runtime;
pub mod script;
pub mod service;
pub mod sql;
pub mod workflow;

pub use composition::{Composition, OverrideGuard, ServiceState};
pub use config::HarnessConfig;
pub use error::{ExecError, HarnessError};
pub use fault::{FaultInjector, FaultOutcome, FaultSchedule};
pub use metrics::{MetricSample, MetricsError, MetricsSnapshot};
pub use runtime::{ExecOutput, Runtime};
pub use script::{ScriptOptions, ScriptRunner, ScriptStep};
pub use service::{HealthCheck, ServiceDefinition};
pub use sql::{SqlClient, SqlError, SqlOptions, SqlSession};
pub use workflow::{FailurePolicy, WorkflowArgs, WorkflowError, WorkflowRegistry};
