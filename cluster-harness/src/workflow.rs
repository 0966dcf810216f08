//! Named scenarios and the default suite.
//!
//! Each workflow is a plain function from a [`Composition`] and its
//! arguments to a boxed future. The registry runs one by name, or runs the
//! default suite in order, each case inside a `test_case` span so every log
//! line and failure is attributed to the scenario that produced it.

use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

use crate::composition::Composition;
use crate::error::HarnessError;

/// Name that selects the default suite.
pub const DEFAULT_WORKFLOW: &str = "default";

/// Future returned by a workflow.
pub type WorkflowFuture<'a> = BoxFuture<'a, Result<(), HarnessError>>;

/// A registered scenario.
pub type WorkflowFn = for<'a> fn(&'a Composition, WorkflowArgs) -> WorkflowFuture<'a>;

/// Workflow runner errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No workflow with this name.
    #[error("unknown workflow: {0}")]
    Unknown(String),

    /// A workflow with this name is already registered.
    #[error("workflow registered twice: {0}")]
    Duplicate(String),

    /// Arguments were given to a workflow that takes none.
    #[error("{workflow} takes no arguments, got: {}", .args.join(" "))]
    UnexpectedArgs {
        /// Workflow name.
        workflow: String,
        /// Rejected arguments.
        args: Vec<String>,
    },

    /// A workflow failed.
    #[error("workflow {workflow} failed: {source}")]
    Failed {
        /// Workflow name.
        workflow: String,
        /// Originating error.
        source: HarnessError,
    },

    /// One or more workflows of a suite failed.
    #[error("{} workflow(s) failed: {}", .failed.len(), .failed.join(", "))]
    SuiteFailed {
        /// Names of the failed workflows, in run order.
        failed: Vec<String>,
    },
}

/// What to do when a suite case fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failure.
    #[default]
    FailFast,
    /// Run every case, then report all failures.
    Continue,
}

/// Arguments passed to a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowArgs {
    workflow: String,
    args: Vec<String>,
}

impl WorkflowArgs {
    /// Arguments for `workflow`.
    pub fn new(workflow: &str, args: Vec<String>) -> Self {
        Self {
            workflow: workflow.to_string(),
            args,
        }
    }

    /// Raw arguments.
    pub fn raw(&self) -> &[String] {
        &self.args
    }

    /// Parse the arguments with a workflow-specific clap parser.
    pub fn parse<P: clap::Parser>(&self) -> Result<P, HarnessError> {
        let argv = std::iter::once(self.workflow.as_str()).chain(self.args.iter().map(String::as_str));
        P::try_parse_from(argv).map_err(|e| {
            HarnessError::Configuration(format!("{}: {}", self.workflow, e.to_string().trim()))
        })
    }
}

/// Per-case result of a run.
#[derive(Debug, Clone)]
pub struct CaseReport {
    /// Workflow name.
    pub name: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Failure message, if the case failed.
    pub error: Option<String>,
}

impl CaseReport {
    /// Whether the case passed.
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of every case that ran.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    /// Cases in run order.
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    /// Names of failed cases.
    pub fn failed(&self) -> Vec<String> {
        self.cases
            .iter()
            .filter(|c| !c.passed())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Total duration.
    pub fn duration(&self) -> Duration {
        self.cases.iter().map(|c| c.duration).sum()
    }
}

#[derive(Clone)]
struct Registered {
    name: String,
    about: String,
    run: WorkflowFn,
}

/// Registered workflows and the default suite.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: Vec<Registered>,
    default_suite: Vec<String>,
    policy: FailurePolicy,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.names())
            .field("default_suite", &self.default_suite)
            .field("policy", &self.policy)
            .finish()
    }
}

impl WorkflowRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow.
    pub fn register(
        &mut self,
        name: &str,
        about: &str,
        run: WorkflowFn,
    ) -> Result<&mut Self, WorkflowError> {
        if name == DEFAULT_WORKFLOW || self.find(name).is_some() {
            return Err(WorkflowError::Duplicate(name.to_string()));
        }
        self.workflows.push(Registered {
            name: name.to_string(),
            about: about.to_string(),
            run,
        });
        Ok(self)
    }

    /// Set the ordered list `default` runs.
    pub fn set_default_suite(&mut self, names: &[&str]) -> Result<&mut Self, WorkflowError> {
        if let Some(missing) = names.iter().find(|n| self.find(n).is_none()) {
            return Err(WorkflowError::Unknown(missing.to_string()));
        }
        self.default_suite = names.iter().map(|n| n.to_string()).collect();
        Ok(self)
    }

    /// Set the suite failure policy.
    pub fn set_policy(&mut self, policy: FailurePolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// The default suite, in order.
    pub fn default_suite(&self) -> &[String] {
        &self.default_suite
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.workflows.iter().map(|w| w.name.as_str()).collect()
    }

    /// `(name, description)` for every workflow, `default` first.
    pub fn list(&self) -> Vec<(&str, &str)> {
        std::iter::once((DEFAULT_WORKFLOW, "run the default suite"))
            .chain(
                self.workflows
                    .iter()
                    .map(|w| (w.name.as_str(), w.about.as_str())),
            )
            .collect()
    }

    /// Run `name` (or the default suite) against `composition`.
    ///
    /// Suite cases run with their default arguments; `default` takes none.
    pub async fn run(
        &self,
        composition: &Composition,
        name: &str,
        args: Vec<String>,
    ) -> Result<SuiteReport, WorkflowError> {
        if name == DEFAULT_WORKFLOW {
            if !args.is_empty() {
                return Err(WorkflowError::UnexpectedArgs {
                    workflow: name.to_string(),
                    args,
                });
            }
            return self.run_suite(composition).await;
        }

        let workflow = self
            .find(name)
            .ok_or_else(|| WorkflowError::Unknown(name.to_string()))?;
        let (case, result) = run_case(composition, workflow, args).await;
        result.map_err(|source| WorkflowError::Failed {
            workflow: name.to_string(),
            source,
        })?;
        Ok(SuiteReport { cases: vec![case] })
    }

    async fn run_suite(&self, composition: &Composition) -> Result<SuiteReport, WorkflowError> {
        let mut report = SuiteReport::default();

        for name in &self.default_suite {
            let workflow = self
                .find(name)
                .ok_or_else(|| WorkflowError::Unknown(name.clone()))?;
            let (case, result) = run_case(composition, workflow, Vec::new()).await;
            report.cases.push(case);

            if let Err(source) = result {
                match self.policy {
                    FailurePolicy::FailFast => {
                        return Err(WorkflowError::Failed {
                            workflow: name.clone(),
                            source,
                        });
                    }
                    FailurePolicy::Continue => continue,
                }
            }
        }

        info!(
            cases = report.cases.len(),
            duration = ?report.duration(),
            "suite finished"
        );
        let failed = report.failed();
        if !failed.is_empty() {
            return Err(WorkflowError::SuiteFailed { failed });
        }
        Ok(report)
    }

    fn find(&self, name: &str) -> Option<&Registered> {
        self.workflows.iter().find(|w| w.name == name)
    }
}

async fn run_case(
    composition: &Composition,
    workflow: &Registered,
    args: Vec<String>,
) -> (CaseReport, Result<(), HarnessError>) {
    let span = info_span!("test_case", name = %workflow.name);
    let started = Instant::now();

    let result = async {
        info!("starting");
        let result = (workflow.run)(composition, WorkflowArgs::new(&workflow.name, args)).await;
        match &result {
            Ok(()) => info!(elapsed = ?started.elapsed(), "passed"),
            Err(e) => error!(elapsed = ?started.elapsed(), "failed: {}", e),
        }
        result
    }
    .instrument(span)
    .await;

    let case = CaseReport {
        name: workflow.name.clone(),
        duration: started.elapsed(),
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    (case, result)
}
