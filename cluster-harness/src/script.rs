//! Assertion scripts: ordered commands with expected output.
//!
//! ```text
//! # comments and blank lines separate steps
//! > SELECT a, b FROM t ORDER BY a
//! 1 one
//! 2 <null>
//!
//! ! SELECT * FROM missing
//! contains:unknown catalog item
//!
//! $ postgres-execute connection=postgres
//! CREATE TABLE t1 (f1 INTEGER);
//! INSERT INTO t1 VALUES (1);
//! ```
//!
//! `>` steps compare rendered rows line by line (values joined by a single
//! space, NULL rendered as `<null>`). `!` steps expect the statement to fail
//! with a message containing the given text. `$ postgres-execute` runs
//! statements on a named auxiliary connection. Steps run strictly in order
//! and the first mismatch fails the run.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sql::{Rows, SqlClient, SqlError, SqlOptions, SqlSession};

/// Rendering of a NULL value.
pub const NULL: &str = "<null>";

/// Script errors.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// A step's actual output differs from the expected output.
    #[error("step {step} (line {line}) failed:\n{diff}")]
    Assertion {
        /// Zero-based step index.
        step: usize,
        /// Line of the step's command in the script.
        line: usize,
        /// Expected (`-`) vs actual (`+`) output.
        diff: String,
    },

    /// Script text is malformed.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// Offending line.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// `$ postgres-execute` names a connection that was not configured.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// Script file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Script path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A glob pattern matched no script files.
    #[error("no scripts match {0}")]
    NoScripts(String),

    /// A step's statement failed unexpectedly.
    #[error("step {step} (line {line}): {source}")]
    Sql {
        /// Zero-based step index.
        step: usize,
        /// Line of the step's command in the script.
        line: usize,
        /// SQL error.
        source: SqlError,
    },

    /// Session setup or reset failed.
    #[error("session setup failed: {0}")]
    Session(#[from] SqlError),

    /// Error while running one file of a multi-file run.
    #[error("{path}: {source}")]
    InFile {
        /// Script path.
        path: PathBuf,
        /// Underlying error.
        source: Box<ScriptError>,
    },
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
    /// Run a query and compare its rows.
    Query(String),
    /// Run a statement that must fail.
    ExpectError(String),
    /// Run statements on a named auxiliary connection.
    Execute {
        /// Connection name.
        connection: String,
    },
}

/// One step of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    /// Line of the command (1-based).
    pub line: usize,
    /// The command.
    pub command: StepCommand,
    /// Expected rows, the expected error fragment, or statements to execute.
    pub expected: Vec<String>,
}

/// Runner options.
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Keep the session open across `run` calls.
    pub persistent: bool,
    /// Skip the reset statements at the start of each `run`.
    pub no_reset: bool,
    /// Statement timeout for script sessions.
    pub default_timeout: Option<Duration>,
    /// `SET name = value` pairs applied when a session opens.
    pub session_params: Vec<(String, String)>,
    /// Statements that restore a clean state before each `run`.
    pub reset_statements: Vec<String>,
    /// Auxiliary connections for `$ postgres-execute`.
    pub connections: BTreeMap<String, SqlClient>,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            no_reset: false,
            default_timeout: None,
            session_params: Vec::new(),
            reset_statements: vec![
                "DROP SCHEMA IF EXISTS materialize.public CASCADE".to_string(),
                "CREATE SCHEMA materialize.public".to_string(),
            ],
            connections: BTreeMap::new(),
        }
    }
}

impl ScriptOptions {
    /// Keep one session across runs.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Skip the reset statements.
    pub fn no_reset(mut self) -> Self {
        self.no_reset = true;
        self
    }

    /// Add a session parameter.
    pub fn session_param(mut self, name: &str, value: &str) -> Self {
        self.session_params
            .push((name.to_string(), value.to_string()));
        self
    }

    /// Register an auxiliary connection.
    pub fn connection(mut self, name: &str, client: SqlClient) -> Self {
        self.connections.insert(name.to_string(), client);
        self
    }
}

/// Where script steps are executed.
#[async_trait]
pub trait ScriptBackend: Send {
    /// Ensure the primary session is open, reconnecting if the server closed
    /// it. Returns true if a new session was opened.
    async fn open(&mut self) -> Result<bool, SqlError>;

    /// Close the primary session.
    async fn close(&mut self);

    /// Execute a statement block on the primary session.
    async fn execute(&mut self, block: &str) -> Result<(), SqlError>;

    /// Run one query on the primary session.
    async fn query(&mut self, statement: &str) -> Result<Rows, SqlError>;

    /// Execute a statement block on a named auxiliary connection.
    async fn execute_on(&mut self, connection: &str, block: &str) -> Result<(), ScriptError>;
}

/// Backend running steps over pgwire.
#[derive(Debug)]
pub struct SqlBackend {
    client: SqlClient,
    options: SqlOptions,
    connections: BTreeMap<String, SqlClient>,
    session: Option<SqlSession>,
}

impl SqlBackend {
    /// Backend for `client`, taking timeout and connections from `options`.
    pub fn new(client: SqlClient, options: &ScriptOptions) -> Self {
        Self {
            client,
            options: SqlOptions {
                statement_timeout: options.default_timeout,
            },
            connections: options.connections.clone(),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut SqlSession, SqlError> {
        self.session
            .as_mut()
            .ok_or_else(|| SqlError::Connection("script session is not open".to_string()))
    }
}

#[async_trait]
impl ScriptBackend for SqlBackend {
    async fn open(&mut self) -> Result<bool, SqlError> {
        match self.session.take() {
            Some(session) if !session.is_closed() => {
                self.session = Some(session);
                return Ok(false);
            }
            Some(session) => {
                warn!("script session was closed by the server, reconnecting");
                session.close().await;
            }
            None => {}
        }
        self.session = Some(self.client.connect_with(&self.options).await?);
        Ok(true)
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn execute(&mut self, block: &str) -> Result<(), SqlError> {
        self.session()?.execute(block).await
    }

    async fn query(&mut self, statement: &str) -> Result<Rows, SqlError> {
        self.session()?.query(statement).await
    }

    async fn execute_on(&mut self, connection: &str, block: &str) -> Result<(), ScriptError> {
        let client = self
            .connections
            .get(connection)
            .ok_or_else(|| ScriptError::UnknownConnection(connection.to_string()))?;
        client.execute(block, &SqlOptions::default()).await?;
        Ok(())
    }
}

/// Runs scripts in order against a backend.
pub struct ScriptRunner {
    backend: Box<dyn ScriptBackend>,
    options: ScriptOptions,
    directory: PathBuf,
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("options", &self.options)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl ScriptRunner {
    /// Runner over `backend`; file patterns resolve against `directory`.
    pub fn new(backend: Box<dyn ScriptBackend>, options: ScriptOptions, directory: PathBuf) -> Self {
        Self {
            backend,
            options,
            directory,
        }
    }

    /// Run an inline script.
    pub async fn run(&mut self, input: &str) -> Result<(), ScriptError> {
        let steps = parse(input)?;

        let result = self.run_steps(&steps).await;
        if !self.options.persistent {
            self.backend.close().await;
        }
        result
    }

    /// Run script files in order. Patterns may be globs relative to the
    /// scripts directory.
    pub async fn run_files(&mut self, patterns: &[&str]) -> Result<(), ScriptError> {
        for path in self.resolve(patterns)? {
            info!("running script {}", path.display());
            let input = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ScriptError::Io {
                    path: path.clone(),
                    source,
                })?;
            self.run(&input).await.map_err(|e| ScriptError::InFile {
                path,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Close the session held by a persistent runner.
    pub async fn close(&mut self) {
        self.backend.close().await;
    }

    fn resolve(&self, patterns: &[&str]) -> Result<Vec<PathBuf>, ScriptError> {
        let mut paths = Vec::new();
        for pattern in patterns {
            let full = self.directory.join(pattern);
            let full = full.to_string_lossy();
            let mut matched: Vec<PathBuf> = glob::glob(&full)
                .map_err(|e| ScriptError::Parse {
                    line: 0,
                    message: format!("bad pattern {}: {}", pattern, e),
                })?
                .filter_map(Result::ok)
                .collect();
            if matched.is_empty() {
                return Err(ScriptError::NoScripts(full.into_owned()));
            }
            matched.sort();
            paths.extend(matched);
        }
        Ok(paths)
    }

    async fn run_steps(&mut self, steps: &[ScriptStep]) -> Result<(), ScriptError> {
        if self.backend.open().await? {
            for (name, value) in &self.options.session_params {
                self.backend
                    .execute(&format!("SET {} = {}", name, value))
                    .await?;
            }
        }

        if !self.options.no_reset {
            for statement in &self.options.reset_statements {
                self.backend.execute(statement).await?;
            }
        }

        for (index, step) in steps.iter().enumerate() {
            debug!(step = index, line = step.line, "script step");
            self.run_step(index, step).await?;
        }
        Ok(())
    }

    async fn run_step(&mut self, index: usize, step: &ScriptStep) -> Result<(), ScriptError> {
        let sql_error = |source| ScriptError::Sql {
            step: index,
            line: step.line,
            source,
        };

        match &step.command {
            StepCommand::Query(sql) => {
                let rows = self.backend.query(sql).await.map_err(sql_error)?;
                let actual = render_rows(&rows);
                if let Some(diff) = diff_lines(&step.expected, &actual) {
                    return Err(ScriptError::Assertion {
                        step: index,
                        line: step.line,
                        diff,
                    });
                }
            }
            StepCommand::ExpectError(sql) => {
                let expected = step.expected.first().map(String::as_str).unwrap_or("");
                let diff = match self.backend.execute(sql).await {
                    Ok(()) => Some(format!(
                        "- error containing {:?}\n+ statement succeeded",
                        expected
                    )),
                    Err(e) if e.message().contains(expected) => None,
                    Err(e) => Some(format!(
                        "- error containing {:?}\n+ {}",
                        expected,
                        e.message()
                    )),
                };
                if let Some(diff) = diff {
                    return Err(ScriptError::Assertion {
                        step: index,
                        line: step.line,
                        diff,
                    });
                }
            }
            StepCommand::Execute { connection } => {
                let block = step.expected.join("\n");
                match self.backend.execute_on(connection, &block).await {
                    Err(ScriptError::Session(source)) => return Err(sql_error(source)),
                    other => other?,
                }
            }
        }
        Ok(())
    }
}

/// Parse script text into steps. The input is dedented first.
pub fn parse(input: &str) -> Result<Vec<ScriptStep>, ScriptError> {
    let text = dedent(input);
    let mut steps: Vec<ScriptStep> = Vec::new();
    let mut current: Option<ScriptStep> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_end();

        if line.trim().is_empty() || line.starts_with('#') {
            steps.extend(current.take());
            continue;
        }

        if let Some(sql) = line.strip_prefix("> ") {
            steps.extend(current.take());
            current = Some(step(line_no, StepCommand::Query(sql.trim().to_string())));
        } else if let Some(sql) = line.strip_prefix("! ") {
            steps.extend(current.take());
            current = Some(step(line_no, StepCommand::ExpectError(sql.trim().to_string())));
        } else if let Some(directive) = line.strip_prefix("$ ") {
            steps.extend(current.take());
            current = Some(step(line_no, parse_directive(line_no, directive)?));
        } else {
            let Some(step) = current.as_mut() else {
                return Err(ScriptError::Parse {
                    line: line_no,
                    message: format!("expected output outside a step: {:?}", line),
                });
            };
            match &step.command {
                StepCommand::ExpectError(_) => {
                    let Some(fragment) = line.strip_prefix("contains:") else {
                        return Err(ScriptError::Parse {
                            line: line_no,
                            message: "error expectation must be `contains:<text>`".to_string(),
                        });
                    };
                    if !step.expected.is_empty() {
                        return Err(ScriptError::Parse {
                            line: line_no,
                            message: "only one error expectation per step".to_string(),
                        });
                    }
                    step.expected.push(fragment.to_string());
                }
                _ => step.expected.push(line.to_string()),
            }
        }
    }
    steps.extend(current.take());

    for s in &steps {
        if matches!(s.command, StepCommand::ExpectError(_)) && s.expected.is_empty() {
            return Err(ScriptError::Parse {
                line: s.line,
                message: "`!` step needs a `contains:` line".to_string(),
            });
        }
    }
    Ok(steps)
}

fn step(line: usize, command: StepCommand) -> ScriptStep {
    ScriptStep {
        line,
        command,
        expected: Vec::new(),
    }
}

fn parse_directive(line: usize, directive: &str) -> Result<StepCommand, ScriptError> {
    let mut words = directive.split_whitespace();
    match words.next() {
        Some("postgres-execute") => {
            let connection = words
                .find_map(|w| w.strip_prefix("connection="))
                .ok_or_else(|| ScriptError::Parse {
                    line,
                    message: "postgres-execute needs connection=<name>".to_string(),
                })?;
            Ok(StepCommand::Execute {
                connection: connection.to_string(),
            })
        }
        other => Err(ScriptError::Parse {
            line,
            message: format!("unknown directive: {}", other.unwrap_or("")),
        }),
    }
}

/// Remove the common leading whitespace of all non-blank lines.
pub fn dedent(input: &str) -> String {
    let indent = input
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    input
        .lines()
        .map(|l| l.get(indent..).unwrap_or("").trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render rows as script output lines.
pub fn render_rows(rows: &Rows) -> Vec<String> {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|v| v.as_deref().unwrap_or(NULL))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Line diff of expected vs actual, or `None` if they match.
fn diff_lines(expected: &[String], actual: &[String]) -> Option<String> {
    if expected == actual {
        return None;
    }
    let mut diff = String::new();
    for i in 0..expected.len().max(actual.len()) {
        match (expected.get(i), actual.get(i)) {
            (Some(e), Some(a)) if e == a => diff.push_str(&format!("  {}\n", e)),
            (e, a) => {
                if let Some(e) = e {
                    diff.push_str(&format!("- {}\n", e));
                }
                if let Some(a) = a {
                    diff.push_str(&format!("+ {}\n", a));
                }
            }
        }
    }
    Some(diff)
}
