//! SQL sessions against the cluster's pgwire endpoint.
//!
//! A [`SqlClient`] knows how to reach the endpoint; each [`SqlSession`] is
//! one connection. Statement blocks are split client-side and executed in
//! order on a single session, so `BEGIN`/`DECLARE`/`FETCH` sequences work
//! and the statement that failed is known.
//!
//! Statement timeouts are enforced twice: the server gets
//! `SET statement_timeout`, and the client holds a deadline of
//! `timeout + cancel_grace` per statement. A server that honors the timeout
//! answers with [`SqlError::Timeout`]. When the client deadline fires
//! instead, the server-side query is cancelled through the cancel token,
//! the statement fails with [`SqlError::Deadline`], and the session stays
//! usable. The two are distinct so a scenario can tell a server that
//! enforced its timeout from one that had to be cancelled.

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::{NoTls, SimpleQueryMessage};

use crate::config::SqlConfig;

/// SQLSTATE for a cancelled statement.
pub const QUERY_CANCELED: &str = "57014";

/// Message fragment the cluster reports when a targeted replica goes away.
pub const REPLICA_FAILURE_MARKER: &str = "target replica failed or was dropped";

/// Rows as ordered value tuples, in the order the cluster returned them.
pub type Rows = Vec<Vec<Option<String>>>;

/// Structured SQL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SqlError {
    /// The server cancelled the statement for exceeding its timeout.
    #[error("{code}: {message}")]
    Timeout {
        /// SQLSTATE code.
        code: String,
        /// Server message.
        message: String,
    },

    /// The statement outlived the client deadline and was cancelled by the
    /// client.
    #[error("no response within client deadline of {after:?}; statement cancelled")]
    Deadline {
        /// Deadline that elapsed (`statement_timeout + cancel_grace`).
        after: Duration,
    },

    /// The replica a statement was targeted at failed or was removed.
    #[error("{code}: {message}")]
    ReplicaFailure {
        /// SQLSTATE code.
        code: String,
        /// Server message.
        message: String,
    },

    /// Any other database error.
    #[error("{code}: {message}")]
    Db {
        /// SQLSTATE code.
        code: String,
        /// Server message.
        message: String,
    },

    /// Connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),
}

impl SqlError {
    /// Classify a server error by code and message.
    pub fn from_parts(code: &str, message: &str) -> Self {
        let code_s = code.to_string();
        let message_s = message.to_string();
        if message.contains(REPLICA_FAILURE_MARKER) {
            SqlError::ReplicaFailure {
                code: code_s,
                message: message_s,
            }
        } else if message.contains("statement timeout") {
            SqlError::Timeout {
                code: code_s,
                message: message_s,
            }
        } else {
            SqlError::Db {
                code: code_s,
                message: message_s,
            }
        }
    }

    /// SQLSTATE code, if the server produced one.
    pub fn code(&self) -> Option<&str> {
        match self {
            SqlError::Timeout { code, .. }
            | SqlError::ReplicaFailure { code, .. }
            | SqlError::Db { code, .. } => Some(code),
            SqlError::Deadline { .. } | SqlError::Connection(_) => None,
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            SqlError::Timeout { message, .. }
            | SqlError::ReplicaFailure { message, .. }
            | SqlError::Db { message, .. }
            | SqlError::Connection(message) => message.clone(),
            SqlError::Deadline { .. } => self.to_string(),
        }
    }

    /// Whether the server reported a statement timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SqlError::Timeout { .. })
    }

    /// Whether the client deadline fired before the server answered.
    pub fn is_deadline(&self) -> bool {
        matches!(self, SqlError::Deadline { .. })
    }

    /// Whether this is a replica-failure error.
    pub fn is_replica_failure(&self) -> bool {
        matches!(self, SqlError::ReplicaFailure { .. })
    }
}

impl From<tokio_postgres::Error> for SqlError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => SqlError::from_parts(db.code().code(), db.message()),
            None => SqlError::Connection(e.to_string()),
        }
    }
}

/// Per-session options applied before a block runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlOptions {
    /// Statement timeout; `None` leaves the server default.
    pub statement_timeout: Option<Duration>,
}

impl SqlOptions {
    /// Options with a statement timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            statement_timeout: Some(timeout),
        }
    }
}

/// Transaction state as tracked from the statements a session sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Autocommit.
    Idle,
    /// Inside an explicit transaction.
    InTransaction,
    /// A statement failed inside a transaction; only rollback will succeed.
    Failed,
}

/// Connection parameters for the SQL endpoint.
#[derive(Debug, Clone)]
pub struct SqlClient {
    config: tokio_postgres::Config,
    cancel_grace: Duration,
}

impl SqlClient {
    /// Client for `host:port` using the user/database/timeouts in `sql`.
    pub fn new(sql: &SqlConfig, host: &str, port: u16) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(&sql.user)
            .dbname(&sql.database)
            .connect_timeout(sql.connect_timeout);
        Self {
            config,
            cancel_grace: sql.cancel_grace,
        }
    }

    /// Connect as a different user.
    pub fn user(mut self, user: &str) -> Self {
        self.config.user(user);
        self
    }

    /// Authenticate with a password.
    pub fn password(mut self, password: &str) -> Self {
        self.config.password(password);
        self
    }

    /// Connect to a different database.
    pub fn database(mut self, database: &str) -> Self {
        self.config.dbname(database);
        self
    }

    /// Open a new session.
    pub async fn connect(&self) -> Result<SqlSession, SqlError> {
        let (client, connection) = self.config.connect(NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("SQL connection closed: {}", e);
            }
        });

        Ok(SqlSession {
            client,
            connection,
            cancel_grace: self.cancel_grace,
            statement_timeout: None,
            transaction: TransactionState::Idle,
        })
    }

    /// Open a session with `options` applied.
    pub async fn connect_with(&self, options: &SqlOptions) -> Result<SqlSession, SqlError> {
        let mut session = self.connect().await?;
        if let Some(timeout) = options.statement_timeout {
            session.set_statement_timeout(timeout).await?;
        }
        Ok(session)
    }

    /// Run a statement block on a fresh session.
    pub async fn execute(&self, block: &str, options: &SqlOptions) -> Result<(), SqlError> {
        let mut session = self.connect_with(options).await?;
        let result = session.execute(block).await;
        session.close().await;
        result
    }

    /// Run one query on a fresh session and return its rows.
    pub async fn query(&self, statement: &str) -> Result<Rows, SqlError> {
        let mut session = self.connect().await?;
        let result = session.query(statement).await;
        session.close().await;
        result
    }
}

/// One open connection to the SQL endpoint.
pub struct SqlSession {
    client: tokio_postgres::Client,
    connection: JoinHandle<()>,
    cancel_grace: Duration,
    statement_timeout: Option<Duration>,
    transaction: TransactionState,
}

impl std::fmt::Debug for SqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSession")
            .field("statement_timeout", &self.statement_timeout)
            .field("transaction", &self.transaction)
            .field("closed", &self.client.is_closed())
            .finish_non_exhaustive()
    }
}

impl SqlSession {
    /// Set the statement timeout for subsequent statements.
    pub async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), SqlError> {
        let statement = format!("SET statement_timeout = '{}ms'", timeout.as_millis());
        self.run(&statement).await?;
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    /// Current statement timeout.
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// Current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction
    }

    /// Whether the connection has been closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Whether statements autocommit.
    pub fn autocommit(&self) -> bool {
        self.transaction == TransactionState::Idle
    }

    /// Execute every statement of `block` in order, stopping at the first error.
    pub async fn execute(&mut self, block: &str) -> Result<(), SqlError> {
        for (index, statement) in split_statements(block).iter().enumerate() {
            if let Err(e) = self.run(statement).await {
                tracing::debug!(statement = index, "SQL statement failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run one query and return its rows.
    pub async fn query(&mut self, statement: &str) -> Result<Rows, SqlError> {
        let messages = self.run(statement).await?;
        Ok(rows_from(messages))
    }

    /// Close the session and wait for the connection task to finish.
    pub async fn close(self) {
        let SqlSession {
            client, connection, ..
        } = self;
        drop(client);
        if tokio::time::timeout(Duration::from_secs(5), connection)
            .await
            .is_err()
        {
            tracing::warn!("SQL connection did not shut down within 5s");
        }
    }

    async fn run(&mut self, statement: &str) -> Result<Vec<SimpleQueryMessage>, SqlError> {
        tracing::debug!("SQL: {}", statement);
        let deadline = self.statement_timeout.map(|t| t + self.cancel_grace);

        let result = match deadline {
            Some(deadline) => {
                let query = self.client.simple_query(statement);
                tokio::pin!(query);
                match tokio::time::timeout(deadline, &mut query).await {
                    Ok(result) => result.map_err(SqlError::from),
                    Err(_) => {
                        tracing::warn!(?deadline, "statement outlived its deadline, cancelling");
                        cancel(&self.client).await;
                        // Wait for the cancelled statement so the next one
                        // starts on a quiet connection.
                        match tokio::time::timeout(self.cancel_grace, &mut query).await {
                            Ok(outcome) => {
                                tracing::debug!(ok = outcome.is_ok(), "cancelled statement returned")
                            }
                            Err(_) => tracing::warn!("cancelled statement did not return"),
                        }
                        Err(SqlError::Deadline { after: deadline })
                    }
                }
            }
            None => self
                .client
                .simple_query(statement)
                .await
                .map_err(SqlError::from),
        };

        self.transaction = next_transaction_state(self.transaction, statement, result.is_ok());
        result
    }
}

/// Ask the server to cancel whatever `client` is running.
async fn cancel(client: &tokio_postgres::Client) {
    let token = client.cancel_token();
    if let Err(e) = token.cancel_query(NoTls).await {
        tracing::warn!("failed to cancel statement: {}", e);
    }
}

fn rows_from(messages: Vec<SimpleQueryMessage>) -> Rows {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_owned))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn next_transaction_state(
    current: TransactionState,
    statement: &str,
    succeeded: bool,
) -> TransactionState {
    let keyword = first_keyword(statement);
    match keyword.as_str() {
        "BEGIN" | "START" if succeeded => TransactionState::InTransaction,
        "COMMIT" | "ROLLBACK" | "END" | "ABORT" => TransactionState::Idle,
        _ if !succeeded && current != TransactionState::Idle => TransactionState::Failed,
        _ => current,
    }
}

fn first_keyword(statement: &str) -> String {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            break;
        }
    }
    rest.split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Split a block into statements on `;`, respecting quotes and comments.
///
/// Segments that contain only whitespace or comments are dropped.
pub fn split_statements(block: &str) -> Vec<String> {
    let chars: Vec<char> = block.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                i = copy_quoted(&chars, i, false, &mut current);
                has_code = true;
            }
            'E' | 'e' if chars.get(i + 1) == Some(&'\'') && !follows_identifier(&chars, i) => {
                current.push(c);
                i = copy_quoted(&chars, i + 1, true, &mut current);
                has_code = true;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    current.push(chars[i]);
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i = copy_block_comment(&chars, i, &mut current);
            }
            '$' => {
                if let Some(tag_len) = dollar_tag_len(&chars[i..]) {
                    let tag: String = chars[i..i + tag_len].iter().collect();
                    current.push_str(&tag);
                    i += tag_len;
                    while i < chars.len() {
                        if chars[i..].starts_with(&chars_of(&tag)) {
                            current.push_str(&tag);
                            i += tag_len - 1;
                            break;
                        }
                        current.push(chars[i]);
                        i += 1;
                    }
                } else {
                    current.push(c);
                }
                has_code = true;
            }
            ';' => {
                if has_code {
                    statements.push(current.trim().to_string());
                }
                current.clear();
                has_code = false;
            }
            _ => {
                if !c.is_whitespace() {
                    has_code = true;
                }
                current.push(c);
            }
        }
        i += 1;
    }

    if has_code {
        statements.push(current.trim().to_string());
    }
    statements
}

/// Copy the literal opening at `chars[start]` into `out`.
///
/// Returns the index of the closing quote. A doubled quote is an escaped
/// quote; with `backslash`, so is `\'` (escape string syntax).
fn copy_quoted(chars: &[char], start: usize, backslash: bool, out: &mut String) -> usize {
    let quote = chars[start];
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if backslash && c == '\\' {
            if let Some(&next) = chars.get(i + 1) {
                out.push(next);
            }
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return i;
        }
        i += 1;
    }
    chars.len()
}

/// Copy a possibly nested `/* */` comment; returns the index of its final `/`.
fn copy_block_comment(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1)) {
            ('/', Some('*')) => {
                depth += 1;
                out.push_str("/*");
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                out.push_str("*/");
                if depth == 0 {
                    return i + 1;
                }
                i += 2;
            }
            (c, _) => {
                out.push(c);
                i += 1;
            }
        }
    }
    chars.len()
}

fn follows_identifier(chars: &[char], i: usize) -> bool {
    i > 0 && (chars[i - 1].is_alphanumeric() || chars[i - 1] == '_')
}

/// Length of a `$tag$` opener at the start of `chars`, if there is one.
fn dollar_tag_len(chars: &[char]) -> Option<usize> {
    let close = chars.iter().skip(1).position(|&c| c == '$')? + 1;
    let tag_ok = chars[1..close]
        .iter()
        .all(|c| c.is_ascii_alphanumeric() || *c == '_')
        && !chars.get(1).is_some_and(|c| c.is_ascii_digit());
    tag_ok.then_some(close + 1)
}

fn chars_of(s: &str) -> Vec<char> {
    s.chars().collect()
}
