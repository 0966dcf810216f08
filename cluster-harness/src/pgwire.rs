//! In-process pgwire server for tests.
//!
//! Speaks just enough of the protocol for `tokio-postgres` simple queries:
//! startup without authentication, simple query, terminate, and cancel
//! requests. A handler picks the reply for each statement, so tests can
//! model a server that enforces `statement_timeout`, one that only stops
//! when cancelled, or one that drops the connection.
//!
//! ```text
//! client ── Q "SELECT ..." ──► handler(statement) ──► StubReply
//!                                                    ├─ Complete / Rows / Error
//!                                                    ├─ After(delay, reply)
//!                                                    ├─ UntilCancel(reply)   waits for a CancelRequest
//!                                                    └─ Disconnect
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const CANCEL_REQUEST: i32 = 80_877_102;
const SSL_REQUEST: i32 = 80_877_103;
const TEXT_OID: i32 = 25;

/// Reply to one statement.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Command completion with this tag.
    Complete(String),
    /// Text rows, then completion.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row values; `None` is NULL.
        rows: Vec<Vec<Option<String>>>,
    },
    /// Error response.
    Error {
        /// SQLSTATE code.
        code: String,
        /// Message.
        message: String,
    },
    /// Reply after a delay.
    After(Duration, Box<StubReply>),
    /// Wait for a cancel request aimed at this connection, then reply.
    UntilCancel(Box<StubReply>),
    /// Close the connection without replying.
    Disconnect,
}

impl StubReply {
    /// Completion with `tag`.
    pub fn complete(tag: &str) -> Self {
        StubReply::Complete(tag.to_string())
    }

    /// One text column per name, one row per entry.
    pub fn rows(columns: &[&str], rows: &[&[Option<&str>]]) -> Self {
        StubReply::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| v.map(str::to_owned)).collect())
                .collect(),
        }
    }

    /// Error with `code` and `message`.
    pub fn error(code: &str, message: &str) -> Self {
        StubReply::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// `self`, sent after `delay`.
    pub fn after(self, delay: Duration) -> Self {
        StubReply::After(delay, Box::new(self))
    }

    /// `self`, sent once the statement is cancelled.
    pub fn on_cancel(self) -> Self {
        StubReply::UntilCancel(Box::new(self))
    }
}

type Handler = dyn Fn(&str) -> StubReply + Send + Sync;

struct Shared {
    handler: Box<Handler>,
    statements: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    connections: AtomicUsize,
    next_pid: AtomicI32,
    waiting: Mutex<HashMap<i32, Arc<Notify>>>,
}

impl Shared {
    fn cancel(&self, pid: i32) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(cancelled) = lock(&self.waiting).get(&pid) {
            cancelled.notify_waiters();
        }
    }
}

/// A pgwire server on a loopback port.
pub struct PgStub {
    port: u16,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl std::fmt::Debug for PgStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStub")
            .field("port", &self.port)
            .field("connections", &self.connections())
            .field("cancels", &self.cancels())
            .finish_non_exhaustive()
    }
}

impl PgStub {
    /// Listen on an ephemeral loopback port, replying with `handler`.
    pub async fn start<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> StubReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let shared = Arc::new(Shared {
            handler: Box::new(handler),
            statements: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            next_pid: AtomicI32::new(1),
            waiting: Mutex::new(HashMap::new()),
        });

        let accepted = shared.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accepted.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, shared).await {
                        tracing::debug!("stub connection ended: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            port,
            shared,
            accept,
        })
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Statements received, in order, across all connections.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.shared.statements).clone()
    }

    /// Cancel requests received.
    pub fn cancels(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }

    /// Sessions that completed startup.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

impl Drop for PgStub {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    // Startup messages carry no type byte.
    loop {
        let len = stream.read_i32().await?;
        let code = stream.read_i32().await?;
        let mut rest = vec![0u8; usize::try_from(len - 8).unwrap_or(0)];
        stream.read_exact(&mut rest).await?;
        match code {
            SSL_REQUEST => stream.write_all(b"N").await?,
            CANCEL_REQUEST => {
                if let Some(pid) = rest.get(..4) {
                    shared.cancel(i32::from_be_bytes([pid[0], pid[1], pid[2], pid[3]]));
                }
                return Ok(());
            }
            _ => break,
        }
    }

    let pid = shared.next_pid.fetch_add(1, Ordering::SeqCst);
    let cancelled = Arc::new(Notify::new());
    lock(&shared.waiting).insert(pid, cancelled.clone());
    shared.connections.fetch_add(1, Ordering::SeqCst);

    let mut out = Vec::new();
    put_message(&mut out, b'R', &0i32.to_be_bytes());
    let mut key = pid.to_be_bytes().to_vec();
    key.extend_from_slice(&pid.to_be_bytes());
    put_message(&mut out, b'K', &key);
    put_message(&mut out, b'Z', b"I");
    stream.write_all(&out).await?;

    let result = session(&mut stream, &shared, &cancelled).await;
    lock(&shared.waiting).remove(&pid);
    result
}

async fn session(
    stream: &mut TcpStream,
    shared: &Shared,
    cancelled: &Notify,
) -> std::io::Result<()> {
    loop {
        let tag = match stream.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let len = stream.read_i32().await?;
        let mut body = vec![0u8; usize::try_from(len - 4).unwrap_or(0)];
        stream.read_exact(&mut body).await?;

        match tag {
            b'Q' => {
                let statement = String::from_utf8_lossy(&body)
                    .trim_end_matches('\0')
                    .to_string();
                lock(&shared.statements).push(statement.clone());
                let reply = (shared.handler)(&statement);
                if !respond(stream, reply, cancelled).await? {
                    return Ok(());
                }
            }
            b'X' => return Ok(()),
            _ => {}
        }
    }
}

/// Send `reply` followed by ReadyForQuery. Returns false on `Disconnect`.
async fn respond(
    stream: &mut TcpStream,
    mut reply: StubReply,
    cancelled: &Notify,
) -> std::io::Result<bool> {
    let mut out = Vec::new();
    loop {
        match reply {
            StubReply::After(delay, next) => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            StubReply::UntilCancel(next) => {
                cancelled.notified().await;
                reply = *next;
            }
            StubReply::Disconnect => return Ok(false),
            StubReply::Complete(tag) => {
                put_message(&mut out, b'C', &cstring(&tag));
                break;
            }
            StubReply::Rows { columns, rows } => {
                let mut description = (columns.len() as i16).to_be_bytes().to_vec();
                for column in &columns {
                    description.extend(cstring(column));
                    description.extend(0i32.to_be_bytes());
                    description.extend(0i16.to_be_bytes());
                    description.extend(TEXT_OID.to_be_bytes());
                    description.extend((-1i16).to_be_bytes());
                    description.extend((-1i32).to_be_bytes());
                    description.extend(0i16.to_be_bytes());
                }
                put_message(&mut out, b'T', &description);
                for row in &rows {
                    let mut data = (row.len() as i16).to_be_bytes().to_vec();
                    for value in row {
                        match value {
                            Some(v) => {
                                data.extend((v.len() as i32).to_be_bytes());
                                data.extend(v.as_bytes());
                            }
                            None => data.extend((-1i32).to_be_bytes()),
                        }
                    }
                    put_message(&mut out, b'D', &data);
                }
                put_message(&mut out, b'C', &cstring(&format!("SELECT {}", rows.len())));
                break;
            }
            StubReply::Error { code, message } => {
                let mut fields = Vec::new();
                let severity = [(b'S', "ERROR"), (b'V', "ERROR")];
                let details = [(b'C', code.as_str()), (b'M', message.as_str())];
                for (field, value) in severity.into_iter().chain(details) {
                    fields.push(field);
                    fields.extend(cstring(value));
                }
                fields.push(0);
                put_message(&mut out, b'E', &fields);
                break;
            }
        }
    }
    put_message(&mut out, b'Z', b"I");
    stream.write_all(&out).await?;
    Ok(true)
}

fn put_message(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    out.extend(((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
}

fn cstring(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
