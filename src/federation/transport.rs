//! Downstream transports.
//!
//! A [`BackendTransport`] knows how to open a connection to one backend; the
//! resulting [`BackendConnection`] carries JSON-RPC requests and
//! notifications. Two implementations:
//! - [`StdioTransport`]: child process, line-delimited JSON over stdin/stdout
//! - [`HttpTransport`]: streamable HTTP (POST, JSON or SSE replies, `Mcp-Session-Id`)
//!
//! Connections are multiplexed: many requests may be in flight at once and
//! replies are matched back to callers by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::config::BackendConfig;
use super::errors::GatewayError;
use super::types::{JsonRpcRequest, JsonRpcResponse, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Grace period for a child process to exit after stdin closes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr kept for error context.
const STDERR_TAIL_LIMIT: usize = 2000;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// An open JSON-RPC channel to one backend.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Send a request with the given id and wait for its result.
    ///
    /// JSON-RPC errors come back as [`GatewayError::Remote`]. Callers bound
    /// the wait themselves; dropping the future abandons the request.
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError>;

    /// Send a notification (no reply expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError>;

    /// Close the channel and release its resources. Idempotent.
    async fn close(&self);

    /// Whether the channel has been lost or closed.
    fn is_closed(&self) -> bool;
}

/// Factory for connections to one backend. Reused on every reconnect.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish a new connection. Performs no protocol handshake.
    async fn open(&self) -> Result<Arc<dyn BackendConnection>, GatewayError>;
}

/// Build the transport described by a backend record.
pub fn for_config(config: &BackendConfig) -> Result<Arc<dyn BackendTransport>, GatewayError> {
    match config.transport {
        TransportKind::Stdio => Ok(Arc::new(StdioTransport::from_config(config)?)),
        TransportKind::Http => Ok(Arc::new(HttpTransport::from_config(config)?)),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `GatewayError`.
pub fn extract_result(
    target: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, GatewayError> {
    if let Some(err) = response.error {
        return Err(GatewayError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| GatewayError::Protocol {
        target: target.to_string(),
        reason: "response missing both result and error".into(),
    })
}

fn encode_message(target: &str, message: &impl serde::Serialize) -> Result<String, GatewayError> {
    let mut json = serde_json::to_string(message).map_err(|e| GatewayError::Protocol {
        target: target.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

fn notification(method: &str, params: Option<serde_json::Value>) -> serde_json::Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Launches a backend as a child process.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    backend_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
}

impl StdioTransport {
    pub fn new(backend_id: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            command: command.to_string(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, GatewayError> {
        let command = config.command.clone().ok_or_else(|| GatewayError::Config {
            reason: format!("stdio backend '{}' requires a command", config.id),
        })?;
        Ok(Self {
            backend_id: config.id.clone(),
            command,
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        })
    }

    fn spawn_error(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Connection {
            target: self.backend_id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl BackendTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<Arc<dyn BackendConnection>, GatewayError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.spawn_error(format!("failed to spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_error("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_error("failed to capture stdout"))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));

        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            let backend = self.backend_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = %backend, stderr = %line, "backend stderr");
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_LIMIT {
                        let cut = tail.len() - STDERR_TAIL_LIMIT;
                        let boundary = (cut..tail.len())
                            .find(|i| tail.is_char_boundary(*i))
                            .unwrap_or(tail.len());
                        tail.drain(..boundary);
                    }
                }
            });
        }

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let backend = self.backend_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route_line(&backend, &pending, line.trim()),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(backend = %backend, error = %e, "failed to read backend stdout");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiting request.
                lock_pending(&pending).clear();
                tracing::debug!(backend = %backend, "backend stdout closed");
            })
        };

        tracing::debug!(backend = %self.backend_id, command = %self.command, "spawned stdio backend");

        Ok(Arc::new(StdioConnection {
            backend_id: self.backend_id.clone(),
            writer: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            closed,
            stderr_tail,
            reader,
        }))
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hand one stdout line to the request waiting for it.
fn route_line(backend: &str, pending: &PendingMap, line: &str) {
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<JsonRpcResponse>(line) {
        Ok(resp) => {
            let Some(id) = resp.id else {
                tracing::trace!(backend = %backend, "ignoring server notification");
                return;
            };
            let sender = lock_pending(pending).remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => tracing::debug!(backend = %backend, id, "reply for unknown or abandoned request"),
            }
        }
        // Not a JSON-RPC message; servers sometimes log to stdout.
        Err(_) => tracing::trace!(backend = %backend, line = %line, "skipping non-JSON stdout line"),
    }
}

/// Removes a pending entry when its request finishes or is abandoned.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

struct StdioConnection {
    backend_id: String,
    writer: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    reader: JoinHandle<()>,
}

impl StdioConnection {
    fn lost(&self, reason: &str) -> GatewayError {
        let stderr = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .trim()
            .to_string();
        let suffix = if stderr.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {stderr}")
        };
        GatewayError::Connection {
            target: self.backend_id.clone(),
            reason: format!("{reason}{suffix}"),
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), GatewayError> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| self.lost("connection closed"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.lost(&format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.lost(&format!("failed to flush stdin: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BackendConnection for StdioConnection {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        if self.is_closed() {
            return Err(self.lost("server stdout closed (process may have exited)"));
        }

        let line = encode_message(&self.backend_id, &JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // The reader may have drained the map just before our insert.
        if self.is_closed() {
            return Err(self.lost("server stdout closed (process may have exited)"));
        }

        self.write_line(&line).await?;

        let response = rx
            .await
            .map_err(|_| self.lost("server stdout closed (process may have exited)"))?;
        extract_result(&self.backend_id, response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let line = encode_message(&self.backend_id, &notification(method, params))?;
        self.write_line(&line).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Closing stdin is the shutdown signal for stdio servers.
        drop(self.writer.lock().await.take());

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(_)) => {}
                _ => {
                    tracing::debug!(backend = %self.backend_id, "force-killing backend process");
                    let _ = child.kill().await;
                }
            }
        }
        self.reader.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Talks to a backend over streamable HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    backend_id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(backend_id: &str, url: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            backend_id: backend_id.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            client,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, GatewayError> {
        let url = config.url.as_deref().ok_or_else(|| GatewayError::Config {
            reason: format!("http backend '{}' requires a url", config.id),
        })?;
        let mut transport = Self::new(&config.id, url)?;
        transport.headers = config.headers.clone();
        Ok(transport)
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self) -> Result<Arc<dyn BackendConnection>, GatewayError> {
        Ok(Arc::new(HttpConnection {
            backend_id: self.backend_id.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            client: self.client.clone(),
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct HttpConnection {
    backend_id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    /// `Mcp-Session-Id` assigned by the server.
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpConnection {
    fn error(&self, reason: String) -> GatewayError {
        GatewayError::Connection {
            target: self.backend_id.clone(),
            reason,
        }
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, GatewayError> {
        if self.is_closed() {
            return Err(self.error("connection closed".into()));
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id.lock().await.as_deref() {
            request = request.header("mcp-session-id", session_id);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_connect() {
                self.error(format!("failed to connect: {e}"))
            } else {
                self.error(format!("HTTP request failed: {e}"))
            }
        })?;

        if let Some(value) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut session_id = self.session_id.lock().await;
            if session_id.as_deref() != Some(value) {
                tracing::debug!(backend = %self.backend_id, session_id = value, "captured session id");
                *session_id = Some(value.to_string());
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // The server dropped our session; only a fresh handshake recovers.
            self.closed.store(true, Ordering::SeqCst);
            return Err(self.error(format!("HTTP {status}: session no longer exists")));
        }
        if status.is_server_error() {
            return Err(self.error(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(GatewayError::Protocol {
                target: self.backend_id.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BackendConnection for HttpConnection {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let response = self.post(body).await?;

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let text = response
            .text()
            .await
            .map_err(|e| self.error(format!("failed to read response body: {e}")))?;

        let reply = if is_sse {
            parse_sse_events(&text)
                .into_iter()
                .filter(|event| event.event.as_deref().map_or(true, |e| e == "message"))
                .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(&event.data).ok())
                .find(|resp| resp.id == Some(id))
                .ok_or_else(|| GatewayError::Protocol {
                    target: self.backend_id.clone(),
                    reason: format!("event stream ended without a reply to request {id}"),
                })?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).map_err(|e| GatewayError::Protocol {
                target: self.backend_id.clone(),
                reason: format!("malformed reply: {e}"),
            })?
        };

        extract_result(&self.backend_id, reply)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let body = serde_json::to_string(&notification(method, params))?;
        self.post(body).await.map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Best-effort session termination.
        if let Some(session_id) = self.session_id.lock().await.take() {
            let _ = self
                .client
                .delete(&self.url)
                .header("mcp-session-id", session_id)
                .send()
                .await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// A parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

/// Split a `text/event-stream` body into events.
fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let normalized = body.replace("\r\n", "\n");
    let mut events = Vec::new();

    for raw_event in normalized.split("\n\n") {
        let mut event = SseEvent::default();
        let mut has_data = false;

        for line in raw_event.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event.event = Some(value.to_string()),
                "data" => {
                    if has_data {
                        event.data.push('\n');
                    }
                    event.data.push_str(value);
                    has_data = true;
                }
                _ => {}
            }
        }

        if has_data {
            events.push(event);
        }
    }
    events
}

// ─── Tests ───────────────────────────────────────────────────────────────────
