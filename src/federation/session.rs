//! Backend session — the lifecycle of one downstream server connection.
//!
//! A session connects through its [`BackendTransport`], performs the protocol
//! handshake, publishes the server's capabilities into the [`Registry`], and
//! then runs a supervisor task that pings the server on a fixed interval.
//! A missed heartbeat degrades the session and withdraws its capabilities
//! until a ping succeeds again; too many misses (or a closed connection) drop
//! the connection and start reconnecting with exponential backoff.
//!
//! State machine: `Disconnected → Connecting → Ready ⇄ Degraded → Disconnected`,
//! plus the terminal `Failed` once reconnect attempts are exhausted.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::SessionSettings;
use super::errors::GatewayError;
use super::registry::{Registry, ResolverTarget};
use super::transport::{next_request_id, BackendConnection, BackendTransport};
use super::types::{
    error_codes, CapabilityDescriptor, CapabilityKind, InitializeResult, Origin, SessionState,
    TransportKind, PROTOCOL_VERSION,
};

/// Upper bound on pages fetched per listing, against servers that loop cursors.
const MAX_LIST_PAGES: usize = 100;

// ─── Operator Events ─────────────────────────────────────────────────────────

/// Something an operator should know about a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnect attempts exhausted; the session will not recover on its own.
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

/// Point-in-time view of a session for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub transport: TransportKind,
    pub state: SessionState,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    /// Capabilities the server advertised at handshake.
    pub server_capabilities: Option<serde_json::Value>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub in_flight: usize,
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionInner {
    connection: Option<Arc<dyn BackendConnection>>,
    init: Option<InitializeResult>,
    connected_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    /// Descriptors from the last successful listing, republished on recovery.
    published: Vec<CapabilityDescriptor>,
}

/// One downstream server connection, independent of transport kind.
pub struct BackendSession {
    id: String,
    transport: Arc<dyn BackendTransport>,
    settings: SessionSettings,
    max_concurrency: usize,
    limiter: Semaphore,
    state: watch::Sender<SessionState>,
    inner: Mutex<SessionInner>,
    registry: Arc<Registry>,
    events: broadcast::Sender<SessionEvent>,
    /// Wakes the supervisor early when a call finds the connection closed.
    wake: Arc<Notify>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BackendSession {
    pub fn new(
        id: &str,
        transport: Arc<dyn BackendTransport>,
        settings: SessionSettings,
        max_concurrency: usize,
        registry: Arc<Registry>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let max_concurrency = max_concurrency.max(1);
        Arc::new(Self {
            id: id.to_string(),
            transport,
            settings,
            max_concurrency,
            limiter: Semaphore::new(max_concurrency),
            state: watch::channel(SessionState::Disconnected).0,
            inner: Mutex::new(SessionInner::default()),
            registry,
            events,
            wake: Arc::new(Notify::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connection(&self) -> Option<Arc<dyn BackendConnection>> {
        self.inner().connection.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner();
        let server_info = inner.init.as_ref().and_then(|i| i.server_info.clone());
        SessionStatus {
            id: self.id.clone(),
            transport: self.transport.kind(),
            state: self.state(),
            server_name: server_info.as_ref().and_then(|s| s.name.clone()),
            server_version: server_info.and_then(|s| s.version),
            server_capabilities: inner.init.as_ref().map(|i| i.capabilities.clone()),
            connected_at: inner.connected_at,
            last_heartbeat: inner.last_heartbeat,
            last_error: inner.last_error.clone(),
            reconnect_attempts: inner.reconnect_attempts,
            in_flight: self.max_concurrency - self.limiter.available_permits(),
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent {
            session_id: self.id.clone(),
            at: Utc::now(),
            kind,
        });
    }

    fn set_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(backend = %self.id, from = ?from, to = ?to, "session state changed");
            self.emit(SessionEventKind::StateChanged { from, to });
        }
    }

    fn record_error(&self, error: &GatewayError) {
        self.inner().last_error = Some(error.to_string());
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect, handshake, publish capabilities, and start the supervisor.
    ///
    /// A no-op when the session already accepts calls.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.state().accepts_calls() {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        match self.establish().await {
            Ok(count) => {
                self.inner().reconnect_attempts = 0;
                self.set_state(SessionState::Ready);
                tracing::info!(backend = %self.id, capabilities = count, "backend connected");
                self.spawn_supervisor();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(backend = %self.id, error = %e, "backend connect failed");
                self.record_error(&e);
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Stop supervising, drop capabilities, and release the connection.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        if let Err(e) = self.registry.remove(&self.id) {
            tracing::error!(backend = %self.id, error = %e, "failed to remove capabilities");
        }
        let connection = self.inner().connection.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Open a connection, handshake, list, and register. Returns the number of
    /// capabilities published.
    async fn establish(&self) -> Result<usize, GatewayError> {
        let connection = self.transport.open().await?;

        let handshake = async {
            let init = self.handshake(&connection).await?;
            let descriptors = self.list_from(&connection).await?;
            Ok::<_, GatewayError>((init, descriptors))
        };

        let outcome = match tokio::time::timeout(self.settings.init_timeout(), handshake).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                target: self.id.clone(),
                elapsed_ms: self.settings.init_timeout_ms,
            }),
        };

        let (init, descriptors) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        {
            let mut inner = self.inner();
            inner.connection = Some(connection.clone());
            inner.init = Some(init);
            inner.connected_at = Some(Utc::now());
            inner.last_heartbeat = None;
            inner.published = descriptors.clone();
        }

        match self.publish(descriptors) {
            Ok(count) => Ok(count),
            Err(e) => {
                self.inner().connection = None;
                connection.close().await;
                Err(e)
            }
        }
    }

    fn publish(&self, descriptors: Vec<CapabilityDescriptor>) -> Result<usize, GatewayError> {
        let items = descriptors
            .into_iter()
            .map(|d| {
                let target = ResolverTarget::Backend {
                    session_id: self.id.clone(),
                };
                (d, target)
            })
            .collect();
        self.registry.add_all(&self.id, items)
    }

    /// `initialize` request followed by the `initialized` notification.
    async fn handshake(
        &self,
        connection: &Arc<dyn BackendConnection>,
    ) -> Result<InitializeResult, GatewayError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcpgate", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = connection
            .request(next_request_id(), "initialize", Some(params))
            .await?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| GatewayError::Protocol {
                target: self.id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        connection.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    // ─── Listing ─────────────────────────────────────────────────────────

    /// Raw descriptors from the live connection: tools, then prompts, then
    /// resources.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, GatewayError> {
        let connection = self.connection().ok_or_else(|| GatewayError::Disconnected {
            session: self.id.clone(),
        })?;
        self.list_from(&connection).await
    }

    async fn list_from(
        &self,
        connection: &Arc<dyn BackendConnection>,
    ) -> Result<Vec<CapabilityDescriptor>, GatewayError> {
        let mut out = Vec::new();

        for item in self.list_all(connection, "tools/list", "tools", true).await? {
            out.push(self.parse_tool(&item)?);
        }
        for item in self.list_all(connection, "prompts/list", "prompts", false).await? {
            out.push(self.parse_prompt(&item)?);
        }
        for item in self.list_all(connection, "resources/list", "resources", false).await? {
            out.push(self.parse_resource(&item)?);
        }
        Ok(out)
    }

    /// Follow `nextCursor` until exhausted. When `required` is false a
    /// method-not-found reply means the server has none of these.
    async fn list_all(
        &self,
        connection: &Arc<dyn BackendConnection>,
        method: &str,
        key: &str,
        required: bool,
    ) -> Result<Vec<serde_json::Value>, GatewayError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = match connection.request(next_request_id(), method, params).await {
                Ok(result) => result,
                Err(GatewayError::Remote { code, .. })
                    if !required && code == error_codes::METHOD_NOT_FOUND =>
                {
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            };

            let page = result
                .get(key)
                .and_then(|v| v.as_array())
                .ok_or_else(|| self.protocol(format!("{method} reply has no '{key}' array")))?;
            items.extend(page.iter().cloned());

            match result.get("nextCursor").and_then(|c| c.as_str()) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(items),
            }
        }

        Err(self.protocol(format!("{method} exceeded {MAX_LIST_PAGES} pages")))
    }

    fn protocol(&self, reason: String) -> GatewayError {
        GatewayError::Protocol {
            target: self.id.clone(),
            reason,
        }
    }

    fn required_str<'a>(
        &self,
        item: &'a serde_json::Value,
        field: &str,
        what: &str,
    ) -> Result<&'a str, GatewayError> {
        item.get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.protocol(format!("{what} entry missing '{field}'")))
    }

    fn parse_tool(&self, item: &serde_json::Value) -> Result<CapabilityDescriptor, GatewayError> {
        let name = self.required_str(item, "name", "tool")?;
        let schema = item
            .get("inputSchema")
            .filter(|s| s.is_object())
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        let read_only = item
            .pointer("/annotations/readOnlyHint")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(
            CapabilityDescriptor::new(CapabilityKind::Tool, name, &self.id, Origin::Backend)
                .with_description(item["description"].as_str().unwrap_or_default())
                .with_schema(schema)
                .with_read_only(read_only),
        )
    }

    fn parse_prompt(&self, item: &serde_json::Value) -> Result<CapabilityDescriptor, GatewayError> {
        let name = self.required_str(item, "name", "prompt")?;

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for arg in item["arguments"].as_array().into_iter().flatten() {
            let Some(arg_name) = arg["name"].as_str() else {
                continue;
            };
            properties.insert(
                arg_name.to_string(),
                serde_json::json!({
                    "type": "string",
                    "description": arg["description"].as_str().unwrap_or_default(),
                }),
            );
            if arg["required"].as_bool().unwrap_or(false) {
                required.push(serde_json::Value::String(arg_name.to_string()));
            }
        }

        Ok(
            CapabilityDescriptor::new(CapabilityKind::Prompt, name, &self.id, Origin::Backend)
                .with_description(item["description"].as_str().unwrap_or_default())
                .with_schema(serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })),
        )
    }

    fn parse_resource(&self, item: &serde_json::Value) -> Result<CapabilityDescriptor, GatewayError> {
        let uri = self.required_str(item, "uri", "resource")?;
        let description = item["description"]
            .as_str()
            .or_else(|| item["name"].as_str())
            .unwrap_or_default();

        Ok(
            CapabilityDescriptor::new(CapabilityKind::Resource, uri, &self.id, Origin::Backend)
                .with_description(description)
                .with_mime_type(item["mimeType"].as_str().map(str::to_string)),
        )
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Invoke a capability by its raw name under an absolute deadline.
    ///
    /// Waiting for a concurrency slot counts against the deadline; a request
    /// that never gets a slot fails with `Timeout` without reaching the
    /// backend.
    pub async fn invoke(
        &self,
        kind: CapabilityKind,
        raw_name: &str,
        arguments: serde_json::Value,
        deadline: Instant,
    ) -> Result<serde_json::Value, GatewayError> {
        let started = Instant::now();
        let timeout = |started: Instant| GatewayError::Timeout {
            target: format!("{}:{raw_name}", self.id),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        if !self.state().accepts_calls() {
            return Err(GatewayError::Disconnected {
                session: self.id.clone(),
            });
        }

        let _permit = tokio::time::timeout_at(deadline, self.limiter.acquire())
            .await
            .map_err(|_| timeout(started))?
            .map_err(|_| GatewayError::Disconnected {
                session: self.id.clone(),
            })?;

        let connection = self.connection().ok_or_else(|| GatewayError::Disconnected {
            session: self.id.clone(),
        })?;

        let (method, params) = match kind {
            CapabilityKind::Tool => (
                "tools/call",
                serde_json::json!({ "name": raw_name, "arguments": arguments }),
            ),
            CapabilityKind::Prompt => (
                "prompts/get",
                serde_json::json!({ "name": raw_name, "arguments": arguments }),
            ),
            CapabilityKind::Resource => ("resources/read", serde_json::json!({ "uri": raw_name })),
        };

        let id = next_request_id();
        tracing::debug!(backend = %self.id, method, name = raw_name, id, "forwarding request");

        let outcome =
            tokio::time::timeout_at(deadline, connection.request(id, method, Some(params))).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                self.cancel(connection.clone(), id);
                return Err(timeout(started));
            }
        };

        let value = result.map_err(|e| {
            if connection.is_closed() {
                self.wake.notify_one();
            }
            e
        })?;

        if kind == CapabilityKind::Tool && value["isError"].as_bool() == Some(true) {
            return Err(GatewayError::Remote {
                code: error_codes::TOOL_ERROR,
                message: tool_error_text(&value),
                data: Some(value),
            });
        }
        Ok(value)
    }

    /// Best-effort cancellation of an abandoned request.
    fn cancel(&self, connection: Arc<dyn BackendConnection>, id: u64) {
        let backend = self.id.clone();
        tokio::spawn(async move {
            let params = serde_json::json!({ "requestId": id, "reason": "deadline exceeded" });
            if let Err(e) = connection.notify("notifications/cancelled", Some(params)).await {
                tracing::debug!(backend = %backend, id, error = %e, "cancel notification failed");
            }
        });
    }

    // ─── Supervision ─────────────────────────────────────────────────────

    fn spawn_supervisor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let wake = self.wake.clone();
        let interval = self.settings.heartbeat_interval();
        let handle = tokio::spawn(supervise(weak, wake, interval));

        let previous = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Ping once. Any reply, even an error object, proves liveness.
    async fn heartbeat(&self, connection: &Arc<dyn BackendConnection>) -> Result<(), GatewayError> {
        let started = Instant::now();
        let ping = connection.request(next_request_id(), "ping", None);
        match tokio::time::timeout(self.settings.heartbeat_timeout(), ping).await {
            Ok(Ok(_)) | Ok(Err(GatewayError::Remote { .. })) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::Timeout {
                target: self.id.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// One supervisor tick. Returns the reason the connection is lost, if it is.
    async fn check_health(&self, missed: &mut u32) -> Option<String> {
        let Some(connection) = self.connection() else {
            return Some("no connection".into());
        };
        if connection.is_closed() {
            return Some("connection closed".into());
        }

        match self.heartbeat(&connection).await {
            Ok(()) => {
                *missed = 0;
                self.inner().last_heartbeat = Some(Utc::now());
                if self.state() == SessionState::Degraded {
                    let published = self.inner().published.clone();
                    if let Err(e) = self.publish(published) {
                        return Some(format!("failed to republish capabilities: {e}"));
                    }
                    self.set_state(SessionState::Ready);
                }
                None
            }
            Err(e) => {
                *missed += 1;
                tracing::warn!(backend = %self.id, missed = *missed, error = %e, "heartbeat missed");
                if connection.is_closed() {
                    return Some("connection closed".into());
                }
                if *missed >= self.settings.max_missed_heartbeats {
                    return Some(format!("{missed} consecutive heartbeats missed"));
                }
                if self.state() == SessionState::Ready {
                    // Unhealthy sessions are not routable.
                    if let Err(e) = self.registry.remove(&self.id) {
                        tracing::error!(backend = %self.id, error = %e, "failed to remove capabilities");
                    }
                    self.set_state(SessionState::Degraded);
                }
                None
            }
        }
    }

    /// Drop capabilities first so no new call is routed here, then release
    /// the connection.
    async fn drop_connection(&self, reason: &str) {
        tracing::warn!(backend = %self.id, reason, "backend connection lost");
        if let Err(e) = self.registry.remove(&self.id) {
            tracing::error!(backend = %self.id, error = %e, "failed to remove capabilities");
        }
        let connection = {
            let mut inner = self.inner();
            inner.last_error = Some(reason.to_string());
            inner.connection.take()
        };
        self.set_state(SessionState::Disconnected);
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Reconnect with backoff. Returns `false` once attempts are exhausted and
    /// the session is marked `Failed`.
    async fn reconnect(&self) -> bool {
        let policy = self.settings.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            self.inner().reconnect_attempts = attempt;
            tracing::info!(backend = %self.id, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.emit(SessionEventKind::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;

            self.set_state(SessionState::Connecting);
            match self.establish().await {
                Ok(count) => {
                    self.inner().reconnect_attempts = 0;
                    self.set_state(SessionState::Ready);
                    tracing::info!(backend = %self.id, attempt, capabilities = count, "backend reconnected");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(backend = %self.id, attempt, error = %e, "reconnect failed");
                    self.record_error(&e);
                    self.set_state(SessionState::Disconnected);
                }
            }
        }

        let reason = format!("gave up after {} reconnect attempts", policy.max_attempts);
        tracing::error!(backend = %self.id, %reason, "backend failed");
        self.inner().last_error = Some(reason.clone());
        self.set_state(SessionState::Failed);
        self.emit(SessionEventKind::Failed { reason });
        false
    }
}

/// Heartbeat and reconnect loop. Exits when the session is dropped or fails.
async fn supervise(weak: Weak<BackendSession>, wake: Arc<Notify>, interval: Duration) {
    let mut missed = 0u32;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }

        let Some(session) = weak.upgrade() else {
            return;
        };
        if let Some(reason) = session.check_health(&mut missed).await {
            session.drop_connection(&reason).await;
            if !session.reconnect().await {
                return;
            }
            missed = 0;
        }
    }
}

/// Text of a tool error reply, for the error message.
fn tool_error_text(result: &serde_json::Value) -> String {
    let text: Vec<&str> = result["content"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|c| c["text"].as_str())
        .collect();
    if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text.join("\n")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
