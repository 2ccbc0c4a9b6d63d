//! Scripted in-memory backend used by the session, dispatcher, and gateway tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::errors::GatewayError;
use super::transport::{BackendConnection, BackendTransport};
use super::types::{error_codes, TransportKind};

/// One scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Result(serde_json::Value),
    Error(i64, String),
    /// Never answer.
    Hang,
    /// Close the connection and fail with a reset.
    Reset,
    /// Fail with this error, leaving the connection open.
    Fail(GatewayError),
}

/// A fake protocol server. Clone the `Arc` to keep a handle for assertions.
pub(crate) struct MockBackend {
    name: String,
    tools: Mutex<Vec<serde_json::Value>>,
    prompts: Mutex<Option<Vec<serde_json::Value>>>,
    resources: Mutex<Option<Vec<serde_json::Value>>>,
    /// Keyed by method, or `tools/call:<name>` for a specific tool.
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    page_size: Mutex<Option<usize>>,
    ping_ok: AtomicBool,
    refuse_open: AtomicBool,
    opens: AtomicU32,
    requests: Mutex<Vec<(String, Option<serde_json::Value>)>>,
    notifications: Mutex<Vec<(String, Option<serde_json::Value>)>>,
    current: Mutex<Option<Arc<MockConnection>>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: Mutex::new(Vec::new()),
            prompts: Mutex::new(None),
            resources: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
            page_size: Mutex::new(None),
            ping_ok: AtomicBool::new(true),
            refuse_open: AtomicBool::new(false),
            opens: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        })
    }

    /// A backend exposing plain tools with the given names.
    pub fn with_tools(name: &str, tools: &[&str]) -> Arc<Self> {
        let backend = Self::new(name);
        for tool in tools {
            backend.add_tool(serde_json::json!({
                "name": tool,
                "description": format!("{tool} from {name}"),
                "inputSchema": {"type": "object", "properties": {}},
            }));
        }
        backend
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn BackendTransport> {
        Arc::new(MockTransport(self.clone()))
    }

    pub fn add_tool(&self, tool: serde_json::Value) {
        self.tools.lock().unwrap().push(tool);
    }

    pub fn set_prompts(&self, prompts: Vec<serde_json::Value>) {
        *self.prompts.lock().unwrap() = Some(prompts);
    }

    pub fn set_resources(&self, resources: Vec<serde_json::Value>) {
        *self.resources.lock().unwrap() = Some(resources);
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = Some(size);
    }

    /// Queue a reply for `key` (a method, or `tools/call:<tool>`).
    pub fn script(&self, key: &str, reply: MockReply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_ping(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Requests received for `method`.
    pub fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn notification_methods(&self) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Simulate the server process dying.
    pub fn crash(&self) {
        if let Some(conn) = self.current.lock().unwrap().take() {
            conn.closed.store(true, Ordering::SeqCst);
        }
    }

    fn next_script(&self, key: &str) -> Option<MockReply> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
    }

    fn page(
        &self,
        items: Vec<serde_json::Value>,
        key: &str,
        params: &Option<serde_json::Value>,
    ) -> serde_json::Value {
        let start: usize = params
            .as_ref()
            .and_then(|p| p["cursor"].as_str())
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let size = self.page_size.lock().unwrap().unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());

        let mut out = serde_json::json!({ key: items[start.min(end)..end].to_vec() });
        if end < items.len() {
            out["nextCursor"] = serde_json::json!(end.to_string());
        }
        out
    }

    fn default_reply(&self, method: &str, params: &Option<serde_json::Value>) -> MockReply {
        let not_found = || MockReply::Error(error_codes::METHOD_NOT_FOUND, "Method not found".into());
        match method {
            "initialize" => MockReply::Result(serde_json::json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": "0.0.1"},
            })),
            "ping" if self.ping_ok.load(Ordering::SeqCst) => MockReply::Result(serde_json::json!({})),
            "ping" => MockReply::Hang,
            "tools/list" => {
                MockReply::Result(self.page(self.tools.lock().unwrap().clone(), "tools", params))
            }
            "prompts/list" => match self.prompts.lock().unwrap().clone() {
                Some(prompts) => MockReply::Result(self.page(prompts, "prompts", params)),
                None => not_found(),
            },
            "resources/list" => match self.resources.lock().unwrap().clone() {
                Some(resources) => MockReply::Result(self.page(resources, "resources", params)),
                None => not_found(),
            },
            "tools/call" => {
                let p = params.clone().unwrap_or_default();
                MockReply::Result(serde_json::json!({
                    "content": [{"type": "text", "text": format!("{} ok", p["name"].as_str().unwrap_or(""))}],
                    "echo": p["arguments"],
                    "server": self.name,
                }))
            }
            "prompts/get" => {
                let p = params.clone().unwrap_or_default();
                MockReply::Result(serde_json::json!({
                    "description": p["name"],
                    "messages": [{"role": "user", "content": {"type": "text", "text": format!("prompt {}", p["name"].as_str().unwrap_or(""))}}],
                }))
            }
            "resources/read" => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p["uri"].as_str())
                    .unwrap_or_default()
                    .to_string();
                MockReply::Result(serde_json::json!({
                    "contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("content of {uri}")}],
                }))
            }
            _ => not_found(),
        }
    }
}

struct MockTransport(Arc<MockBackend>);

#[async_trait]
impl BackendTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<Arc<dyn BackendConnection>, GatewayError> {
        if self.0.refuse_open.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection {
                target: self.0.name.clone(),
                reason: "connection refused".into(),
            });
        }
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(MockConnection {
            backend: self.0.clone(),
            closed: AtomicBool::new(false),
        });
        *self.0.current.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }
}

struct MockConnection {
    backend: Arc<MockBackend>,
    closed: AtomicBool,
}

impl MockConnection {
    fn reset(&self) -> GatewayError {
        GatewayError::Connection {
            target: self.backend.name.clone(),
            reason: "connection reset".into(),
        }
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn request(
        &self,
        _id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        if self.is_closed() {
            return Err(self.reset());
        }
        self.backend
            .requests
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        let tool_key = params
            .as_ref()
            .and_then(|p| p["name"].as_str())
            .map(|name| format!("{method}:{name}"));
        let reply = tool_key
            .and_then(|key| self.backend.next_script(&key))
            .or_else(|| self.backend.next_script(method))
            .unwrap_or_else(|| self.backend.default_reply(method, &params));

        match reply {
            MockReply::Result(value) => Ok(value),
            MockReply::Error(code, message) => Err(GatewayError::Remote {
                code,
                message,
                data: None,
            }),
            MockReply::Hang => std::future::pending().await,
            MockReply::Reset => {
                self.closed.store(true, Ordering::SeqCst);
                Err(self.reset())
            }
            MockReply::Fail(error) => Err(error),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(self.reset());
        }
        self.backend
            .notifications
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
