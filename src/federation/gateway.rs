//! Gateway facade — the operation set consumed by upstream transports.
//!
//! Owns the registry, the session table, and the dispatcher. Backends and
//! wrapped APIs are registered from configuration records (at startup or by
//! admin calls); listings and invocations go through the shared namespace.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use super::config::{ApiWrapperConfig, BackendConfig, GatewayConfig};
use super::dispatcher::{Dispatcher, SessionTable};
use super::errors::{ErrorObject, GatewayError};
use super::registry::{Registry, ResolverTarget};
use super::session::{BackendSession, SessionEvent, SessionStatus};
use super::transport::{self, BackendTransport};
use super::translator::{translate_wrapper, wrapper_owner_id};
use super::types::{
    error_codes, CapabilityKind, CatalogEntry, InvocationRequest, InvocationResult,
    ResourceContent, PROTOCOL_VERSION,
};

/// Buffered session events per subscriber before old ones are dropped.
const EVENT_BUFFER: usize = 256;

/// Point-in-time view of a wrapped API.
#[derive(Debug, Clone, Serialize)]
pub struct WrapperStatus {
    pub name: String,
    pub base_url: String,
    /// Qualified names of the synthetic tools it currently provides.
    pub tools: Vec<String>,
}

#[derive(Debug, Clone)]
struct WrapperRecord {
    name: String,
    base_url: String,
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Registry>,
    sessions: Arc<SessionTable>,
    wrappers: Mutex<Vec<WrapperRecord>>,
    dispatcher: Dispatcher,
    events: broadcast::Sender<SessionEvent>,
    /// Serializes register/unregister so id checks and publication agree.
    admin: tokio::sync::Mutex<()>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let sessions: Arc<SessionTable> = Arc::default();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            reqwest::Client::new(),
            config.dispatch.retry.clone(),
        );

        Self {
            config,
            registry,
            sessions,
            wrappers: Mutex::new(Vec::new()),
            dispatcher,
            events: broadcast::channel(EVENT_BUFFER).0,
            admin: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn session(&self, id: &str) -> Option<Arc<BackendSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn wrappers(&self) -> std::sync::MutexGuard<'_, Vec<WrapperRecord>> {
        self.wrappers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Apply every enabled configured record, backends first, in order.
    ///
    /// Returns the records that failed (partial startup is OK).
    pub async fn start(&self) -> Vec<(String, GatewayError)> {
        let mut failures = Vec::new();

        for backend in self.config.backends.iter().filter(|b| b.enabled) {
            if let Err(e) = self.register_backend(backend).await {
                failures.push((backend.id.clone(), e));
            }
        }

        for wrapper in self.config.api_wrappers.iter().filter(|w| w.enabled) {
            if let Err(e) = self.register_api_wrapper(wrapper).await {
                failures.push((wrapper_owner_id(&wrapper.name), e));
            }
        }

        for (name, error) in &failures {
            tracing::warn!(source = %name, error = %error, "failed to start");
        }
        tracing::info!(
            backends = self.sessions.read().unwrap_or_else(|e| e.into_inner()).len(),
            wrappers = self.wrappers().len(),
            capabilities = self.registry.snapshot().len(),
            failed = failures.len(),
            "gateway started"
        );
        failures
    }

    /// Disconnect every backend and drop every wrapped API.
    pub async fn shutdown(&self) {
        let _admin = self.admin.lock().await;

        let sessions: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        futures::future::join_all(sessions.iter().map(|s| s.disconnect())).await;

        let wrappers: Vec<_> = self.wrappers().drain(..).collect();
        for wrapper in wrappers {
            if let Err(e) = self.registry.remove(&wrapper_owner_id(&wrapper.name)) {
                tracing::error!(api = %wrapper.name, error = %e, "failed to remove wrapped api");
            }
        }
        tracing::info!("gateway shut down");
    }

    /// Connect a backend and publish its capabilities. Returns the session id.
    pub async fn register_backend(&self, config: &BackendConfig) -> Result<String, GatewayError> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(GatewayError::Config {
                reason: problems.join("; "),
            });
        }
        let transport = transport::for_config(config)?;
        self.register_backend_with(config, transport).await
    }

    /// Like [`register_backend`](Self::register_backend) with an explicit
    /// transport.
    pub async fn register_backend_with(
        &self,
        config: &BackendConfig,
        transport: Arc<dyn BackendTransport>,
    ) -> Result<String, GatewayError> {
        let _admin = self.admin.lock().await;

        if self.session(&config.id).is_some() || self.registry.snapshot().contains_owner(&config.id) {
            return Err(GatewayError::Conflict {
                name: config.id.clone(),
                existing_owner: config.id.clone(),
                incoming_owner: config.id.clone(),
            });
        }

        let session = BackendSession::new(
            &config.id,
            transport,
            self.config.session.clone(),
            config
                .max_concurrency
                .unwrap_or(self.config.session.max_concurrency),
            self.registry.clone(),
            self.events.clone(),
        );

        // Visible to the dispatcher before its capabilities are.
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(config.id.clone(), session.clone());

        if let Err(e) = session.connect().await {
            self.sessions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&config.id);
            session.disconnect().await;
            return Err(e);
        }

        Ok(config.id.clone())
    }

    /// Disconnect a backend and remove its capabilities.
    pub async fn unregister_backend(&self, id: &str) -> Result<(), GatewayError> {
        let _admin = self.admin.lock().await;

        let session = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound {
                name: id.to_string(),
            })?;
        session.disconnect().await;
        tracing::info!(backend = id, "backend unregistered");
        Ok(())
    }

    /// Disconnect a backend but keep it registered, so it can be reconnected
    /// later.
    pub async fn disconnect_backend(&self, id: &str) -> Result<(), GatewayError> {
        let _admin = self.admin.lock().await;

        let session = self.session(id).ok_or_else(|| GatewayError::NotFound {
            name: id.to_string(),
        })?;
        session.disconnect().await;
        tracing::info!(backend = id, "backend disconnected by admin");
        Ok(())
    }

    /// Drop a registered backend's connection (whatever its state, including
    /// `Failed`) and connect it again with a fresh reconnect budget.
    pub async fn reconnect_backend(&self, id: &str) -> Result<(), GatewayError> {
        let _admin = self.admin.lock().await;

        let session = self.session(id).ok_or_else(|| GatewayError::NotFound {
            name: id.to_string(),
        })?;
        session.disconnect().await;
        session.connect().await?;
        tracing::info!(backend = id, "backend reconnected by admin");
        Ok(())
    }

    /// Translate a REST API and publish its endpoints as tools. Returns the
    /// number of tools added.
    pub async fn register_api_wrapper(
        &self,
        config: &ApiWrapperConfig,
    ) -> Result<usize, GatewayError> {
        let _admin = self.admin.lock().await;

        let owner = wrapper_owner_id(&config.name);
        if self.wrappers().iter().any(|w| w.name == config.name) {
            return Err(GatewayError::Conflict {
                name: owner.clone(),
                existing_owner: owner.clone(),
                incoming_owner: owner,
            });
        }

        let items = translate_wrapper(config)?
            .into_iter()
            .map(|(descriptor, adapter)| (descriptor, ResolverTarget::WrappedApi(Arc::new(adapter))))
            .collect();
        let count = self.registry.add_all(&owner, items)?;

        self.wrappers().push(WrapperRecord {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
        });
        tracing::info!(api = %config.name, tools = count, "api wrapper registered");
        Ok(count)
    }

    pub async fn unregister_api_wrapper(&self, name: &str) -> Result<(), GatewayError> {
        let _admin = self.admin.lock().await;

        let removed = {
            let mut wrappers = self.wrappers();
            let before = wrappers.len();
            wrappers.retain(|w| w.name != name);
            before != wrappers.len()
        };
        if !removed {
            return Err(GatewayError::NotFound {
                name: wrapper_owner_id(name),
            });
        }
        self.registry.remove(&wrapper_owner_id(name))?;
        tracing::info!(api = name, "api wrapper unregistered");
        Ok(())
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Status of every registered backend, ordered by id.
    pub fn backend_status(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Status of every wrapped API, in registration order.
    pub fn wrapper_status(&self) -> Vec<WrapperStatus> {
        let snapshot = self.registry.snapshot();
        self.wrappers()
            .iter()
            .map(|w| {
                let owner = wrapper_owner_id(&w.name);
                WrapperStatus {
                    name: w.name.clone(),
                    base_url: w.base_url.clone(),
                    tools: snapshot
                        .list(Some(CapabilityKind::Tool))
                        .iter()
                        .filter(|e| e.descriptor.owner_id == owner)
                        .map(|e| e.descriptor.qualified_name.clone())
                        .collect(),
                }
            })
            .collect()
    }

    /// Session lifecycle events (state changes, reconnects, failures).
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ─── Listing ─────────────────────────────────────────────────────────

    /// Entries of one kind, optionally restricted to one owner (a backend id
    /// or `api:<wrapper>`).
    fn catalog(&self, kind: CapabilityKind, owner: Option<&str>) -> Vec<CatalogEntry> {
        self.registry
            .list(Some(kind))
            .iter()
            .filter(|e| owner.map_or(true, |o| e.descriptor.owner_id == o))
            .map(|e| CatalogEntry::from(&e.descriptor))
            .collect()
    }

    pub fn list_tools(&self, owner: Option<&str>) -> Vec<CatalogEntry> {
        self.catalog(CapabilityKind::Tool, owner)
    }

    pub fn list_prompts(&self, owner: Option<&str>) -> Vec<CatalogEntry> {
        self.catalog(CapabilityKind::Prompt, owner)
    }

    pub fn list_resources(&self, owner: Option<&str>) -> Vec<CatalogEntry> {
        self.catalog(CapabilityKind::Resource, owner)
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Call a tool under the configured default deadline.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> InvocationResult {
        self.call_tool_with_timeout(name, arguments, self.config.dispatch.default_deadline())
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> InvocationResult {
        let request = InvocationRequest::with_timeout(CapabilityKind::Tool, name, arguments, timeout);
        self.dispatcher.dispatch(request).await
    }

    /// Render a prompt. Returns the backend's `{description?, messages}`.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let request = InvocationRequest::with_timeout(
            CapabilityKind::Prompt,
            name,
            arguments,
            self.config.dispatch.default_deadline(),
        );
        self.dispatcher.dispatch(request).await.into_result()
    }

    /// Read a resource by its qualified URI.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, GatewayError> {
        let request = InvocationRequest::with_timeout(
            CapabilityKind::Resource,
            uri,
            serde_json::Value::Null,
            self.config.dispatch.default_deadline(),
        );
        let payload = self.dispatcher.dispatch(request).await.into_result()?;

        let first = payload["contents"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| GatewayError::Protocol {
                target: uri.to_string(),
                reason: "resources/read returned no contents".into(),
            })?;

        let declared_mime = self
            .registry
            .lookup(CapabilityKind::Resource, uri)
            .and_then(|e| e.descriptor.mime_type.clone());
        let mime_type = first["mimeType"]
            .as_str()
            .map(String::from)
            .or(declared_mime);

        let (content, is_blob) = match (first["text"].as_str(), first["blob"].as_str()) {
            (Some(text), _) => (text.to_string(), false),
            (None, Some(blob)) => (blob.to_string(), true),
            (None, None) => (String::new(), false),
        };

        Ok(ResourceContent {
            uri: uri.to_string(),
            mime_type,
            content,
            is_blob,
        })
    }

    // ─── Boundary ────────────────────────────────────────────────────────

    /// Serve one upstream JSON-RPC method.
    pub async fn handle_rpc(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorObject> {
        let params = params.unwrap_or_else(|| serde_json::json!({}));

        match method {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "prompts": {"listChanged": false},
                    "resources": {"listChanged": false},
                },
                "serverInfo": {"name": "mcpgate", "version": env!("CARGO_PKG_VERSION")},
            })),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => {
                let tools: Vec<_> = self
                    .list_tools(None)
                    .into_iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.qualified_name,
                            "description": t.description,
                            "inputSchema": t.schema,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = required_str(&params, "name")?;
                let arguments = arguments(&params);
                match self.call_tool(name, arguments).await.into_result() {
                    Ok(payload) => Ok(tool_payload(payload)),
                    Err(GatewayError::Remote {
                        code: error_codes::TOOL_ERROR,
                        message,
                        ..
                    }) => Ok(serde_json::json!({
                        "content": [{"type": "text", "text": message}],
                        "isError": true,
                    })),
                    Err(e) => Err(e.error_object()),
                }
            }
            "prompts/list" => {
                let prompts: Vec<_> = self
                    .list_prompts(None)
                    .into_iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.qualified_name,
                            "description": p.description,
                            "arguments": prompt_arguments(&p.schema),
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "prompts": prompts }))
            }
            "prompts/get" => {
                let name = required_str(&params, "name")?;
                self.get_prompt(name, arguments(&params))
                    .await
                    .map_err(|e| e.error_object())
            }
            "resources/list" => {
                let resources: Vec<_> = self
                    .list_resources(None)
                    .into_iter()
                    .map(|r| {
                        let mut out = serde_json::json!({
                            "uri": r.qualified_name,
                            "name": r.qualified_name,
                            "description": r.description,
                        });
                        if let Some(mime) = r.mime_type {
                            out["mimeType"] = serde_json::Value::String(mime);
                        }
                        out
                    })
                    .collect();
                Ok(serde_json::json!({ "resources": resources }))
            }
            "resources/read" => {
                let uri = required_str(&params, "uri")?;
                let content = self.read_resource(uri).await.map_err(|e| e.error_object())?;

                let mut entry = serde_json::json!({ "uri": content.uri });
                if let Some(mime) = content.mime_type {
                    entry["mimeType"] = serde_json::Value::String(mime);
                }
                let field = if content.is_blob { "blob" } else { "text" };
                entry[field] = serde_json::Value::String(content.content);
                Ok(serde_json::json!({ "contents": [entry] }))
            }
            _ => Err(ErrorObject::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            )),
        }
    }
}

fn required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ErrorObject> {
    params[key].as_str().ok_or_else(|| {
        ErrorObject::new(
            error_codes::INVALID_PARAMS,
            format!("missing string parameter '{key}'"),
        )
    })
}

fn arguments(params: &serde_json::Value) -> serde_json::Value {
    match &params["arguments"] {
        serde_json::Value::Null => serde_json::json!({}),
        other => other.clone(),
    }
}

/// Backend results already have protocol shape; wrapped API results get a
/// text rendering plus the structured value.
fn tool_payload(payload: serde_json::Value) -> serde_json::Value {
    if payload["content"].is_array() {
        return payload;
    }
    serde_json::json!({
        "content": [{"type": "text", "text": payload.to_string()}],
        "structuredContent": payload,
    })
}

/// Rebuild a prompt's argument list from its object schema.
fn prompt_arguments(schema: &serde_json::Value) -> Vec<serde_json::Value> {
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    schema["properties"]
        .as_object()
        .map(|props| {
            props
                .iter()
                .map(|(name, prop)| {
                    let mut arg = serde_json::json!({
                        "name": name,
                        "required": required.contains(&name.as_str()),
                    });
                    if let Some(description) = prop["description"].as_str() {
                        arg["description"] = serde_json::Value::String(description.to_string());
                    }
                    arg
                })
                .collect()
        })
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
