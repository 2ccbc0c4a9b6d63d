//! Dispatcher — routes invocations to their resolved target.
//!
//! Resolution goes through the [`Registry`]; execution goes either to a
//! [`BackendSession`] or to a wrapped endpoint's adapter. Side-effect-free
//! capabilities get a bounded retry on transient failures, as long as the
//! backoff delay still fits before the deadline. Everything else surfaces on
//! the first failure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::time::Instant;

use super::backoff::BackoffPolicy;
use super::errors::{ErrorKind, GatewayError};
use super::registry::{Registry, RegistryEntry, ResolverTarget};
use super::session::BackendSession;
use super::types::{InvocationRequest, InvocationResult, Outcome};

/// Live sessions by id, shared with the gateway.
pub type SessionTable = RwLock<HashMap<String, Arc<BackendSession>>>;

/// Per-request progress, emitted as debug events.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DispatchState {
    Pending,
    Resolving,
    Executing { attempt: u32 },
    Retrying { attempt: u32, delay_ms: u64 },
    Succeeded,
    Failed(ErrorKind),
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    sessions: Arc<SessionTable>,
    http: reqwest::Client,
    retry: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionTable>,
        http: reqwest::Client,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            registry,
            sessions,
            http,
            retry,
        }
    }

    /// Execute a request. Never fails outright: every outcome, including an
    /// unknown name, comes back as an [`InvocationResult`].
    pub async fn dispatch(&self, request: InvocationRequest) -> InvocationResult {
        let started = Instant::now();
        let trace = |state: DispatchState| {
            tracing::debug!(
                request_id = %request.request_id,
                name = %request.qualified_name,
                state = ?state,
                "dispatch"
            );
        };

        trace(DispatchState::Pending);
        trace(DispatchState::Resolving);

        let Some(entry) = self.registry.lookup(request.kind, &request.qualified_name) else {
            let suggestions = self.registry.snapshot().find_similar(
                request.kind,
                &request.qualified_name,
                3,
            );
            tracing::debug!(
                name = %request.qualified_name,
                kind = request.kind.as_str(),
                ?suggestions,
                "unknown capability"
            );
            let error = GatewayError::NotFound {
                name: request.qualified_name.clone(),
            };
            trace(DispatchState::Failed(error.kind()));
            return finish(&request, Outcome::Failed(error), 0, started);
        };

        let max_attempts = if entry.descriptor.read_only {
            1 + self.retry.max_attempts
        } else {
            1
        };
        let mut attempts = 0;

        loop {
            if Instant::now() >= request.deadline {
                let error = GatewayError::Timeout {
                    target: request.qualified_name.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                trace(DispatchState::Failed(error.kind()));
                return finish(&request, Outcome::Failed(error), attempts, started);
            }

            attempts += 1;
            trace(DispatchState::Executing { attempt: attempts });

            let error = match self.execute(&entry, &request).await {
                Ok(payload) => {
                    trace(DispatchState::Succeeded);
                    return finish(&request, Outcome::Succeeded(payload), attempts, started);
                }
                Err(e) => e,
            };

            if error.is_transient() && attempts < max_attempts {
                let delay = self.retry.delay_for(attempts);
                if Instant::now() + delay < request.deadline {
                    tracing::warn!(
                        name = %request.qualified_name,
                        attempt = attempts,
                        error = %error,
                        "transient failure, retrying"
                    );
                    trace(DispatchState::Retrying {
                        attempt: attempts,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            trace(DispatchState::Failed(error.kind()));
            return finish(&request, Outcome::Failed(error), attempts, started);
        }
    }

    async fn execute(
        &self,
        entry: &RegistryEntry,
        request: &InvocationRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        match &entry.target {
            ResolverTarget::Backend { session_id } => {
                let session = self
                    .sessions
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(session_id)
                    .cloned()
                    .ok_or_else(|| GatewayError::Disconnected {
                        session: session_id.clone(),
                    })?;
                session
                    .invoke(
                        entry.descriptor.kind,
                        &entry.descriptor.raw_name,
                        request.arguments.clone(),
                        request.deadline,
                    )
                    .await
            }
            ResolverTarget::WrappedApi(adapter) => {
                adapter
                    .invoke(&self.http, &request.arguments, request.deadline)
                    .await
            }
        }
    }
}

fn finish(
    request: &InvocationRequest,
    outcome: Outcome,
    attempts: u32,
    started: Instant,
) -> InvocationResult {
    InvocationResult {
        request_id: request.request_id.clone(),
        qualified_name: request.qualified_name.clone(),
        outcome,
        attempts,
        latency: started.elapsed(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::federation::config::SessionSettings;
    use crate::federation::testing::{MockBackend, MockReply};
    use crate::federation::types::CapabilityKind;
    use tokio::sync::broadcast;

    struct Harness {
        dispatcher: Dispatcher,
        backend: Arc<MockBackend>,
    }

    /// One connected backend "notes" exposing `lookup` (read-only) and
    /// `create` (side-effecting).
    async fn harness() -> Harness {
        let backend = MockBackend::new("notes");
        backend.add_tool(serde_json::json!({
            "name": "lookup",
            "annotations": {"readOnlyHint": true},
        }));
        backend.add_tool(serde_json::json!({"name": "create"}));

        let registry = Arc::new(Registry::new());
        let sessions: Arc<SessionTable> = Arc::default();
        let session = BackendSession::new(
            "notes",
            backend.transport(),
            SessionSettings::default(),
            4,
            registry.clone(),
            broadcast::channel(8).0,
        );
        session.connect().await.unwrap();
        sessions
            .write()
            .unwrap()
            .insert("notes".to_string(), session);

        Harness {
            dispatcher: Dispatcher::new(
                registry,
                sessions,
                reqwest::Client::new(),
                BackoffPolicy::retry(),
            ),
            backend,
        }
    }

    fn call(name: &str, timeout: Duration) -> InvocationRequest {
        InvocationRequest::with_timeout(CapabilityKind::Tool, name, serde_json::json!({}), timeout)
    }

    fn reset() -> MockReply {
        MockReply::Fail(GatewayError::Connection {
            target: "notes".into(),
            reason: "connection reset".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_carries_tags() {
        let h = harness().await;
        let request = call("create", Duration::from_secs(5));
        let request_id = request.request_id.clone();

        let result = h.dispatcher.dispatch(request).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.request_id, request_id);
        assert_eq!(result.qualified_name, "create");
        assert_eq!(result.payload().unwrap()["content"][0]["text"], "create ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_name_is_not_found() {
        let h = harness().await;
        let result = h.dispatcher.dispatch(call("missing", Duration::from_secs(5))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_retries_transient_failure() {
        let h = harness().await;
        h.backend.script("tools/call:lookup", reset());

        let result = h.dispatcher.dispatch(call("lookup", Duration::from_secs(5))).await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.attempts, 2);
        assert_eq!(h.backend.count("tools/call"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_side_effecting_never_retried() {
        let h = harness().await;
        h.backend.script("tools/call:create", reset());

        let result = h.dispatcher.dispatch(call("create", Duration::from_secs(5))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        assert_eq!(result.attempts, 1);
        assert_eq!(h.backend.count("tools/call"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bounded() {
        let h = harness().await;
        for _ in 0..3 {
            h.backend.script("tools/call:lookup", reset());
        }

        let result = h.dispatcher.dispatch(call("lookup", Duration::from_secs(5))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_not_retried() {
        let h = harness().await;
        h.backend.script(
            "tools/call:lookup",
            MockReply::Error(-32000, "no such note".into()),
        );

        let result = h.dispatcher.dispatch(call("lookup", Duration::from_secs(5))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Remote));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_when_delay_overruns_deadline() {
        let h = harness().await;
        h.backend.script("tools/call:lookup", reset());

        // Retry backoff is ~100ms; only 50ms remain.
        let result = h.dispatcher.dispatch(call("lookup", Duration::from_millis(50))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_latency_matches_deadline() {
        let h = harness().await;
        h.backend.script("tools/call:create", MockReply::Hang);

        let result = h.dispatcher.dispatch(call("create", Duration::from_secs(2))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(result.attempts, 1);
        assert!(result.latency >= Duration::from_secs(2));
        assert!(result.latency < Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_session_is_connection_error() {
        let h = harness().await;
        h.dispatcher.sessions.write().unwrap().clear();

        let result = h.dispatcher.dispatch(call("create", Duration::from_secs(5))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
    }
}
